//! Keeper: a content-addressable blob store.
//!
//! Callers hand [`Keeper`] a byte or text payload plus optional metadata and
//! get back a content-derived [`Key`] for later retrieval, membership tests
//! and deletion. Values live in a durable sharded directory tree
//! ([`keeper_store::FileStorage`]), optionally fronted by a write-back cache.
//!
//! ```no_run
//! use keeper::{Keeper, KeeperConfig, MetaOptions};
//!
//! let keeper = Keeper::open(&KeeperConfig::new("/tmp/keeper"))?;
//! let key = keeper.put("hello", MetaOptions::new().with_mime("text/plain"))?;
//! assert_eq!(keeper.get(&key)?.as_string()?, "hello");
//! # Ok::<(), keeper::KeeperError>(())
//! ```

pub mod config;
pub mod error;
pub mod keeper;
pub mod payload;
mod pending;
pub mod stream;
pub mod text;
pub mod value;

pub use config::{CacheConfig, KeeperConfig, DEFAULT_READ_CHUNK_SIZE};
pub use error::{KeeperError, KeeperResult};
pub use keeper::Keeper;
pub use payload::Payload;
pub use stream::{BufferedStream, WriteableStream};
pub use value::Value;

// Re-export key types
pub use keeper_types::{Key, MetaOptions, MetaValue, ValueMeta};
