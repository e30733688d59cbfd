//! Foundation types for Keeper, a content-addressable blob store.
//!
//! Every other Keeper crate depends on `keeper-types`.
//!
//! # Key Types
//!
//! - [`Key`] -- content-derived identifier (BLAKE3 of data ++ serialized metadata)
//! - [`KeyHasher`] -- incremental key derivation for streamed payloads
//! - [`ValueMeta`] -- immutable metadata record stored beside each value
//! - [`MetaOptions`] -- caller-supplied metadata for a write
//! - [`MetaValue`] -- scalar attribute value

pub mod error;
pub mod key;
pub mod meta;

pub use error::TypeError;
pub use key::{Key, KeyHasher, KEY_HEX_LEN, KEY_LEN};
pub use meta::{MetaOptions, MetaValue, ValueMeta, DEFAULT_ATTRIBUTES};
