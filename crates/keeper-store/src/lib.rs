//! Storage backends for Keeper.
//!
//! Every stored value is a pair of blobs (metadata and data) addressed by a
//! content-derived [`Key`](keeper_types::Key). This crate defines the
//! [`Storage`] capability and its implementations.
//!
//! # Storage Backends
//!
//! All backends implement the [`Storage`] trait:
//!
//! - [`FileStorage`] -- durable, sharded directory tree with an atomic
//!   write/fsync/rename protocol
//! - [`InMemoryStorage`] -- `HashMap`-based storage for tests and embedding
//! - [`WriteCacheStorage`] -- write-back decorator that buffers data blobs in
//!   memory and flushes them to another `Storage` in the background
//!
//! # Design Rules
//!
//! 1. Data is committed before metadata; a key is present once its metadata is.
//! 2. Writes become visible only when their writer is finished.
//! 3. Temp targets never leak into the key space.
//! 4. A closed storage fails every operation with [`StoreError::Closed`].
//! 5. All I/O errors are propagated, never silently ignored.

pub mod cache;
pub mod error;
pub mod file;
pub mod memory;
pub mod pool;
pub mod refcount;
pub mod traits;

// Re-export primary types at crate root for ergonomic imports.
pub use cache::{WriteCacheStorage, DEFAULT_CACHE_WORKERS};
pub use error::{StoreError, StoreResult};
pub use file::{FileStorage, DEFAULT_SHARD_LEVELS, META_EXTENSION};
pub use memory::InMemoryStorage;
pub use pool::WorkerPool;
pub use refcount::{RefCount, RefCountError};
pub use traits::{BlobReader, BlobWrite, BlobWriter, KeyIter, Storage, TempHandle, TempTarget};
