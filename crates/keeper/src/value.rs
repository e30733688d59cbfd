use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use keeper_store::{BlobReader, Storage};
use keeper_types::{Key, ValueMeta};

use crate::error::KeeperResult;
use crate::text::{self, UTF8};

enum Source {
    /// Held by the pending registry, not yet durable.
    Pending(Bytes),
    Stored {
        storage: Arc<dyn Storage>,
        path: Option<PathBuf>,
    },
}

/// A value returned by [`Keeper::get`](crate::Keeper::get).
///
/// Metadata is read eagerly; the data of a stored value is read from the
/// storage each time an accessor asks for it.
pub struct Value {
    key: Key,
    meta: ValueMeta,
    source: Source,
}

impl Value {
    pub(crate) fn pending(key: Key, meta: ValueMeta, data: Bytes) -> Self {
        Self {
            key,
            meta,
            source: Source::Pending(data),
        }
    }

    pub(crate) fn stored(key: Key, meta: ValueMeta, storage: Arc<dyn Storage>) -> Self {
        let path = storage.data_path(&key);
        Self {
            key,
            meta,
            source: Source::Stored { storage, path },
        }
    }

    pub fn key(&self) -> &Key {
        &self.key
    }

    pub fn meta(&self) -> &ValueMeta {
        &self.meta
    }

    /// Length of the data in bytes.
    pub fn len(&self) -> u64 {
        self.meta.length()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.source, Source::Pending(_))
    }

    pub fn as_bytes(&self) -> KeeperResult<Bytes> {
        match &self.source {
            Source::Pending(data) => Ok(data.clone()),
            Source::Stored { storage, .. } => Ok(Bytes::from(storage.read_data(&self.key)?)),
        }
    }

    pub fn as_reader(&self) -> KeeperResult<BlobReader> {
        match &self.source {
            Source::Pending(data) => Ok(Box::new(Cursor::new(data.clone()))),
            Source::Stored { storage, .. } => Ok(storage.open_data_for_read(&self.key)?),
        }
    }

    /// Decode the data with the recorded encoding, UTF-8 if none was recorded.
    pub fn as_string(&self) -> KeeperResult<String> {
        let encoding = self.meta.encoding().unwrap_or(UTF8);
        text::decode(&self.as_bytes()?, encoding)
    }

    /// Filesystem location of the data, for durable values of file-backed
    /// storage. The file must be treated as read-only.
    pub fn path(&self) -> Option<&Path> {
        match &self.source {
            Source::Pending(_) => None,
            Source::Stored { path, .. } => path.as_deref(),
        }
    }
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Value")
            .field("key", &self.key)
            .field("meta", &self.meta)
            .field("pending", &self.is_pending())
            .finish()
    }
}
