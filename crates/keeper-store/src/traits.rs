use std::fmt;
use std::hash::{Hash, Hasher};
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use keeper_types::Key;
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};

/// Lazy sequence of keys produced by [`Storage::keys`].
pub type KeyIter<'a> = Box<dyn Iterator<Item = StoreResult<Key>> + 'a>;

/// Read access to a stored blob.
pub type BlobReader = Box<dyn Read + Send>;

/// Write access to a blob, which becomes visible only once finished.
pub type BlobWriter = Box<dyn BlobWrite>;

/// A write target whose bytes are committed by [`BlobWrite::finish`].
///
/// Dropping a writer without finishing it abandons the write; nothing
/// becomes visible under the addressed key.
pub trait BlobWrite: Write + Send {
    /// Flush everything written so far and commit it durably.
    fn finish(self: Box<Self>) -> StoreResult<()>;
}

/// Opaque identifier of an uncommitted temp write target.
///
/// Clones share consumption state, so a handle that has been promoted or
/// discarded through any clone is rejected when used again.
#[derive(Clone)]
pub struct TempHandle {
    id: Uuid,
    consumed: Arc<AtomicBool>,
}

impl TempHandle {
    /// Allocate a fresh, process-unique handle.
    pub fn new() -> Self {
        Self {
            id: Uuid::now_v7(),
            consumed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn is_consumed(&self) -> bool {
        self.consumed.load(Ordering::Acquire)
    }

    /// Mark the handle as consumed by a promote or discard.
    pub fn consume(&self) -> StoreResult<()> {
        if self.consumed.swap(true, Ordering::AcqRel) {
            return Err(StoreError::TempConsumed(self.clone()));
        }
        Ok(())
    }

    /// Undo [`TempHandle::consume`] after the consuming operation failed,
    /// leaving the handle valid for a later discard.
    pub fn release(&self) {
        self.consumed.store(false, Ordering::Release);
    }
}

impl Default for TempHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for TempHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for TempHandle {}

impl Hash for TempHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for TempHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TempHandle({})", self.id)
    }
}

impl fmt::Display for TempHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

/// A temp write target together with its handle.
pub struct TempTarget {
    handle: TempHandle,
    writer: BlobWriter,
}

impl TempTarget {
    pub fn new(handle: TempHandle, writer: BlobWriter) -> Self {
        Self { handle, writer }
    }

    pub fn handle(&self) -> &TempHandle {
        &self.handle
    }

    /// Commit the written bytes to the temp area and return the handle for
    /// a later promote or discard.
    pub fn finish(self) -> StoreResult<TempHandle> {
        self.writer.finish()?;
        Ok(self.handle)
    }
}

impl Write for TempTarget {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.writer.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

impl fmt::Debug for TempTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TempTarget").field("handle", &self.handle).finish()
    }
}

/// Blob storage capability shared by every backend and decorator.
///
/// A stored value is a metadata blob and a data blob addressed by the same
/// key. Implementations must satisfy these invariants:
/// - A key is present exactly when its metadata blob exists, and data is
///   always committed before metadata, so a present key always has data.
/// - Temp targets never appear in [`Storage::keys`].
/// - Once [`Storage::close`] returns, every other operation fails with
///   [`StoreError::Closed`].
/// - All I/O errors are propagated, never silently ignored.
pub trait Storage: Send + Sync {
    /// All keys currently present.
    fn keys(&self) -> StoreResult<KeyIter<'_>>;

    fn open_meta_for_write(&self, key: &Key) -> StoreResult<BlobWriter>;

    /// Fails with [`StoreError::NotFound`] if the key has no metadata.
    fn open_meta_for_read(&self, key: &Key) -> StoreResult<BlobReader>;

    fn open_data_for_write(&self, key: &Key) -> StoreResult<BlobWriter>;

    /// Fails with [`StoreError::NotFound`] if the key has no data.
    fn open_data_for_read(&self, key: &Key) -> StoreResult<BlobReader>;

    /// Open a new temp target, invisible to [`Storage::keys`].
    fn create_temp(&self) -> StoreResult<TempTarget>;

    /// Read back a finished temp target.
    fn open_temp_for_read(&self, handle: &TempHandle) -> StoreResult<BlobReader>;

    /// Atomically make a finished temp target the data blob of `key`.
    ///
    /// On failure the handle stays valid and can still be discarded.
    fn promote_temp(&self, handle: &TempHandle, key: &Key) -> StoreResult<()>;

    /// Release a temp target without promoting it.
    fn discard_temp(&self, handle: &TempHandle) -> StoreResult<()>;

    /// Delete both blobs of `key`.
    fn remove(&self, key: &Key) -> StoreResult<()>;

    fn close(&self) -> StoreResult<()>;

    fn is_closed(&self) -> bool;

    /// Whether `key` is present.
    fn contains(&self, key: &Key) -> StoreResult<bool> {
        match self.open_meta_for_read(key) {
            Ok(_) => Ok(true),
            Err(StoreError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Read the whole metadata blob.
    fn read_meta(&self, key: &Key) -> StoreResult<Vec<u8>> {
        let mut buf = Vec::new();
        self.open_meta_for_read(key)?.read_to_end(&mut buf)?;
        Ok(buf)
    }

    /// Read the whole data blob.
    fn read_data(&self, key: &Key) -> StoreResult<Vec<u8>> {
        let mut buf = Vec::new();
        self.open_data_for_read(key)?.read_to_end(&mut buf)?;
        Ok(buf)
    }

    fn write_meta(&self, key: &Key, bytes: &[u8]) -> StoreResult<()> {
        let mut writer = self.open_meta_for_write(key)?;
        writer.write_all(bytes)?;
        writer.finish()
    }

    fn write_data(&self, key: &Key, bytes: &[u8]) -> StoreResult<()> {
        let mut writer = self.open_data_for_write(key)?;
        writer.write_all(bytes)?;
        writer.finish()
    }

    /// Write `bytes` into a new finished temp target.
    fn write_temp(&self, bytes: &[u8]) -> StoreResult<TempHandle> {
        let mut target = self.create_temp()?;
        target.write_all(bytes)?;
        target.finish()
    }

    /// Filesystem location of a key's data blob, for backends that have one.
    ///
    /// The file must not be modified through this path.
    fn data_path(&self, _key: &Key) -> Option<PathBuf> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_are_unique() {
        let a = TempHandle::new();
        let b = TempHandle::new();
        assert_ne!(a, b);
        assert_ne!(a.to_string(), b.to_string());
    }

    #[test]
    fn consume_twice_fails() {
        let handle = TempHandle::new();
        handle.consume().unwrap();
        assert!(handle.is_consumed());
        assert!(matches!(handle.consume(), Err(StoreError::TempConsumed(_))));
    }

    #[test]
    fn clones_share_consumption() {
        let handle = TempHandle::new();
        let clone = handle.clone();
        clone.consume().unwrap();
        assert!(handle.is_consumed());
        assert_eq!(handle, clone);
    }

    #[test]
    fn release_makes_handle_usable_again() {
        let handle = TempHandle::new();
        handle.consume().unwrap();
        handle.release();
        handle.consume().unwrap();
    }
}
