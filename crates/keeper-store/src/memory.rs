use std::collections::HashMap;
use std::io::{self, Cursor, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use keeper_types::Key;

use crate::error::{StoreError, StoreResult};
use crate::traits::{BlobReader, BlobWrite, BlobWriter, KeyIter, Storage, TempHandle, TempTarget};

#[derive(Default)]
struct MemoryState {
    meta: RwLock<HashMap<Key, Bytes>>,
    data: RwLock<HashMap<Key, Bytes>>,
    /// `None` while the temp target is still being written.
    temps: RwLock<HashMap<TempHandle, Option<Bytes>>>,
    closed: AtomicBool,
}

impl MemoryState {
    fn check_open(&self) -> StoreResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }
}

/// In-memory, HashMap-based storage.
///
/// Intended for tests and embedding. Blobs are held as [`Bytes`] behind
/// `RwLock`s, so reads hand out cheap clones of the stored buffer.
#[derive(Default)]
pub struct InMemoryStorage {
    state: Arc<MemoryState>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently present.
    pub fn len(&self) -> usize {
        self.state.meta.read().expect("lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total bytes across all data blobs.
    pub fn total_bytes(&self) -> u64 {
        self.state
            .data
            .read()
            .expect("lock poisoned")
            .values()
            .map(|b| b.len() as u64)
            .sum()
    }

    /// Number of temp targets neither promoted nor discarded.
    pub fn temp_count(&self) -> usize {
        self.state.temps.read().expect("lock poisoned").len()
    }

    fn writer(&self, slot: Slot) -> BlobWriter {
        Box::new(MemoryWriter {
            buf: Vec::new(),
            state: Arc::clone(&self.state),
            slot,
        })
    }
}

impl Storage for InMemoryStorage {
    fn keys(&self) -> StoreResult<KeyIter<'_>> {
        self.state.check_open()?;
        let keys: Vec<Key> = self.state.meta.read().expect("lock poisoned").keys().copied().collect();
        Ok(Box::new(keys.into_iter().map(Ok)))
    }

    fn open_meta_for_write(&self, key: &Key) -> StoreResult<BlobWriter> {
        self.state.check_open()?;
        Ok(self.writer(Slot::Meta(*key)))
    }

    fn open_meta_for_read(&self, key: &Key) -> StoreResult<BlobReader> {
        self.state.check_open()?;
        let map = self.state.meta.read().expect("lock poisoned");
        let bytes = map.get(key).cloned().ok_or(StoreError::NotFound(*key))?;
        Ok(Box::new(Cursor::new(bytes)))
    }

    fn open_data_for_write(&self, key: &Key) -> StoreResult<BlobWriter> {
        self.state.check_open()?;
        Ok(self.writer(Slot::Data(*key)))
    }

    fn open_data_for_read(&self, key: &Key) -> StoreResult<BlobReader> {
        self.state.check_open()?;
        let map = self.state.data.read().expect("lock poisoned");
        let bytes = map.get(key).cloned().ok_or(StoreError::NotFound(*key))?;
        Ok(Box::new(Cursor::new(bytes)))
    }

    fn create_temp(&self) -> StoreResult<TempTarget> {
        self.state.check_open()?;
        let handle = TempHandle::new();
        self.state
            .temps
            .write()
            .expect("lock poisoned")
            .insert(handle.clone(), None);
        let writer = self.writer(Slot::Temp(handle.clone()));
        Ok(TempTarget::new(handle, writer))
    }

    fn open_temp_for_read(&self, handle: &TempHandle) -> StoreResult<BlobReader> {
        self.state.check_open()?;
        if handle.is_consumed() {
            return Err(StoreError::TempConsumed(handle.clone()));
        }
        let temps = self.state.temps.read().expect("lock poisoned");
        match temps.get(handle) {
            Some(Some(bytes)) => Ok(Box::new(Cursor::new(bytes.clone()))),
            _ => Err(StoreError::NoSuchTemp(handle.clone())),
        }
    }

    fn promote_temp(&self, handle: &TempHandle, key: &Key) -> StoreResult<()> {
        self.state.check_open()?;
        handle.consume()?;
        let mut temps = self.state.temps.write().expect("lock poisoned");
        let bytes = match temps.get(handle) {
            Some(Some(bytes)) => bytes.clone(),
            _ => {
                handle.release();
                return Err(StoreError::NoSuchTemp(handle.clone()));
            }
        };
        temps.remove(handle);
        self.state.data.write().expect("lock poisoned").insert(*key, bytes);
        Ok(())
    }

    fn discard_temp(&self, handle: &TempHandle) -> StoreResult<()> {
        self.state.check_open()?;
        handle.consume()?;
        if self.state.temps.write().expect("lock poisoned").remove(handle).is_none() {
            handle.release();
            return Err(StoreError::NoSuchTemp(handle.clone()));
        }
        Ok(())
    }

    fn remove(&self, key: &Key) -> StoreResult<()> {
        self.state.check_open()?;
        if self.state.meta.write().expect("lock poisoned").remove(key).is_none() {
            return Err(StoreError::NotFound(*key));
        }
        self.state.data.write().expect("lock poisoned").remove(key);
        Ok(())
    }

    fn close(&self) -> StoreResult<()> {
        self.state.closed.store(true, Ordering::Release);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::Acquire)
    }

    fn contains(&self, key: &Key) -> StoreResult<bool> {
        self.state.check_open()?;
        Ok(self.state.meta.read().expect("lock poisoned").contains_key(key))
    }
}

impl std::fmt::Debug for InMemoryStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryStorage")
            .field("key_count", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

enum Slot {
    Meta(Key),
    Data(Key),
    Temp(TempHandle),
}

struct MemoryWriter {
    buf: Vec<u8>,
    state: Arc<MemoryState>,
    slot: Slot,
}

impl Write for MemoryWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl BlobWrite for MemoryWriter {
    fn finish(self: Box<Self>) -> StoreResult<()> {
        let MemoryWriter { buf, state, slot } = *self;
        state.check_open()?;
        let bytes = Bytes::from(buf);
        match slot {
            Slot::Meta(key) => {
                state.meta.write().expect("lock poisoned").insert(key, bytes);
            }
            Slot::Data(key) => {
                state.data.write().expect("lock poisoned").insert(key, bytes);
            }
            Slot::Temp(handle) => {
                let mut temps = state.temps.write().expect("lock poisoned");
                match temps.get_mut(&handle) {
                    Some(entry) => *entry = Some(bytes),
                    None => return Err(StoreError::NoSuchTemp(handle)),
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::thread;

    fn key(n: u8) -> Key {
        Key::derive(&[n], b"")
    }

    fn store_value(storage: &InMemoryStorage, key: &Key, data: &[u8]) {
        storage.write_data(key, data).unwrap();
        storage.write_meta(key, b"{}").unwrap();
    }

    // -----------------------------------------------------------------------
    // Core CRUD
    // -----------------------------------------------------------------------

    #[test]
    fn write_and_read_back() {
        let storage = InMemoryStorage::new();
        let k = key(1);
        store_value(&storage, &k, b"hello world");
        assert_eq!(storage.read_data(&k).unwrap(), b"hello world");
        assert_eq!(storage.read_meta(&k).unwrap(), b"{}");
        assert!(storage.contains(&k).unwrap());
        assert_eq!(storage.len(), 1);
        assert_eq!(storage.total_bytes(), 11);
    }

    #[test]
    fn read_missing_key_is_not_found() {
        let storage = InMemoryStorage::new();
        assert!(matches!(storage.read_data(&key(2)), Err(StoreError::NotFound(_))));
        assert!(matches!(storage.read_meta(&key(2)), Err(StoreError::NotFound(_))));
        assert!(!storage.contains(&key(2)).unwrap());
    }

    #[test]
    fn unfinished_writer_commits_nothing() {
        let storage = InMemoryStorage::new();
        let k = key(3);
        let mut writer = storage.open_data_for_write(&k).unwrap();
        writer.write_all(b"lost").unwrap();
        drop(writer);
        assert!(matches!(storage.read_data(&k), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn data_without_meta_is_not_present() {
        let storage = InMemoryStorage::new();
        let k = key(4);
        storage.write_data(&k, b"orphan").unwrap();
        assert!(!storage.contains(&k).unwrap());
        assert_eq!(storage.keys().unwrap().count(), 0);
    }

    #[test]
    fn keys_lists_present_values() {
        let storage = InMemoryStorage::new();
        let expected: HashSet<Key> = (10..15).map(key).collect();
        for k in &expected {
            store_value(&storage, k, b"v");
        }
        let listed: HashSet<Key> = storage.keys().unwrap().map(Result::unwrap).collect();
        assert_eq!(listed, expected);
    }

    #[test]
    fn remove_present_and_missing() {
        let storage = InMemoryStorage::new();
        let k = key(5);
        store_value(&storage, &k, b"bye");
        storage.remove(&k).unwrap();
        assert!(!storage.contains(&k).unwrap());
        assert!(matches!(storage.read_data(&k), Err(StoreError::NotFound(_))));
        assert!(matches!(storage.remove(&k), Err(StoreError::NotFound(_))));
        assert!(storage.is_empty());
    }

    // -----------------------------------------------------------------------
    // Temp targets
    // -----------------------------------------------------------------------

    #[test]
    fn temp_promote_and_consumption() {
        let storage = InMemoryStorage::new();
        let handle = storage.write_temp(b"temp bytes").unwrap();
        assert_eq!(storage.temp_count(), 1);

        let k = key(6);
        storage.promote_temp(&handle, &k).unwrap();
        assert_eq!(storage.read_data(&k).unwrap(), b"temp bytes");
        assert_eq!(storage.temp_count(), 0);
        assert!(matches!(
            storage.promote_temp(&handle, &k),
            Err(StoreError::TempConsumed(_))
        ));
        assert!(matches!(storage.discard_temp(&handle), Err(StoreError::TempConsumed(_))));
    }

    #[test]
    fn temp_discard() {
        let storage = InMemoryStorage::new();
        let handle = storage.write_temp(b"discard me").unwrap();
        storage.discard_temp(&handle).unwrap();
        assert_eq!(storage.temp_count(), 0);
        assert!(matches!(storage.discard_temp(&handle), Err(StoreError::TempConsumed(_))));
    }

    #[test]
    fn unknown_temp_handle() {
        let storage = InMemoryStorage::new();
        let stranger = TempHandle::new();
        assert!(matches!(
            storage.promote_temp(&stranger, &key(7)),
            Err(StoreError::NoSuchTemp(_))
        ));
        assert!(!stranger.is_consumed());
        assert!(matches!(
            storage.open_temp_for_read(&stranger),
            Err(StoreError::NoSuchTemp(_))
        ));
    }

    #[test]
    fn unfinished_temp_cannot_be_promoted() {
        let storage = InMemoryStorage::new();
        let mut target = storage.create_temp().unwrap();
        target.write_all(b"half").unwrap();
        let handle = target.handle().clone();
        assert!(matches!(
            storage.promote_temp(&handle, &key(8)),
            Err(StoreError::NoSuchTemp(_))
        ));
        target.finish().unwrap();
        storage.promote_temp(&handle, &key(8)).unwrap();
    }

    // -----------------------------------------------------------------------
    // Close
    // -----------------------------------------------------------------------

    #[test]
    fn closed_storage_rejects_everything() {
        let storage = InMemoryStorage::new();
        let k = key(9);
        let mut pending = storage.open_data_for_write(&k).unwrap();
        pending.write_all(b"late").unwrap();
        storage.close().unwrap();

        assert!(storage.is_closed());
        assert!(matches!(pending.finish(), Err(StoreError::Closed)));
        assert!(matches!(storage.keys(), Err(StoreError::Closed)));
        assert!(matches!(storage.contains(&k), Err(StoreError::Closed)));
        assert!(matches!(storage.create_temp(), Err(StoreError::Closed)));
        assert!(matches!(storage.remove(&k), Err(StoreError::Closed)));
    }

    // -----------------------------------------------------------------------
    // Concurrency
    // -----------------------------------------------------------------------

    #[test]
    fn concurrent_writers_and_readers() {
        let storage = Arc::new(InMemoryStorage::new());
        let handles: Vec<_> = (0..8u8)
            .map(|n| {
                let storage = Arc::clone(&storage);
                thread::spawn(move || {
                    let k = key(n);
                    store_value(&storage, &k, &[n; 16]);
                    assert_eq!(storage.read_data(&k).unwrap(), vec![n; 16]);
                })
            })
            .collect();
        for h in handles {
            h.join().expect("thread should not panic");
        }
        assert_eq!(storage.len(), 8);
    }

    #[test]
    fn debug_format() {
        let storage = InMemoryStorage::new();
        store_value(&storage, &key(1), b"x");
        let debug = format!("{storage:?}");
        assert!(debug.contains("InMemoryStorage"));
        assert!(debug.contains("key_count"));
    }
}
