use std::collections::{HashMap, HashSet};
use std::io::{self, Cursor, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use bytes::Bytes;
use keeper_types::Key;
use tracing::{debug, warn};

use crate::error::{StoreError, StoreResult};
use crate::pool::WorkerPool;
use crate::refcount::RefCount;
use crate::traits::{BlobReader, BlobWrite, BlobWriter, KeyIter, Storage, TempHandle, TempTarget};

/// Default number of flush workers of a [`WriteCacheStorage`].
pub const DEFAULT_CACHE_WORKERS: usize = 4;

struct CachedBlob {
    bytes: Bytes,
    /// Metadata written while the data was buffered. It reaches the inner
    /// storage only after a flush of the data succeeds.
    meta: Option<Bytes>,
    /// One reference per flush job still owed for this entry.
    refs: RefCount,
    /// Distinguishes this entry from a later one for the same key, so a
    /// late flush never releases a buffer it did not publish.
    generation: u64,
}

#[derive(Default)]
struct CacheMaps {
    data: HashMap<Key, CachedBlob>,
    /// `None` while the temp target is still being written.
    temps: HashMap<TempHandle, Option<Bytes>>,
    failures: HashMap<Key, String>,
    /// Flush jobs currently writing to the inner storage, per generation.
    in_flight: HashMap<u64, usize>,
    /// Held metadata of entries removed while one of their flushes was in
    /// flight.
    removed: HashMap<u64, Option<Bytes>>,
    next_generation: u64,
}

impl CacheMaps {
    fn publish(&mut self, key: Key, bytes: Bytes) -> StoreResult<u64> {
        self.failures.remove(&key);
        if let Some(entry) = self.data.get_mut(&key) {
            entry.refs.increment()?;
            entry.bytes = bytes;
            return Ok(entry.generation);
        }
        let generation = self.next_generation;
        self.next_generation += 1;
        let mut refs = RefCount::new();
        refs.increment()?;
        self.data.insert(
            key,
            CachedBlob {
                bytes,
                meta: None,
                refs,
                generation,
            },
        );
        Ok(generation)
    }

    fn live(&self, key: &Key, generation: u64) -> Option<&CachedBlob> {
        self.data.get(key).filter(|entry| entry.generation == generation)
    }

    fn release(&mut self, key: &Key, generation: u64) -> StoreResult<()> {
        let Some(entry) = self.data.get_mut(key) else {
            return Ok(());
        };
        if entry.generation != generation {
            return Ok(());
        }
        if entry.refs.decrement()? {
            self.data.remove(key);
        }
        Ok(())
    }

    /// Buffered metadata, if the key's data is still buffered.
    fn held_meta(&self, key: &Key) -> Option<Bytes> {
        self.data.get(key).and_then(|entry| entry.meta.clone())
    }

    /// Metadata that a successful flush of `generation` must write through.
    fn take_meta(&mut self, key: &Key, generation: u64) -> Option<Bytes> {
        match self.data.get_mut(key) {
            Some(entry) if entry.generation == generation => entry.meta.take(),
            _ => self.removed.get_mut(&generation).and_then(Option::take),
        }
    }

    fn finish_job(&mut self, generation: u64) {
        if let Some(count) = self.in_flight.get_mut(&generation) {
            *count -= 1;
            if *count == 0 {
                self.in_flight.remove(&generation);
                self.removed.remove(&generation);
            }
        }
    }
}

/// In-memory state of the cache plus the signal its flush jobs raise when
/// they settle.
#[derive(Default)]
struct Buffers {
    maps: Mutex<CacheMaps>,
    settled: Condvar,
}

impl Buffers {
    fn lock(&self) -> MutexGuard<'_, CacheMaps> {
        self.maps.lock().expect("cache lock poisoned")
    }

    /// Claim a flush job. `false` if its entry was removed before it ran.
    fn begin(&self, key: &Key, generation: u64) -> bool {
        let mut maps = self.lock();
        if maps.live(key, generation).is_none() {
            return false;
        }
        *maps.in_flight.entry(generation).or_insert(0) += 1;
        true
    }

    fn settle(&self, inner: &dyn Storage, key: Key, generation: u64, outcome: StoreResult<()>) {
        let mut maps = self.lock();
        let live = maps.live(&key, generation).is_some();
        match outcome {
            Ok(()) => {
                debug!(key = %key, "cache flush complete");
                if live {
                    maps.failures.remove(&key);
                }
                if let Some(meta) = maps.take_meta(&key, generation) {
                    if let Err(e) = inner.write_meta(&key, &meta) {
                        warn!(key = %key, error = %e, "metadata write-through failed");
                        maps.failures.insert(key, e.to_string());
                    }
                }
            }
            Err(e) => {
                warn!(key = %key, error = %e, "cache flush failed");
                if live {
                    maps.failures.insert(key, e.to_string());
                }
            }
        }
        maps.finish_job(generation);
        if let Err(e) = maps.release(&key, generation) {
            warn!(key = %key, error = %e, "cache reference count misuse");
        }
        drop(maps);
        self.settled.notify_all();
    }
}

/// How a buffered blob reaches the inner storage.
#[derive(Clone, Copy, Debug)]
enum FlushRoute {
    /// `open_data_for_write` on the inner storage.
    Direct,
    /// A temp target of the inner storage, then promote.
    Promote,
}

#[derive(Clone)]
struct Shared {
    inner: Arc<dyn Storage>,
    buffers: Arc<Buffers>,
    pool: Arc<WorkerPool>,
    closed: Arc<AtomicBool>,
}

impl Shared {
    fn check_open(&self) -> StoreResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, CacheMaps> {
        self.buffers.lock()
    }

    /// Make `bytes` readable under `key` and queue their flush.
    fn publish(&self, key: Key, bytes: Bytes, route: FlushRoute) -> StoreResult<()> {
        let generation = self.lock().publish(key, bytes.clone())?;

        let inner = Arc::clone(&self.inner);
        let buffers = Arc::clone(&self.buffers);
        let submitted = self.pool.submit(move || {
            if !buffers.begin(&key, generation) {
                debug!(key = %key, "cache flush skipped for removed entry");
                return;
            }
            let outcome = flush(inner.as_ref(), &key, &bytes, route);
            buffers.settle(inner.as_ref(), key, generation, outcome);
        });
        if let Err(e) = submitted {
            self.lock().release(&key, generation)?;
            return Err(e);
        }
        debug!(key = %key, ?route, "queued cache flush");
        Ok(())
    }

    /// Hold metadata until the key's buffered data is flushed, or write it
    /// through when the data is already in the inner storage.
    fn store_meta(&self, key: Key, bytes: Bytes) -> StoreResult<()> {
        let mut maps = self.lock();
        if let Some(entry) = maps.data.get_mut(&key) {
            entry.meta = Some(bytes);
            return Ok(());
        }
        if let Some(reason) = maps.failures.get(&key) {
            return Err(StoreError::FlushFailed {
                key,
                reason: reason.clone(),
            });
        }
        // held across the check and the write, so no flush settles between
        self.inner.open_data_for_read(&key)?;
        self.inner.write_meta(&key, &bytes)
    }
}

fn flush(inner: &dyn Storage, key: &Key, bytes: &[u8], route: FlushRoute) -> StoreResult<()> {
    match route {
        FlushRoute::Direct => inner.write_data(key, bytes),
        FlushRoute::Promote => {
            let handle = inner.write_temp(bytes)?;
            if let Err(e) = inner.promote_temp(&handle, key) {
                if let Err(discard) = inner.discard_temp(&handle) {
                    warn!(handle = %handle, error = %discard, "could not discard temp after failed promote");
                }
                return Err(e);
            }
            Ok(())
        }
    }
}

/// Write-back cache in front of another [`Storage`].
///
/// Data blobs written through the cache are published to an in-memory map
/// and flushed to the inner storage by a worker pool. A buffer stays
/// readable until its last flush has completed, so a read issued right after
/// a write always sees the written bytes.
///
/// Metadata for a buffered key is held next to its data and written to the
/// inner storage only once a flush of that data succeeds. If every flush of
/// the entry fails, the metadata is dropped with it: the key is absent and
/// the failure is reported by [`WriteCacheStorage::flush_failures`].
/// Removing a key cancels its queued flushes and waits for running ones.
///
/// Closing the cache drains pending flushes but leaves the inner storage
/// open.
pub struct WriteCacheStorage {
    shared: Shared,
}

impl WriteCacheStorage {
    pub fn new(inner: Arc<dyn Storage>, workers: usize) -> StoreResult<Self> {
        if inner.is_closed() {
            return Err(StoreError::Closed);
        }
        let pool = WorkerPool::new("keeper-cache", workers)?;
        Ok(Self {
            shared: Shared {
                inner,
                buffers: Arc::default(),
                pool: Arc::new(pool),
                closed: Arc::new(AtomicBool::new(false)),
            },
        })
    }

    pub fn inner(&self) -> &Arc<dyn Storage> {
        &self.shared.inner
    }

    /// Number of data blobs still held in memory.
    pub fn buffered_count(&self) -> usize {
        self.shared.lock().data.len()
    }

    /// Keys whose most recent flush failed, with the failure reason.
    pub fn flush_failures(&self) -> HashMap<Key, String> {
        self.shared.lock().failures.clone()
    }

    fn cached(&self, key: &Key) -> Option<Bytes> {
        self.shared.lock().data.get(key).map(|entry| entry.bytes.clone())
    }

    fn writer(&self, slot: CacheSlot) -> BlobWriter {
        Box::new(CacheWriter {
            buf: Vec::new(),
            slot,
            shared: self.shared.clone(),
        })
    }
}

impl Storage for WriteCacheStorage {
    fn keys(&self) -> StoreResult<KeyIter<'_>> {
        self.shared.check_open()?;
        let buffered: Vec<Key> = self
            .shared
            .lock()
            .data
            .iter()
            .filter(|(_, entry)| entry.meta.is_some())
            .map(|(key, _)| *key)
            .collect();
        let seen: HashSet<Key> = buffered.iter().copied().collect();
        let durable = self.shared.inner.keys()?.filter(move |item| match item {
            Ok(key) => !seen.contains(key),
            Err(_) => true,
        });
        Ok(Box::new(buffered.into_iter().map(Ok).chain(durable)))
    }

    fn open_meta_for_write(&self, key: &Key) -> StoreResult<BlobWriter> {
        self.shared.check_open()?;
        Ok(self.writer(CacheSlot::Meta(*key)))
    }

    fn open_meta_for_read(&self, key: &Key) -> StoreResult<BlobReader> {
        self.shared.check_open()?;
        if let Some(meta) = self.shared.lock().held_meta(key) {
            return Ok(Box::new(Cursor::new(meta)));
        }
        self.shared.inner.open_meta_for_read(key)
    }

    fn open_data_for_write(&self, key: &Key) -> StoreResult<BlobWriter> {
        self.shared.check_open()?;
        Ok(self.writer(CacheSlot::Data(*key)))
    }

    fn open_data_for_read(&self, key: &Key) -> StoreResult<BlobReader> {
        self.shared.check_open()?;
        if let Some(bytes) = self.cached(key) {
            return Ok(Box::new(Cursor::new(bytes)));
        }
        match self.shared.inner.open_data_for_read(key) {
            Err(StoreError::NotFound(_)) => {
                // The buffer may have been published between the first
                // lookup and the inner miss.
                let maps = self.shared.lock();
                if let Some(entry) = maps.data.get(key) {
                    return Ok(Box::new(Cursor::new(entry.bytes.clone())));
                }
                if let Some(reason) = maps.failures.get(key) {
                    return Err(StoreError::FlushFailed {
                        key: *key,
                        reason: reason.clone(),
                    });
                }
                Err(StoreError::NotFound(*key))
            }
            other => other,
        }
    }

    fn create_temp(&self) -> StoreResult<TempTarget> {
        self.shared.check_open()?;
        let handle = TempHandle::new();
        self.shared.lock().temps.insert(handle.clone(), None);
        let writer = self.writer(CacheSlot::Temp(handle.clone()));
        Ok(TempTarget::new(handle, writer))
    }

    fn open_temp_for_read(&self, handle: &TempHandle) -> StoreResult<BlobReader> {
        self.shared.check_open()?;
        if handle.is_consumed() {
            return Err(StoreError::TempConsumed(handle.clone()));
        }
        match self.shared.lock().temps.get(handle) {
            Some(Some(bytes)) => Ok(Box::new(Cursor::new(bytes.clone()))),
            _ => Err(StoreError::NoSuchTemp(handle.clone())),
        }
    }

    fn promote_temp(&self, handle: &TempHandle, key: &Key) -> StoreResult<()> {
        self.shared.check_open()?;
        handle.consume()?;
        let bytes = {
            let mut maps = self.shared.lock();
            match maps.temps.remove(handle) {
                Some(Some(bytes)) => bytes,
                unfinished => {
                    if let Some(entry) = unfinished {
                        maps.temps.insert(handle.clone(), entry);
                    }
                    handle.release();
                    return Err(StoreError::NoSuchTemp(handle.clone()));
                }
            }
        };
        if let Err(e) = self.shared.publish(*key, bytes.clone(), FlushRoute::Promote) {
            self.shared.lock().temps.insert(handle.clone(), Some(bytes));
            handle.release();
            return Err(e);
        }
        Ok(())
    }

    fn discard_temp(&self, handle: &TempHandle) -> StoreResult<()> {
        self.shared.check_open()?;
        handle.consume()?;
        if self.shared.lock().temps.remove(handle).is_none() {
            handle.release();
            return Err(StoreError::NoSuchTemp(handle.clone()));
        }
        Ok(())
    }

    fn remove(&self, key: &Key) -> StoreResult<()> {
        self.shared.check_open()?;
        let buffered = {
            let mut maps = self.shared.lock();
            maps.failures.remove(key);
            match maps.data.remove(key) {
                None => false,
                Some(entry) => {
                    let generation = entry.generation;
                    if maps.in_flight.contains_key(&generation) {
                        // A running flush writes the held metadata through
                        // on success, so the inner removal below takes both
                        // blobs.
                        maps.removed.insert(generation, entry.meta);
                        while maps.in_flight.contains_key(&generation) {
                            maps = self
                                .shared
                                .buffers
                                .settled
                                .wait(maps)
                                .expect("cache lock poisoned");
                        }
                    }
                    true
                }
            }
        };
        match self.shared.inner.remove(key) {
            Err(StoreError::NotFound(_)) if buffered => Ok(()),
            other => other,
        }
    }

    fn close(&self) -> StoreResult<()> {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.shared.pool.shutdown();
        debug!("write cache closed");
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    fn contains(&self, key: &Key) -> StoreResult<bool> {
        self.shared.check_open()?;
        if self.shared.lock().held_meta(key).is_some() {
            return Ok(true);
        }
        self.shared.inner.contains(key)
    }

    fn data_path(&self, key: &Key) -> Option<PathBuf> {
        if self.shared.lock().data.contains_key(key) {
            return None;
        }
        self.shared.inner.data_path(key)
    }
}

impl std::fmt::Debug for WriteCacheStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteCacheStorage")
            .field("pool", &self.shared.pool)
            .field("buffered", &self.buffered_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

enum CacheSlot {
    Meta(Key),
    Data(Key),
    Temp(TempHandle),
}

struct CacheWriter {
    buf: Vec<u8>,
    slot: CacheSlot,
    shared: Shared,
}

impl Write for CacheWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl BlobWrite for CacheWriter {
    fn finish(self: Box<Self>) -> StoreResult<()> {
        let CacheWriter { buf, slot, shared } = *self;
        shared.check_open()?;
        let bytes = Bytes::from(buf);
        match slot {
            CacheSlot::Meta(key) => shared.store_meta(key, bytes),
            CacheSlot::Data(key) => shared.publish(key, bytes, FlushRoute::Direct),
            CacheSlot::Temp(handle) => match shared.lock().temps.get_mut(&handle) {
                Some(entry) => {
                    *entry = Some(bytes);
                    Ok(())
                }
                None => Err(StoreError::NoSuchTemp(handle)),
            },
        }
    }
}
