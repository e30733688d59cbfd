use std::collections::{HashMap, HashSet};
use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use keeper_store::{
    FileStorage, Storage, StoreError, StoreResult, TempHandle, WorkerPool, WriteCacheStorage,
};
use keeper_types::{Key, KeyHasher, MetaOptions, ValueMeta};
use tracing::{debug, info, warn};

use crate::config::KeeperConfig;
use crate::error::{KeeperError, KeeperResult};
use crate::payload::Payload;
use crate::pending::{PendingRegistry, Withdrawal};
use crate::stream::{BufferedStream, WriteableStream};
use crate::text::{is_utf8, UTF8};
use crate::value::Value;

/// Content-addressable blob store.
///
/// Values are addressed by the BLAKE3 digest of their data followed by
/// their serialized metadata, so writing the same value twice yields the
/// same key and stores it once.
///
/// All operations take `&self`; share a `Keeper` between threads with an
/// `Arc` or scoped threads.
pub struct Keeper {
    storage: Arc<dyn Storage>,
    /// Storages closed by [`Keeper::close`], outermost first.
    layers: Vec<Arc<dyn Storage>>,
    cache: Option<Arc<WriteCacheStorage>>,
    pending: Arc<PendingRegistry>,
    flusher: WorkerPool,
    read_chunk_size: usize,
    closed: AtomicBool,
}

impl Keeper {
    /// Open a keeper over file storage at `config.root`, fronted by a
    /// write-back cache when `config.write_cache` is set.
    pub fn open(config: &KeeperConfig) -> KeeperResult<Self> {
        config.validate()?;
        let file: Arc<dyn Storage> =
            Arc::new(FileStorage::with_levels(&config.root, config.shard_levels)?);

        let (storage, layers, cache) = match &config.write_cache {
            Some(cache_config) => {
                let cache = Arc::new(WriteCacheStorage::new(Arc::clone(&file), cache_config.workers)?);
                let outer: Arc<dyn Storage> = cache.clone();
                (Arc::clone(&outer), vec![outer, file], Some(cache))
            }
            None => (Arc::clone(&file), vec![file], None),
        };

        info!(
            root = %config.root.display(),
            cached = cache.is_some(),
            "keeper opened"
        );
        Self::assemble(storage, layers, cache, config)
    }

    /// Open a keeper over an existing storage, which it closes on
    /// [`Keeper::close`]. Only the stream-related settings of `config` apply.
    pub fn with_storage(storage: Arc<dyn Storage>, config: &KeeperConfig) -> KeeperResult<Self> {
        config.validate()?;
        if storage.is_closed() {
            return Err(KeeperError::Closed);
        }
        let layers = vec![Arc::clone(&storage)];
        Self::assemble(storage, layers, None, config)
    }

    fn assemble(
        storage: Arc<dyn Storage>,
        layers: Vec<Arc<dyn Storage>>,
        cache: Option<Arc<WriteCacheStorage>>,
        config: &KeeperConfig,
    ) -> KeeperResult<Self> {
        Ok(Self {
            storage,
            layers,
            cache,
            pending: Arc::default(),
            flusher: WorkerPool::new("keeper-flush", config.flush_workers)?,
            read_chunk_size: config.read_chunk_size,
            closed: AtomicBool::new(false),
        })
    }

    pub(crate) fn check_open(&self) -> KeeperResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(KeeperError::Closed);
        }
        Ok(())
    }

    // ---- Writes ----

    /// Store a payload and return its key.
    ///
    /// Text is stored as UTF-8; giving text an explicit encoding other than
    /// UTF-8 fails with [`KeeperError::InvalidInput`]. Nothing is written if
    /// the value is already present.
    pub fn put(&self, payload: impl Into<Payload>, options: MetaOptions) -> KeeperResult<Key> {
        self.check_open()?;
        let (data, meta) = match payload.into() {
            Payload::Bytes(data) => {
                let meta = ValueMeta::new(data.len() as u64, options)?;
                (data, meta)
            }
            Payload::Text(text) => {
                if let Some(encoding) = options.encoding() {
                    if !is_utf8(encoding) {
                        return Err(KeeperError::InvalidInput(format!(
                            "text is stored as {UTF8}, cannot store it as {encoding}"
                        )));
                    }
                }
                let data = Bytes::from(text.into_bytes());
                let meta = ValueMeta::with_encoding(data.len() as u64, options, Some(UTF8.to_owned()))?;
                (data, meta)
            }
        };

        let meta_bytes = meta.to_bytes()?;
        let key = Key::derive(&data, &meta_bytes);
        if self.is_present(&key)? {
            debug!(key = %key, "value already present");
            return Ok(key);
        }

        self.storage.write_data(&key, &data)?;
        self.storage.write_meta(&key, &meta_bytes)?;
        debug!(key = %key, length = data.len(), "stored value");
        Ok(key)
    }

    /// Start a streaming write backed by a storage temp target.
    pub fn add_stream(&self, options: MetaOptions) -> KeeperResult<WriteableStream<'_>> {
        self.check_open()?;
        ValueMeta::new(0, options.clone())?;
        let target = self.storage.create_temp()?;
        debug!(handle = %target.handle(), "stream opened");
        Ok(WriteableStream::new(self, options, target))
    }

    /// Start a streaming write that buffers in memory and is persisted in
    /// the background after close.
    pub fn add_buffered_stream(&self, options: MetaOptions) -> KeeperResult<BufferedStream<'_>> {
        self.check_open()?;
        ValueMeta::new(0, options.clone())?;
        Ok(BufferedStream::new(self, options))
    }

    // ---- Reads ----

    pub fn get(&self, key: &Key) -> KeeperResult<Value> {
        self.check_open()?;
        if let Some((meta, data)) = self.pending.get(key) {
            return Ok(Value::pending(*key, meta, data));
        }
        let meta = ValueMeta::from_bytes(&self.storage.read_meta(key)?)?;
        Ok(Value::stored(*key, meta, Arc::clone(&self.storage)))
    }

    pub fn contains(&self, key: &Key) -> KeeperResult<bool> {
        self.check_open()?;
        self.is_present(key)
    }

    /// All present keys, pending ones first, each exactly once.
    pub fn keys(&self) -> KeeperResult<Box<dyn Iterator<Item = KeeperResult<Key>> + '_>> {
        self.check_open()?;
        let pending = self.pending.keys();
        let seen: HashSet<Key> = pending.iter().copied().collect();
        let durable = self.storage.keys()?.filter_map(move |item| match item {
            Ok(key) if seen.contains(&key) => None,
            Ok(key) => Some(Ok(key)),
            Err(e) => Some(Err(e.into())),
        });
        Ok(Box::new(pending.into_iter().map(Ok).chain(durable)))
    }

    pub fn len(&self) -> KeeperResult<usize> {
        let mut count = 0;
        for key in self.keys()? {
            key?;
            count += 1;
        }
        Ok(count)
    }

    pub fn is_empty(&self) -> KeeperResult<bool> {
        Ok(self.keys()?.next().transpose()?.is_none())
    }

    // ---- Deletes ----

    /// Remove a value. Fails with [`KeeperError::NotFound`] if it is absent.
    ///
    /// A buffered value whose flush has not started is cancelled; one that
    /// is being flushed is waited for and then removed from storage.
    pub fn delete(&self, key: &Key) -> KeeperResult<()> {
        self.check_open()?;
        match self.pending.withdraw(key) {
            Withdrawal::Absent => self.storage.remove(key)?,
            Withdrawal::Cancelled | Withdrawal::Settled => match self.storage.remove(key) {
                Ok(()) | Err(StoreError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            },
        }
        debug!(key = %key, "deleted value");
        Ok(())
    }

    // ---- Lifecycle ----

    /// Keys whose background persistence failed, with the reason.
    pub fn flush_failures(&self) -> HashMap<Key, String> {
        let mut failures = self.pending.failures();
        if let Some(cache) = &self.cache {
            failures.extend(cache.flush_failures());
        }
        failures
    }

    /// Drain background persistence, then close the storage layers.
    ///
    /// Closing twice is a no-op.
    pub fn close(&self) -> KeeperResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.flusher.shutdown();
        let mut first_error = None;
        for layer in &self.layers {
            if let Err(e) = layer.close() {
                warn!(error = %e, "failed to close storage layer");
                first_error.get_or_insert(e);
            }
        }
        info!("keeper closed");
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    // ---- Stream support ----

    fn is_present(&self, key: &Key) -> KeeperResult<bool> {
        Ok(self.pending.contains(key) || self.storage.contains(key)?)
    }

    /// Derive the key of a finished temp target by reading it back in chunks.
    pub(crate) fn digest_temp(&self, handle: &TempHandle, length: u64, meta_bytes: &[u8]) -> KeeperResult<Key> {
        let mut reader = self.storage.open_temp_for_read(handle)?;
        let chunk = usize::try_from(length).map_or(self.read_chunk_size, |len| len.clamp(1, self.read_chunk_size));
        let mut buf = vec![0u8; chunk];
        let mut hasher = KeyHasher::new();
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    hasher.update(&buf[..n]);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        hasher.update(meta_bytes);
        Ok(hasher.finalize())
    }

    /// Promote a temp target under `key`, or discard it if the value exists.
    pub(crate) fn commit_temp(&self, handle: &TempHandle, key: &Key, meta_bytes: &[u8]) -> KeeperResult<()> {
        if self.pending.contains(key) {
            debug!(key = %key, "stream duplicates a pending value");
            self.storage.discard_temp(handle)?;
            return Ok(());
        }
        commit_temp_to(self.storage.as_ref(), handle, key, meta_bytes)?;
        Ok(())
    }

    pub(crate) fn discard_quietly(&self, handle: &TempHandle) {
        if let Err(e) = self.storage.discard_temp(handle) {
            debug!(handle = %handle, error = %e, "could not discard temp target");
        }
    }

    /// Register a buffered value and queue its persistence.
    pub(crate) fn enqueue_pending(&self, meta: ValueMeta, data: Bytes) -> KeeperResult<Key> {
        let meta_bytes = Bytes::from(meta.to_bytes()?);
        let key = Key::derive(&data, &meta_bytes);
        if self.is_present(&key)? || !self.pending.insert(key, meta, meta_bytes, data) {
            debug!(key = %key, "value already present");
            return Ok(key);
        }

        let storage = Arc::clone(&self.storage);
        let pending = Arc::clone(&self.pending);
        let submitted = self.flusher.submit(move || {
            let Some((meta_bytes, data)) = pending.begin_flush(&key) else {
                debug!(key = %key, "pending flush cancelled");
                return;
            };
            let outcome = storage
                .write_temp(&data)
                .and_then(|handle| commit_temp_to(storage.as_ref(), &handle, &key, &meta_bytes));
            match &outcome {
                Ok(()) => debug!(key = %key, "pending value persisted"),
                Err(e) => warn!(key = %key, error = %e, "pending flush failed"),
            }
            pending.finish_flush(&key, outcome.map_err(|e| e.to_string()));
        });
        if let Err(e) = submitted {
            self.pending.forget(&key);
            return Err(e.into());
        }
        debug!(key = %key, "pending value queued");
        Ok(key)
    }
}

/// Data first, then metadata: a key becomes present only once its data is
/// durable.
fn commit_temp_to(storage: &dyn Storage, handle: &TempHandle, key: &Key, meta_bytes: &[u8]) -> StoreResult<()> {
    if storage.contains(key)? {
        debug!(key = %key, "discarding duplicate temp target");
        return storage.discard_temp(handle);
    }
    if let Err(e) = storage.promote_temp(handle, key) {
        if let Err(discard) = storage.discard_temp(handle) {
            warn!(handle = %handle, error = %discard, "could not discard temp after failed promote");
        }
        return Err(e);
    }
    storage.write_meta(key, meta_bytes)
}

impl Drop for Keeper {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "error closing keeper on drop");
        }
    }
}

impl std::fmt::Debug for Keeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keeper")
            .field("layers", &self.layers.len())
            .field("cached", &self.cache.is_some())
            .field("pending", &self.pending.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}
