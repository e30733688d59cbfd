use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use keeper_types::{Key, KEY_HEX_LEN};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::{StoreError, StoreResult};
use crate::traits::{BlobReader, BlobWrite, BlobWriter, KeyIter, Storage, TempHandle, TempTarget};

/// Default number of one-character directory levels a key is split into.
pub const DEFAULT_SHARD_LEVELS: usize = 4;

/// File extension of metadata blobs.
pub const META_EXTENSION: &str = "meta";

const TEMP_AREA: &str = "temp";
const META_AREA: &str = "meta";
const DATA_AREA: &str = "data";

/// Durable, sharded directory-tree storage.
///
/// On-disk layout under the root:
/// ```text
/// temp/<uuid>                          uncommitted write targets
/// meta/<k0>/<k1>/<k2>/<k3>/<rest>.meta metadata blobs
/// data/<k0>/<k1>/<k2>/<k3>/<rest>      data blobs
/// ```
///
/// Every write lands in `temp/` first, is flushed and fsynced, and is then
/// renamed into place with the destination directory fsynced afterwards.
/// Anything still in `temp/` when the storage is opened belongs to a write
/// that never completed, so the area is wiped on construction.
pub struct FileStorage {
    root: PathBuf,
    temp_root: PathBuf,
    meta_root: PathBuf,
    data_root: PathBuf,
    levels: usize,
    closed: AtomicBool,
}

impl FileStorage {
    /// Open (or create) a storage rooted at `root` with the default sharding.
    pub fn open(root: impl AsRef<Path>) -> StoreResult<Self> {
        Self::with_levels(root, DEFAULT_SHARD_LEVELS)
    }

    /// Open (or create) a storage that shards keys over `levels` directories.
    ///
    /// Fails with [`StoreError::StructuralConflict`] if the root or one of
    /// its areas exists but is not a directory.
    pub fn with_levels(root: impl AsRef<Path>, levels: usize) -> StoreResult<Self> {
        if levels >= KEY_HEX_LEN {
            return Err(StoreError::InvalidInput(format!(
                "shard depth {levels} leaves no remainder of a {KEY_HEX_LEN}-character key"
            )));
        }
        let root = root.as_ref().to_path_buf();
        debug!(root = %root.display(), levels, "opening file storage");

        ensure_directory(&root, "root")?;

        let temp_root = root.join(TEMP_AREA);
        let meta_root = root.join(META_AREA);
        let data_root = root.join(DATA_AREA);

        clear_temp_area(&temp_root)?;

        ensure_directory(&temp_root, TEMP_AREA)?;
        ensure_directory(&meta_root, META_AREA)?;
        ensure_directory(&data_root, DATA_AREA)?;

        Ok(Self {
            root,
            temp_root,
            meta_root,
            data_root,
            levels,
            closed: AtomicBool::new(false),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn levels(&self) -> usize {
        self.levels
    }

    fn check_open(&self) -> StoreResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }

    fn relative_key_path(&self, key: &Key) -> PathBuf {
        let hex = key.to_hex();
        let mut path = PathBuf::new();
        for i in 0..self.levels {
            path.push(&hex[i..=i]);
        }
        path.push(&hex[self.levels..]);
        path
    }

    fn meta_path(&self, key: &Key) -> PathBuf {
        self.meta_root
            .join(self.relative_key_path(key))
            .with_extension(META_EXTENSION)
    }

    fn data_file_path(&self, key: &Key) -> PathBuf {
        self.data_root.join(self.relative_key_path(key))
    }

    fn temp_path(&self, handle: &TempHandle) -> PathBuf {
        self.temp_root.join(handle.id().to_string())
    }

    /// A writer into a fresh temp file that is renamed to `destination` on
    /// finish, or stays in the temp area when `destination` is `None`.
    fn temp_writer(&self, handle: &TempHandle, destination: Option<PathBuf>) -> StoreResult<SyncedFileWriter> {
        let path = self.temp_path(handle);
        let file = OpenOptions::new().write(true).create_new(true).open(&path)?;
        Ok(SyncedFileWriter {
            file: BufWriter::new(file),
            path,
            destination,
        })
    }

    fn open_reader(path: &Path, missing: impl FnOnce() -> StoreError) -> StoreResult<BlobReader> {
        match File::open(path) {
            Ok(file) => Ok(Box::new(BufReader::new(file))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(missing()),
            Err(e) => Err(e.into()),
        }
    }

    fn key_from_meta_path(meta_root: &Path, path: &Path) -> Option<Key> {
        let relative = path.strip_prefix(meta_root).ok()?;
        let mut hex = String::with_capacity(KEY_HEX_LEN + META_EXTENSION.len() + 1);
        for component in relative.components() {
            hex.push_str(component.as_os_str().to_str()?);
        }
        let hex = hex.strip_suffix(&format!(".{META_EXTENSION}"))?;
        Key::from_hex(hex).ok()
    }
}

impl Storage for FileStorage {
    fn keys(&self) -> StoreResult<KeyIter<'_>> {
        self.check_open()?;
        let meta_root = self.meta_root.clone();
        let iter = WalkDir::new(&self.meta_root)
            .min_depth(self.levels + 1)
            .max_depth(self.levels + 1)
            .into_iter()
            .filter_map(move |entry| match entry {
                Err(e) => Some(Err(StoreError::Io(e.into()))),
                Ok(entry) if !entry.file_type().is_file() => None,
                Ok(entry) => match Self::key_from_meta_path(&meta_root, entry.path()) {
                    Some(key) => Some(Ok(key)),
                    None => {
                        warn!(path = %entry.path().display(), "ignoring stray file in meta area");
                        None
                    }
                },
            });
        Ok(Box::new(iter))
    }

    fn open_meta_for_write(&self, key: &Key) -> StoreResult<BlobWriter> {
        self.check_open()?;
        let writer = self.temp_writer(&TempHandle::new(), Some(self.meta_path(key)))?;
        Ok(Box::new(writer))
    }

    fn open_meta_for_read(&self, key: &Key) -> StoreResult<BlobReader> {
        self.check_open()?;
        Self::open_reader(&self.meta_path(key), || StoreError::NotFound(*key))
    }

    fn open_data_for_write(&self, key: &Key) -> StoreResult<BlobWriter> {
        self.check_open()?;
        debug!(key = %key, "opening data for write");
        let writer = self.temp_writer(&TempHandle::new(), Some(self.data_file_path(key)))?;
        Ok(Box::new(writer))
    }

    fn open_data_for_read(&self, key: &Key) -> StoreResult<BlobReader> {
        self.check_open()?;
        Self::open_reader(&self.data_file_path(key), || StoreError::NotFound(*key))
    }

    fn create_temp(&self) -> StoreResult<TempTarget> {
        self.check_open()?;
        let handle = TempHandle::new();
        let writer = self.temp_writer(&handle, None)?;
        debug!(handle = %handle, "created temp target");
        Ok(TempTarget::new(handle, Box::new(writer)))
    }

    fn open_temp_for_read(&self, handle: &TempHandle) -> StoreResult<BlobReader> {
        self.check_open()?;
        if handle.is_consumed() {
            return Err(StoreError::TempConsumed(handle.clone()));
        }
        Self::open_reader(&self.temp_path(handle), || StoreError::NoSuchTemp(handle.clone()))
    }

    fn promote_temp(&self, handle: &TempHandle, key: &Key) -> StoreResult<()> {
        self.check_open()?;
        handle.consume()?;
        let source = self.temp_path(handle);
        let destination = self.data_file_path(key);

        let outcome = (|| -> io::Result<()> {
            if let Some(parent) = destination.parent() {
                create_dirs_synced(parent)?;
            }
            fs::rename(&source, &destination)?;
            sync_parent(&destination)
        })();

        match outcome {
            Ok(()) => {
                debug!(handle = %handle, key = %key, "promoted temp target");
                Ok(())
            }
            Err(e) => {
                handle.release();
                if e.kind() == io::ErrorKind::NotFound && !source.exists() {
                    return Err(StoreError::NoSuchTemp(handle.clone()));
                }
                Err(e.into())
            }
        }
    }

    fn discard_temp(&self, handle: &TempHandle) -> StoreResult<()> {
        self.check_open()?;
        handle.consume()?;
        match fs::remove_file(self.temp_path(handle)) {
            Ok(()) => {
                debug!(handle = %handle, "discarded temp target");
                Ok(())
            }
            Err(e) => {
                handle.release();
                if e.kind() == io::ErrorKind::NotFound {
                    return Err(StoreError::NoSuchTemp(handle.clone()));
                }
                Err(e.into())
            }
        }
    }

    fn remove(&self, key: &Key) -> StoreResult<()> {
        self.check_open()?;
        debug!(key = %key, "removing key");

        let meta_path = self.meta_path(key);
        match fs::remove_file(&meta_path) {
            Ok(()) => sync_parent(&meta_path)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(StoreError::NotFound(*key)),
            Err(e) => return Err(e.into()),
        }

        // The key is logically gone once its metadata is; a data blob that
        // survives a failure from here on is unreachable.
        let data_path = self.data_file_path(key);
        match fs::remove_file(&data_path) {
            Ok(()) => sync_parent(&data_path)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!(key = %key, "data blob already missing during remove");
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    fn close(&self) -> StoreResult<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!(root = %self.root.display(), "file storage closed");
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn contains(&self, key: &Key) -> StoreResult<bool> {
        self.check_open()?;
        match fs::metadata(self.meta_path(key)) {
            Ok(m) => Ok(m.is_file()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn data_path(&self, key: &Key) -> Option<PathBuf> {
        Some(self.data_file_path(key))
    }
}

impl std::fmt::Debug for FileStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileStorage")
            .field("root", &self.root)
            .field("levels", &self.levels)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// File writer that fsyncs on finish and optionally renames into place.
struct SyncedFileWriter {
    file: BufWriter<File>,
    path: PathBuf,
    destination: Option<PathBuf>,
}

impl Write for SyncedFileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl BlobWrite for SyncedFileWriter {
    fn finish(self: Box<Self>) -> StoreResult<()> {
        let SyncedFileWriter {
            file,
            path,
            destination,
        } = *self;
        let file = file.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        drop(file);

        let Some(destination) = destination else {
            sync_parent(&path)?;
            return Ok(());
        };
        if let Some(parent) = destination.parent() {
            create_dirs_synced(parent)?;
        }
        if let Err(e) = fs::rename(&path, &destination) {
            let _ = fs::remove_file(&path);
            return Err(e.into());
        }
        sync_parent(&destination)?;
        Ok(())
    }
}

fn ensure_directory(path: &Path, area: &str) -> StoreResult<()> {
    match create_dirs_synced(path) {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists || path.exists() => {
            if path.is_dir() {
                Ok(())
            } else {
                Err(StoreError::StructuralConflict { area: area.to_owned() })
            }
        }
        Err(e) => Err(e.into()),
    }
}

fn clear_temp_area(temp_root: &Path) -> StoreResult<()> {
    match fs::symlink_metadata(temp_root) {
        Ok(m) if m.is_dir() => {
            fs::remove_dir_all(temp_root)?;
            debug!(path = %temp_root.display(), "cleared temp area");
            Ok(())
        }
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Create `dir` and any missing ancestors one level at a time, fsyncing the
/// parent of each so the new entries survive a crash. Returns the
/// directories this call created, outermost first.
fn create_dirs_synced(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut missing = Vec::new();
    let mut cursor = Some(dir);
    while let Some(path) = cursor {
        if path.as_os_str().is_empty() || path.is_dir() {
            break;
        }
        missing.push(path);
        cursor = path.parent();
    }

    let mut created = Vec::with_capacity(missing.len());
    for path in missing.into_iter().rev() {
        match fs::create_dir(path) {
            Ok(()) => created.push(path.to_path_buf()),
            // created concurrently; sync it all the same
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists && path.is_dir() => {}
            Err(e) => return Err(e),
        }
        sync_parent(path)?;
    }
    Ok(created)
}

fn sync_parent(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(parent) if parent.as_os_str().is_empty() => sync_dir(Path::new(".")),
        Some(parent) => sync_dir(parent),
        None => Ok(()),
    }
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    fn key(n: u8) -> Key {
        Key::derive(&[n], b"")
    }

    fn open_in(dir: &tempfile::TempDir) -> FileStorage {
        FileStorage::open(dir.path().join("keeper")).unwrap()
    }

    fn store_value(storage: &FileStorage, key: &Key, data: &[u8]) {
        storage.write_data(key, data).unwrap();
        storage.write_meta(key, b"{}").unwrap();
    }

    // -----------------------------------------------------------------------
    // Construction
    // -----------------------------------------------------------------------

    #[test]
    fn creates_missing_root_and_areas() {
        let dir = tempfile::tempdir().unwrap();
        let storage = open_in(&dir);
        for area in [TEMP_AREA, META_AREA, DATA_AREA] {
            assert!(storage.root().join(area).is_dir());
        }
        assert_eq!(storage.levels(), DEFAULT_SHARD_LEVELS);
    }

    #[test]
    fn opens_existing_directory() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("keeper").join(TEMP_AREA)).unwrap();
        open_in(&dir);
    }

    #[test]
    fn shard_directories_are_created_level_by_level() {
        let dir = tempfile::tempdir().unwrap();
        let leaf = dir.path().join("a").join("b").join("c");
        let created = create_dirs_synced(&leaf).unwrap();
        assert_eq!(
            created,
            vec![dir.path().join("a"), dir.path().join("a").join("b"), leaf.clone()]
        );
        assert!(leaf.is_dir());

        assert!(create_dirs_synced(&leaf).unwrap().is_empty());
        let sibling = dir.path().join("a").join("d");
        assert_eq!(create_dirs_synced(&sibling).unwrap(), vec![sibling.clone()]);
    }

    #[test]
    fn promote_creates_every_shard_level() {
        let dir = tempfile::tempdir().unwrap();
        let storage = open_in(&dir);
        let k = key(12);
        let handle = storage.write_temp(b"deep").unwrap();
        storage.promote_temp(&handle, &k).unwrap();

        let path = storage.data_path(&k).unwrap();
        let depth = path.strip_prefix(dir.path().join("keeper").join(DATA_AREA)).unwrap();
        assert_eq!(depth.components().count(), DEFAULT_SHARD_LEVELS + 1);
        assert_eq!(fs::read(path).unwrap(), b"deep");
    }

    #[test]
    fn root_occupied_by_file_is_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("keeper");
        File::create(&root).unwrap();
        let err = FileStorage::open(&root).unwrap_err();
        assert!(matches!(err, StoreError::StructuralConflict { ref area } if area == "root"));
    }

    #[test]
    fn area_occupied_by_file_is_conflict() {
        for area in [TEMP_AREA, META_AREA, DATA_AREA] {
            let dir = tempfile::tempdir().unwrap();
            let root = dir.path().join("keeper");
            fs::create_dir(&root).unwrap();
            File::create(root.join(area)).unwrap();
            let err = FileStorage::open(&root).unwrap_err();
            assert!(
                matches!(err, StoreError::StructuralConflict { area: ref a } if a == area),
                "area {area}: {err}"
            );
        }
    }

    #[test]
    fn shard_depth_must_leave_a_remainder() {
        let dir = tempfile::tempdir().unwrap();
        let err = FileStorage::with_levels(dir.path(), KEY_HEX_LEN).unwrap_err();
        assert!(matches!(err, StoreError::InvalidInput(_)));
        FileStorage::with_levels(dir.path(), KEY_HEX_LEN - 1).unwrap();
    }

    #[test]
    fn startup_wipes_abandoned_temp_targets() {
        let dir = tempfile::tempdir().unwrap();
        let storage = open_in(&dir);
        let mut target = storage.create_temp().unwrap();
        target.write_all(b"never promoted").unwrap();
        target.finish().unwrap();
        assert_eq!(fs::read_dir(storage.root().join(TEMP_AREA)).unwrap().count(), 1);
        drop(storage);

        let reopened = open_in(&dir);
        assert_eq!(fs::read_dir(reopened.root().join(TEMP_AREA)).unwrap().count(), 0);
        assert_eq!(reopened.keys().unwrap().count(), 0);
    }

    // -----------------------------------------------------------------------
    // Layout
    // -----------------------------------------------------------------------

    #[test]
    fn blobs_are_sharded_by_key_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let storage = open_in(&dir);
        let k = key(1);
        store_value(&storage, &k, b"payload");

        let hex = k.to_hex();
        let mut expected = storage.root().join(DATA_AREA);
        for c in hex[..4].chars() {
            expected.push(c.to_string());
        }
        expected.push(&hex[4..]);
        assert!(expected.is_file());

        let meta = storage
            .root()
            .join(META_AREA)
            .join(expected.strip_prefix(storage.root().join(DATA_AREA)).unwrap())
            .with_extension(META_EXTENSION);
        assert!(meta.is_file());
        assert_eq!(storage.data_path(&k), Some(expected));
    }

    #[test]
    fn custom_shard_depth() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::with_levels(dir.path(), 2).unwrap();
        let k = key(9);
        store_value(&storage, &k, b"two levels");
        let hex = k.to_hex();
        let path = dir.path().join(DATA_AREA).join(&hex[..1]).join(&hex[1..2]).join(&hex[2..]);
        assert!(path.is_file());
        assert_eq!(storage.keys().unwrap().map(Result::unwrap).collect::<Vec<_>>(), vec![k]);
    }

    // -----------------------------------------------------------------------
    // Read / write
    // -----------------------------------------------------------------------

    #[test]
    fn write_then_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let storage = open_in(&dir);
        let k = key(2);
        store_value(&storage, &k, b"hello");
        assert_eq!(storage.read_data(&k).unwrap(), b"hello");
        assert_eq!(storage.read_meta(&k).unwrap(), b"{}");
        assert!(storage.contains(&k).unwrap());
    }

    #[test]
    fn reading_unknown_key_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let storage = open_in(&dir);
        assert!(matches!(storage.open_meta_for_read(&key(3)), Err(StoreError::NotFound(_))));
        assert!(matches!(storage.open_data_for_read(&key(3)), Err(StoreError::NotFound(_))));
        assert!(!storage.contains(&key(3)).unwrap());
    }

    #[test]
    fn unfinished_meta_write_is_invisible() {
        let dir = tempfile::tempdir().unwrap();
        let storage = open_in(&dir);
        let k = key(4);
        let mut writer = storage.open_meta_for_write(&k).unwrap();
        writer.write_all(b"{\"partial\":").unwrap();
        assert!(!storage.contains(&k).unwrap());
        drop(writer);
        assert!(!storage.contains(&k).unwrap());
        assert_eq!(storage.keys().unwrap().count(), 0);
    }

    #[test]
    fn keys_lists_only_committed_values() {
        let dir = tempfile::tempdir().unwrap();
        let storage = open_in(&dir);
        let expected: HashSet<Key> = (0..5).map(key).collect();
        for k in &expected {
            store_value(&storage, k, k.as_bytes());
        }
        let mut pending = storage.create_temp().unwrap();
        pending.write_all(b"temp").unwrap();
        pending.finish().unwrap();
        fs::write(storage.root().join(META_AREA).join("stray.txt"), b"x").unwrap();

        let listed: HashSet<Key> = storage.keys().unwrap().map(Result::unwrap).collect();
        assert_eq!(listed, expected);
        // restartable
        assert_eq!(storage.keys().unwrap().count(), 5);
    }

    // -----------------------------------------------------------------------
    // Temp targets
    // -----------------------------------------------------------------------

    #[test]
    fn promote_makes_temp_addressable() {
        let dir = tempfile::tempdir().unwrap();
        let storage = open_in(&dir);
        let mut target = storage.create_temp().unwrap();
        target.write_all(b"streamed").unwrap();
        let handle = target.finish().unwrap();

        let mut read_back = Vec::new();
        std::io::Read::read_to_end(&mut storage.open_temp_for_read(&handle).unwrap(), &mut read_back).unwrap();
        assert_eq!(read_back, b"streamed");

        let k = key(5);
        storage.promote_temp(&handle, &k).unwrap();
        assert_eq!(storage.read_data(&k).unwrap(), b"streamed");
        // not yet present until metadata exists
        assert!(!storage.contains(&k).unwrap());
    }

    #[test]
    fn promote_twice_is_duplicate_consumption() {
        let dir = tempfile::tempdir().unwrap();
        let storage = open_in(&dir);
        let handle = storage.write_temp(b"x").unwrap();
        storage.promote_temp(&handle, &key(6)).unwrap();
        assert!(matches!(
            storage.promote_temp(&handle, &key(6)),
            Err(StoreError::TempConsumed(_))
        ));
        assert!(matches!(storage.discard_temp(&handle), Err(StoreError::TempConsumed(_))));
    }

    #[test]
    fn promote_unknown_handle_is_no_such_temp() {
        let dir = tempfile::tempdir().unwrap();
        let storage = open_in(&dir);
        let stranger = TempHandle::new();
        assert!(matches!(
            storage.promote_temp(&stranger, &key(7)),
            Err(StoreError::NoSuchTemp(_))
        ));
        // the failed promote left the handle unconsumed
        assert!(!stranger.is_consumed());
        assert!(matches!(storage.discard_temp(&stranger), Err(StoreError::NoSuchTemp(_))));
    }

    #[test]
    fn discard_twice_is_duplicate_consumption() {
        let dir = tempfile::tempdir().unwrap();
        let storage = open_in(&dir);
        let handle = storage.write_temp(b"gone").unwrap();
        storage.discard_temp(&handle).unwrap();
        assert!(matches!(storage.discard_temp(&handle), Err(StoreError::TempConsumed(_))));
        assert!(matches!(
            storage.open_temp_for_read(&handle),
            Err(StoreError::TempConsumed(_))
        ));
    }

    #[test]
    fn concurrent_promotes_of_same_key() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(open_in(&dir));
        let k = key(8);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let storage = Arc::clone(&storage);
                thread::spawn(move || {
                    let handle = storage.write_temp(b"same content").unwrap();
                    storage.promote_temp(&handle, &k).unwrap();
                })
            })
            .collect();
        for h in handles {
            h.join().expect("thread should not panic");
        }
        storage.write_meta(&k, b"{}").unwrap();

        assert_eq!(storage.read_data(&k).unwrap(), b"same content");
        assert_eq!(storage.keys().unwrap().count(), 1);
        assert_eq!(fs::read_dir(storage.root().join(TEMP_AREA)).unwrap().count(), 0);
    }

    // -----------------------------------------------------------------------
    // Remove / close
    // -----------------------------------------------------------------------

    #[test]
    fn remove_deletes_both_blobs() {
        let dir = tempfile::tempdir().unwrap();
        let storage = open_in(&dir);
        let k = key(10);
        store_value(&storage, &k, b"bye");
        let data_path = storage.data_path(&k).unwrap();

        storage.remove(&k).unwrap();
        assert!(!storage.contains(&k).unwrap());
        assert!(!data_path.exists());
        assert!(matches!(storage.remove(&k), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn remove_tolerates_missing_data_blob() {
        let dir = tempfile::tempdir().unwrap();
        let storage = open_in(&dir);
        let k = key(11);
        store_value(&storage, &k, b"orphan");
        fs::remove_file(storage.data_path(&k).unwrap()).unwrap();
        storage.remove(&k).unwrap();
        assert!(!storage.contains(&k).unwrap());
    }

    #[test]
    fn closed_storage_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let storage = open_in(&dir);
        let k = key(12);
        store_value(&storage, &k, b"x");
        storage.close().unwrap();
        assert!(storage.is_closed());

        assert!(matches!(storage.keys(), Err(StoreError::Closed)));
        assert!(matches!(storage.open_data_for_read(&k), Err(StoreError::Closed)));
        assert!(matches!(storage.open_meta_for_write(&k), Err(StoreError::Closed)));
        assert!(matches!(storage.create_temp(), Err(StoreError::Closed)));
        assert!(matches!(storage.contains(&k), Err(StoreError::Closed)));
        assert!(matches!(storage.remove(&k), Err(StoreError::Closed)));
        // closing again is harmless
        storage.close().unwrap();
    }

    #[test]
    fn values_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let k = key(13);
        {
            let storage = open_in(&dir);
            store_value(&storage, &k, b"durable");
            storage.close().unwrap();
        }
        let storage = open_in(&dir);
        assert_eq!(storage.read_data(&k).unwrap(), b"durable");
    }
}
