//! Versioned backing files
//!
//! A logical file name such as `data.events` maps to physical files
//! `data.events.00000001`, `data.events.00000002`, ... and the highest
//! suffix is the live version. Replacing a file means writing a staged
//! file and publishing it as the next version, so readers never observe a
//! half-written file. Retired versions are deleted once the last handle
//! opened through the store is released.
//!
//! The engine only talks to the [`BackingStore`] trait; [`FileStore`] is the
//! directory-backed implementation.

use dashmap::DashMap;
use parking_lot::Mutex;
use quill_common::{Error, Result};
use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Width of the zero padded version suffix
pub const VERSION_DIGITS: usize = 8;

/// Buffer size for append and read handles
const IO_BUFFER_SIZE: usize = 64 * 1024;

/// Append target handed out by a [`BackingStore`]
pub trait AppendFile: Send + 'static {
    /// Offset the next appended byte will land at
    fn position(&self) -> u64;

    /// Append bytes; they may stay buffered until [`AppendFile::sync`]
    fn append(&mut self, buf: &[u8]) -> Result<()>;

    /// Push buffered bytes to stable storage
    fn sync(&mut self) -> Result<()>;

    /// Cut the file to `len` bytes and continue appending from there
    fn truncate(&mut self, len: u64) -> Result<()>;
}

/// Pluggable file layer used by the storage engine
pub trait BackingStore: Send + Sync + 'static {
    type Append: AppendFile;
    type Read: Read + Seek + Send + 'static;

    /// Open the latest version of `name` for append, creating version 1
    fn open_append(&self, name: &str) -> Result<Self::Append>;

    /// Open the latest version of `name` for reading
    fn open_read(&self, name: &str) -> Result<Self::Read>;

    /// Create (or truncate) the unversioned staging file `name`
    fn create_staged(&self, name: &str) -> Result<Self::Append>;

    /// Atomically publish staged file `staged` as the next version of
    /// `target`. Returns the new physical name.
    fn stage_and_publish(&self, staged: &str, target: &str) -> Result<String>;

    /// Delete physical file `physical` once every handle on it is released
    fn delete_on_close(&self, physical: &str) -> Result<()>;

    /// Block until everything appended to `file` is durable
    fn flush(&self, file: &mut Self::Append) -> Result<()> {
        file.sync()
    }

    /// True if any version of `name` exists
    fn exists(&self, name: &str) -> Result<bool>;

    /// Remove the unversioned file `name` if present
    fn delete_if_exists(&self, name: &str) -> Result<()>;

    /// Physical name of the latest version of `name`
    fn latest_physical_name(&self, name: &str) -> Result<String>;
}

/// Physical name of version `version` of `name`
#[must_use]
pub fn versioned_name(name: &str, version: u32) -> String {
    format!("{name}.{version:0width$}", width = VERSION_DIGITS)
}

/// Version number encoded in `physical` if it is a version of `name`
#[must_use]
pub fn parse_version(name: &str, physical: &str) -> Option<u32> {
    let suffix = physical.strip_prefix(name)?.strip_prefix('.')?;
    if suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    suffix.parse().ok()
}

/// Open-handle bookkeeping behind `delete_on_close`
#[derive(Default)]
struct HandleRegistry {
    state: Mutex<RegistryState>,
}

#[derive(Default)]
struct RegistryState {
    open: HashMap<PathBuf, usize>,
    retired: HashSet<PathBuf>,
}

impl HandleRegistry {
    fn acquire(self: &Arc<Self>, path: &Path) -> HandleGuard {
        *self.state.lock().open.entry(path.to_path_buf()).or_insert(0) += 1;
        HandleGuard {
            path: path.to_path_buf(),
            registry: Arc::clone(self),
        }
    }

    fn release(&self, path: &Path) {
        let delete = {
            let mut state = self.state.lock();
            match state.open.get_mut(path) {
                Some(count) if *count > 1 => {
                    *count -= 1;
                    false
                }
                Some(_) => {
                    state.open.remove(path);
                    state.retired.remove(path)
                }
                None => false,
            }
        };
        if delete {
            remove_retired(path);
        }
    }

    /// Mark `path` retired. Returns true if nothing holds it open.
    fn retire(&self, path: &Path) -> bool {
        let mut state = self.state.lock();
        if state.open.contains_key(path) {
            state.retired.insert(path.to_path_buf());
            false
        } else {
            true
        }
    }
}

fn remove_retired(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!("Deleted retired file {:?}", path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to delete retired file {:?}: {}", path, e),
    }
}

/// Keeps a physical file registered as open
struct HandleGuard {
    path: PathBuf,
    registry: Arc<HandleRegistry>,
}

impl Drop for HandleGuard {
    fn drop(&mut self) {
        self.registry.release(&self.path);
    }
}

/// Buffered append handle on a local file
pub struct FileAppend {
    // Declared before the guard so the descriptor closes before a retired
    // file is removed.
    writer: BufWriter<File>,
    position: u64,
    _guard: HandleGuard,
}

impl AppendFile for FileAppend {
    fn position(&self) -> u64 {
        self.position
    }

    fn append(&mut self, buf: &[u8]) -> Result<()> {
        self.writer.write_all(buf)?;
        self.position += buf.len() as u64;
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(())
    }

    fn truncate(&mut self, len: u64) -> Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().set_len(len)?;
        self.writer.seek(SeekFrom::Start(len))?;
        self.writer.get_ref().sync_all()?;
        self.position = len;
        Ok(())
    }
}

/// Buffered read handle on a local file
pub struct FileRead {
    reader: BufReader<File>,
    _guard: HandleGuard,
}

impl Read for FileRead {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf)
    }
}

impl Seek for FileRead {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.reader.seek(pos)
    }
}

/// Directory-backed [`BackingStore`]
pub struct FileStore {
    dir: PathBuf,
    /// Cached latest physical name per logical name
    latest: DashMap<String, String>,
    handles: Arc<HandleRegistry>,
}

impl FileStore {
    /// Create a store rooted at `dir`, creating the directory if needed
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)
            .map_err(|e| Error::Storage(format!("failed to create data dir {:?}: {}", dir, e)))?;

        Ok(Self {
            dir,
            latest: DashMap::new(),
            handles: Arc::new(HandleRegistry::default()),
        })
    }

    /// Absolute path of a physical file
    #[must_use]
    pub fn path_of(&self, physical: &str) -> PathBuf {
        self.dir.join(physical)
    }

    /// Highest existing version of `name`
    fn scan_latest(&self, name: &str) -> Result<Option<u32>> {
        let mut latest = None;
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let file_name = entry.file_name();
            if let Some(version) = file_name.to_str().and_then(|f| parse_version(name, f)) {
                latest = latest.max(Some(version));
            }
        }
        Ok(latest)
    }

    fn sync_dir(&self) -> Result<()> {
        #[cfg(unix)]
        File::open(&self.dir)?.sync_all()?;
        Ok(())
    }
}

impl BackingStore for FileStore {
    type Append = FileAppend;
    type Read = FileRead;

    fn open_append(&self, name: &str) -> Result<FileAppend> {
        let path = self.path_of(&self.latest_physical_name(name)?);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| Error::Storage(format!("failed to open {:?} for append: {}", path, e)))?;

        let mut writer = BufWriter::with_capacity(IO_BUFFER_SIZE, file);
        let position = writer.seek(SeekFrom::End(0))?;
        debug!("Opened {:?} for append at offset {}", path, position);

        Ok(FileAppend {
            writer,
            position,
            _guard: self.handles.acquire(&path),
        })
    }

    fn open_read(&self, name: &str) -> Result<FileRead> {
        let path = self.path_of(&self.latest_physical_name(name)?);
        let file = File::open(&path)
            .map_err(|e| Error::Storage(format!("failed to open {:?} for read: {}", path, e)))?;

        Ok(FileRead {
            reader: BufReader::with_capacity(IO_BUFFER_SIZE, file),
            _guard: self.handles.acquire(&path),
        })
    }

    fn create_staged(&self, name: &str) -> Result<FileAppend> {
        let path = self.path_of(name);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| Error::Storage(format!("failed to create staged {:?}: {}", path, e)))?;

        Ok(FileAppend {
            writer: BufWriter::with_capacity(IO_BUFFER_SIZE, file),
            position: 0,
            _guard: self.handles.acquire(&path),
        })
    }

    fn stage_and_publish(&self, staged: &str, target: &str) -> Result<String> {
        let next = self.scan_latest(target)?.map_or(1, |v| v + 1);
        let published = versioned_name(target, next);

        fs::rename(self.path_of(staged), self.path_of(&published)).map_err(|e| {
            Error::Storage(format!("failed to publish {} as {}: {}", staged, published, e))
        })?;
        self.sync_dir()?;

        self.latest.insert(target.to_string(), published.clone());
        debug!("Published {} as {}", staged, published);
        Ok(published)
    }

    fn delete_on_close(&self, physical: &str) -> Result<()> {
        let path = self.path_of(physical);
        if self.handles.retire(&path) {
            match fs::remove_file(&path) {
                Ok(()) => debug!("Deleted {:?}", path),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        } else {
            debug!("Deferred deletion of {:?} until its handles close", path);
        }
        Ok(())
    }

    fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.scan_latest(name)?.is_some())
    }

    fn delete_if_exists(&self, name: &str) -> Result<()> {
        match fs::remove_file(self.path_of(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn latest_physical_name(&self, name: &str) -> Result<String> {
        if let Some(cached) = self.latest.get(name) {
            return Ok(cached.clone());
        }
        let version = self.scan_latest(name)?.unwrap_or(1);
        let physical = versioned_name(name, version);
        self.latest.insert(name.to_string(), physical.clone());
        Ok(physical)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn read_all(mut reader: impl Read) -> Vec<u8> {
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).unwrap();
        buf
    }

    #[test]
    fn test_version_names() {
        assert_eq!(versioned_name("data.events", 1), "data.events.00000001");
        assert_eq!(versioned_name("data.events", 42), "data.events.00000042");

        assert_eq!(parse_version("data.events", "data.events.00000003"), Some(3));
        assert_eq!(parse_version("data.events", "data.events.compacting"), None);
        assert_eq!(parse_version("data.events", "data.events."), None);
        assert_eq!(parse_version("data.events", "data.offsets.00000001"), None);
        assert_eq!(parse_version("data.events", "data.events00000001"), None);
    }

    #[test]
    fn test_open_append_creates_first_version() {
        let dir = tempdir().unwrap();
        let store = FileStore::new(dir.path()).unwrap();

        assert!(!store.exists("data.events").unwrap());
        let mut file = store.open_append("data.events").unwrap();
        assert_eq!(file.position(), 0);

        file.append(b"hello").unwrap();
        store.flush(&mut file).unwrap();
        assert_eq!(file.position(), 5);

        assert!(store.exists("data.events").unwrap());
        assert_eq!(
            store.latest_physical_name("data.events").unwrap(),
            "data.events.00000001"
        );
        assert!(dir.path().join("data.events.00000001").exists());
    }

    #[test]
    fn test_reopen_appends_at_end() {
        let dir = tempdir().unwrap();
        let store = FileStore::new(dir.path()).unwrap();

        {
            let mut file = store.open_append("data.events").unwrap();
            file.append(b"abc").unwrap();
            file.sync().unwrap();
        }

        let mut file = store.open_append("data.events").unwrap();
        assert_eq!(file.position(), 3);
        file.append(b"def").unwrap();
        file.sync().unwrap();

        assert_eq!(read_all(store.open_read("data.events").unwrap()), b"abcdef");
    }

    #[test]
    fn test_publish_moves_to_next_version() {
        let dir = tempdir().unwrap();
        let store = FileStore::new(dir.path()).unwrap();

        let mut file = store.open_append("data.events").unwrap();
        file.append(b"old").unwrap();
        file.sync().unwrap();

        // Stray files that only share the prefix are not versions
        fs::write(dir.path().join("data.events.bak"), b"x").unwrap();

        let mut staged = store.create_staged("data.events.compacting").unwrap();
        staged.append(b"new").unwrap();
        store.flush(&mut staged).unwrap();
        drop(staged);

        let published = store
            .stage_and_publish("data.events.compacting", "data.events")
            .unwrap();
        assert_eq!(published, "data.events.00000002");
        assert_eq!(store.latest_physical_name("data.events").unwrap(), published);
        assert!(!dir.path().join("data.events.compacting").exists());

        assert_eq!(read_all(store.open_read("data.events").unwrap()), b"new");
    }

    #[test]
    fn test_reader_keeps_its_version() {
        let dir = tempdir().unwrap();
        let store = FileStore::new(dir.path()).unwrap();

        let mut file = store.open_append("data.events").unwrap();
        file.append(b"first").unwrap();
        file.sync().unwrap();
        drop(file);

        let old_reader = store.open_read("data.events").unwrap();

        let mut staged = store.create_staged("stage").unwrap();
        staged.append(b"second").unwrap();
        staged.sync().unwrap();
        drop(staged);
        store.stage_and_publish("stage", "data.events").unwrap();

        assert_eq!(read_all(old_reader), b"first");
    }

    #[test]
    fn test_delete_on_close_waits_for_handles() {
        let dir = tempdir().unwrap();
        let store = FileStore::new(dir.path()).unwrap();

        let mut file = store.open_append("data.events").unwrap();
        file.append(b"data").unwrap();
        file.sync().unwrap();
        drop(file);

        let old = store.latest_physical_name("data.events").unwrap();
        let reader = store.open_read("data.events").unwrap();

        store.delete_on_close(&old).unwrap();
        assert!(dir.path().join(&old).exists());

        drop(reader);
        assert!(!dir.path().join(&old).exists());
    }

    #[test]
    fn test_delete_on_close_without_handles_is_immediate() {
        let dir = tempdir().unwrap();
        let store = FileStore::new(dir.path()).unwrap();

        let mut file = store.open_append("data.offsets").unwrap();
        file.sync().unwrap();
        drop(file);

        store.delete_on_close("data.offsets.00000001").unwrap();
        assert!(!dir.path().join("data.offsets.00000001").exists());

        // Deleting something already gone is fine
        store.delete_on_close("data.offsets.00000001").unwrap();
    }

    #[test]
    fn test_truncate() {
        let dir = tempdir().unwrap();
        let store = FileStore::new(dir.path()).unwrap();

        let mut file = store.open_append("data.events").unwrap();
        file.append(b"0123456789").unwrap();
        file.truncate(4).unwrap();
        assert_eq!(file.position(), 4);
        file.append(b"xy").unwrap();
        file.sync().unwrap();

        assert_eq!(read_all(store.open_read("data.events").unwrap()), b"0123xy");
    }

    #[test]
    fn test_delete_if_exists() {
        let dir = tempdir().unwrap();
        let store = FileStore::new(dir.path()).unwrap();

        store.delete_if_exists("missing").unwrap();
        fs::write(dir.path().join("scratch"), b"x").unwrap();
        store.delete_if_exists("scratch").unwrap();
        assert!(!dir.path().join("scratch").exists());
    }
}
