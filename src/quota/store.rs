//! Storage backends for usage records.
//!
//! A backend holds exactly one record, at one location. It only needs to
//! support whole-record reads, whole-record atomic replacement, and an
//! exclusive lock held across a read-modify-write.

use std::{
    fs::{self, File, OpenOptions},
    io::{self, Write as _},
    sync::{
        Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use fs2::FileExt;

use crate::prelude::*;

/// Where a usage record lives.
pub trait StateStore: Send + Sync {
    /// A human-readable description of the location, for logs and errors.
    fn location(&self) -> &str;

    /// Read the raw record. Returns `Ok(None)` if no record exists yet.
    fn read(&self) -> io::Result<Option<Vec<u8>>>;

    /// Replace the record. Readers must see either the old record or the new
    /// one, never a mix.
    fn atomic_write(&self, bytes: &[u8]) -> io::Result<()>;

    /// Take an exclusive lock on the record. The lock is released when the
    /// returned guard is dropped.
    fn lock(&self) -> io::Result<StoreLock>;
}

/// Guard returned by [`StateStore::lock`].
#[derive(Debug)]
pub struct StoreLock {
    /// The lock file, for backends that lock through the filesystem. Closing
    /// it releases the lock.
    _file: Option<File>,
}

impl StoreLock {
    /// A guard for backends which need no external lock.
    pub fn unlocked() -> Self {
        Self { _file: None }
    }
}

/// A usage record stored as a JSON file.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    location: String,
}

impl FileStore {
    /// Store the record at `path`. Nothing is touched until the first write.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let location = path.display().to_string();
        Self { path, location }
    }

    /// The path of the record.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The directory holding the record. Temporary files must be created
    /// here, so that the final rename stays on one filesystem.
    fn dir(&self) -> &Path {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        }
    }

    /// The sidecar file we lock while updating the record.
    fn lock_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_owned();
        name.push(".lock");
        self.path.with_file_name(name)
    }

    /// Write `bytes` to a temporary file next to the record, without touching
    /// the record itself. Dropping the result discards the write.
    fn stage(&self, bytes: &[u8]) -> io::Result<StagedWrite<'_>> {
        let dir = self.dir();
        fs::create_dir_all(dir)?;
        let mut tmp = tempfile::Builder::new()
            .prefix(".usage-")
            .suffix(".tmp")
            .tempfile_in(dir)?;
        tmp.write_all(bytes)?;
        tmp.as_file().sync_all()?;
        Ok(StagedWrite { store: self, tmp })
    }
}

/// A fully written replacement record, not yet visible to readers.
struct StagedWrite<'a> {
    store: &'a FileStore,
    tmp: tempfile::NamedTempFile,
}

impl StagedWrite<'_> {
    /// Atomically replace the record with the staged contents.
    fn commit(self) -> io::Result<()> {
        self.tmp
            .persist(&self.store.path)
            .map_err(|err| err.error)?;
        Ok(())
    }
}

impl StateStore for FileStore {
    fn location(&self) -> &str {
        &self.location
    }

    fn read(&self) -> io::Result<Option<Vec<u8>>> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn atomic_write(&self, bytes: &[u8]) -> io::Result<()> {
        self.stage(bytes)?.commit()
    }

    fn lock(&self) -> io::Result<StoreLock> {
        fs::create_dir_all(self.dir())?;
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(self.lock_path())?;
        FileExt::lock_exclusive(&file)?;
        Ok(StoreLock { _file: Some(file) })
    }
}

/// An in-memory usage record.
///
/// Handy for embedding the tracker somewhere without a filesystem, and for
/// simulating storage failures.
#[derive(Debug, Default)]
pub struct MemoryStore {
    contents: Mutex<Option<Vec<u8>>>,
    fail_writes: AtomicBool,
    interrupt_writes: AtomicBool,
    abandoned: Mutex<Option<Vec<u8>>>,
    write_count: AtomicUsize,
}

impl MemoryStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// A store which already holds `bytes`.
    pub fn with_contents(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            contents: Mutex::new(Some(bytes.into())),
            ..Self::default()
        }
    }

    /// The current raw record.
    pub fn contents(&self) -> Option<Vec<u8>> {
        self.contents
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Make every following write fail, leaving the record untouched.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make every following write stop halfway through, as if the process
    /// died mid-write. The partial bytes are kept aside (see
    /// [`MemoryStore::abandoned`]) and the record is untouched.
    pub fn set_interrupt_writes(&self, interrupt: bool) {
        self.interrupt_writes.store(interrupt, Ordering::SeqCst);
    }

    /// The partial bytes of the last interrupted write.
    pub fn abandoned(&self) -> Option<Vec<u8>> {
        self.abandoned
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// How many writes have succeeded?
    pub fn write_count(&self) -> usize {
        self.write_count.load(Ordering::SeqCst)
    }
}

impl StateStore for MemoryStore {
    fn location(&self) -> &str {
        "memory"
    }

    fn read(&self) -> io::Result<Option<Vec<u8>>> {
        Ok(self.contents())
    }

    fn atomic_write(&self, bytes: &[u8]) -> io::Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(io::Error::other("simulated write failure"));
        }
        if self.interrupt_writes.load(Ordering::SeqCst) {
            let partial = bytes[..bytes.len() / 2].to_vec();
            *self.abandoned.lock().unwrap_or_else(|e| e.into_inner()) = Some(partial);
            return Err(io::Error::new(
                io::ErrorKind::Interrupted,
                "simulated interrupted write",
            ));
        }
        *self.contents.lock().unwrap_or_else(|e| e.into_inner()) = Some(bytes.to_vec());
        self.write_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn lock(&self) -> io::Result<StoreLock> {
        Ok(StoreLock::unlocked())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_reads_as_none() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = FileStore::new(dir.path().join("usage.json"));
        assert!(store.read().unwrap().is_none());
    }

    #[test]
    fn atomic_write_replaces_record_and_creates_directories() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = FileStore::new(dir.path().join("nested/usage.json"));
        store.atomic_write(b"first").unwrap();
        store.atomic_write(b"second").unwrap();
        assert_eq!(store.read().unwrap().as_deref(), Some(&b"second"[..]));

        // Only the record and nothing else should be left behind.
        let names = fs::read_dir(dir.path().join("nested"))
            .unwrap()
            .map(|entry| entry.unwrap().file_name().into_string().unwrap())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["usage.json".to_owned()]);
    }

    #[test]
    fn interrupted_write_leaves_previous_record_intact() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = FileStore::new(dir.path().join("usage.json"));
        let old = br#"{"month":"2025-01","used":3}"#;
        store.atomic_write(old).unwrap();

        // The new record is fully written, but readers can't see it yet.
        let staged = store.stage(br#"{"month":"2025-01","used":4}"#).unwrap();
        assert_eq!(store.read().unwrap().as_deref(), Some(&old[..]));

        // Crash before the rename.
        drop(staged);
        assert_eq!(store.read().unwrap().as_deref(), Some(&old[..]));
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn atomic_write_replaces_rather_than_overwrites() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("usage.json");
        let store = FileStore::new(&path);
        store.atomic_write(b"old").unwrap();

        // A hard link still names the old file. Writing into the record in
        // place would change what it sees too.
        let link = dir.path().join("snapshot.json");
        fs::hard_link(&path, &link).unwrap();
        store.atomic_write(b"new").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"new");
        assert_eq!(fs::read(&link).unwrap(), b"old");
    }

    #[test]
    fn staged_write_becomes_visible_on_commit() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = FileStore::new(dir.path().join("usage.json"));
        store.atomic_write(b"old").unwrap();
        let staged = store.stage(b"new").unwrap();
        assert_eq!(store.read().unwrap().as_deref(), Some(&b"old"[..]));
        staged.commit().unwrap();
        assert_eq!(store.read().unwrap().as_deref(), Some(&b"new"[..]));
    }

    #[test]
    fn failed_replace_leaves_previous_record_intact() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("usage.json");
        let store = FileStore::new(&path);

        // A non-empty directory where the record belongs can't be replaced
        // by a rename, even by root.
        fs::create_dir(&path).unwrap();
        fs::write(path.join("keep"), b"old").unwrap();
        assert!(store.atomic_write(b"new").is_err());
        assert_eq!(fs::read(path.join("keep")).unwrap(), b"old");

        // No temporary files are left behind.
        let names = fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().into_string().unwrap())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["usage.json".to_owned()]);
    }

    #[test]
    fn memory_store_can_interrupt_writes() {
        let store = MemoryStore::with_contents("old record");
        store.set_interrupt_writes(true);
        let err = store.atomic_write(b"new record").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Interrupted);
        assert_eq!(store.contents().as_deref(), Some(&b"old record"[..]));
        assert_eq!(store.abandoned().as_deref(), Some(&b"new r"[..]));
        assert_eq!(store.write_count(), 0);
    }

    #[test]
    fn lock_uses_sidecar_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = FileStore::new(dir.path().join("usage.json"));
        let guard = store.lock().unwrap();
        assert!(dir.path().join("usage.json.lock").exists());
        assert!(!store.path().exists());
        drop(guard);
    }

    #[test]
    fn memory_store_can_fail_writes() {
        let store = MemoryStore::with_contents("old");
        store.set_fail_writes(true);
        assert!(store.atomic_write(b"new").is_err());
        assert_eq!(store.contents().as_deref(), Some(&b"old"[..]));
        assert_eq!(store.write_count(), 0);

        store.set_fail_writes(false);
        store.atomic_write(b"new").unwrap();
        assert_eq!(store.contents().as_deref(), Some(&b"new"[..]));
        assert_eq!(store.write_count(), 1);
    }
}
