// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Block storage for spooled jobs and queue records.
//
// Storage is a flat namespace of named files.  The queue only needs
// sequential append, sequential read, atomic record replacement, rename and
// delete, so that is all the contract exposes.  `DirectoryStorage` maps it
// onto one directory with a byte quota standing in for the device capacity.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, instrument};

use spoolbox_core::error::{Result, SpoolError};

/// Suffix of the scratch file used by [`BlockStorage::replace`].
const REPLACE_SUFFIX: &str = ".tmp";

/// Append-only handle to a file being written.
pub trait StorageWriter: Write + Send {
    /// Flush buffered bytes and make them durable.
    fn sync(&mut self) -> Result<()>;
}

/// Named-file storage backing the job queues.
pub trait BlockStorage: Send + Sync {
    /// Create (or truncate) `name` for appending.
    fn create(&self, name: &str) -> Result<Box<dyn StorageWriter>>;

    /// Open `name` for sequential reading; also returns its length.
    fn open(&self, name: &str) -> Result<(Box<dyn Read + Send>, u64)>;

    /// Whole contents of `name`, or `None` if it does not exist.
    fn read(&self, name: &str) -> Result<Option<Vec<u8>>>;

    /// Atomically and durably replace the contents of `name`.
    ///
    /// After a crash the file holds either the old or the new contents.
    fn replace(&self, name: &str, data: &[u8]) -> Result<()>;

    fn rename(&self, from: &str, to: &str) -> Result<()>;

    /// Delete `name`.  Deleting a missing file is not an error.
    fn remove(&self, name: &str) -> Result<()>;

    fn exists(&self, name: &str) -> bool;

    /// Names starting with `prefix`, in no particular order.
    fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Bytes that can still be written.
    fn free_space(&self) -> Result<u64>;
}

// ---------------------------------------------------------------------------
// Directory-backed storage
// ---------------------------------------------------------------------------

/// [`BlockStorage`] over a single directory with a capacity quota.
#[derive(Debug, Clone)]
pub struct DirectoryStorage {
    root: PathBuf,
    capacity: u64,
}

impl DirectoryStorage {
    /// Use (and create if needed) `root`, allowing it to hold `capacity` bytes.
    #[instrument(skip_all, fields(root = %root.as_ref().display(), capacity = capacity))]
    pub fn open(root: impl AsRef<Path>, capacity: u64) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)
            .map_err(|e| SpoolError::Storage(format!("create {}: {e}", root.display())))?;
        debug!("spool directory ready");
        Ok(Self { root, capacity })
    }

    fn path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Total size of the regular files in the directory.
    fn used_bytes(&self) -> Result<u64> {
        let mut used = 0u64;
        for entry in fs::read_dir(&self.root)? {
            let meta = entry?.metadata()?;
            if meta.is_file() {
                used = used.saturating_add(meta.len());
            }
        }
        Ok(used)
    }

    fn sync_dir(&self) -> Result<()> {
        File::open(&self.root)?.sync_all()?;
        Ok(())
    }
}

/// Buffered file writer; `sync` reaches the disk.
struct FileWriter {
    inner: BufWriter<File>,
}

impl Write for FileWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

impl StorageWriter for FileWriter {
    fn sync(&mut self) -> Result<()> {
        self.inner.flush()?;
        self.inner.get_ref().sync_all()?;
        Ok(())
    }
}

impl BlockStorage for DirectoryStorage {
    fn create(&self, name: &str) -> Result<Box<dyn StorageWriter>> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(self.path(name))
            .map_err(|e| SpoolError::Storage(format!("create {name}: {e}")))?;
        Ok(Box::new(FileWriter {
            inner: BufWriter::new(file),
        }))
    }

    fn open(&self, name: &str) -> Result<(Box<dyn Read + Send>, u64)> {
        let file = File::open(self.path(name))
            .map_err(|e| SpoolError::Storage(format!("open {name}: {e}")))?;
        let len = file.metadata()?.len();
        Ok((Box::new(std::io::BufReader::new(file)), len))
    }

    fn read(&self, name: &str) -> Result<Option<Vec<u8>>> {
        match fs::read(self.path(name)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SpoolError::Storage(format!("read {name}: {e}"))),
        }
    }

    fn replace(&self, name: &str, data: &[u8]) -> Result<()> {
        let scratch = format!("{name}{REPLACE_SUFFIX}");
        {
            let mut file = File::create(self.path(&scratch))
                .map_err(|e| SpoolError::Storage(format!("create {scratch}: {e}")))?;
            file.write_all(data)?;
            file.sync_all()?;
        }
        fs::rename(self.path(&scratch), self.path(name))
            .map_err(|e| SpoolError::Storage(format!("replace {name}: {e}")))?;
        self.sync_dir()
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        fs::rename(self.path(from), self.path(to))
            .map_err(|e| SpoolError::Storage(format!("rename {from} -> {to}: {e}")))
    }

    fn remove(&self, name: &str) -> Result<()> {
        match fs::remove_file(self.path(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SpoolError::Storage(format!("remove {name}: {e}"))),
        }
    }

    fn exists(&self, name: &str) -> bool {
        self.path(name).is_file()
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let name = entry?.file_name();
            match name.to_str() {
                Some(name) if name.starts_with(prefix) => names.push(name.to_string()),
                _ => {}
            }
        }
        Ok(names)
    }

    fn free_space(&self) -> Result<u64> {
        Ok(self.capacity.saturating_sub(self.used_bytes()?))
    }
}

// ---------------------------------------------------------------------------
// Free-space estimate
// ---------------------------------------------------------------------------

/// Cached free-space figure shared by every queue on the same storage.
///
/// Querying the filesystem per byte is too slow, so stored bytes decrement
/// the cache optimistically and a periodic resync corrects the drift.
#[derive(Debug, Clone)]
pub struct SpaceEstimate {
    free: Arc<AtomicU64>,
    margin: u64,
}

impl SpaceEstimate {
    /// Estimate starting at zero (nothing storable until the first resync).
    pub fn new(margin: u64) -> Self {
        Self {
            free: Arc::new(AtomicU64::new(0)),
            margin,
        }
    }

    /// Re-read the real figure from storage.
    pub fn resync(&self, storage: &dyn BlockStorage) -> Result<u64> {
        let free = storage.free_space()?;
        self.free.store(free, Ordering::Relaxed);
        Ok(free)
    }

    /// Account for `bytes` just written.
    pub fn consume(&self, bytes: u64) {
        // fetch_update only fails when the closure returns None.
        let _ = self
            .free
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |free| {
                Some(free.saturating_sub(bytes))
            });
    }

    pub fn available(&self) -> u64 {
        self.free.load(Ordering::Relaxed)
    }

    pub fn margin(&self) -> u64 {
        self.margin
    }

    /// True while more than the safety margin remains.
    pub fn can_store_byte(&self) -> bool {
        self.available() > self.margin
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage(capacity: u64) -> (tempfile::TempDir, DirectoryStorage) {
        let dir = tempfile::tempdir().unwrap();
        let storage = DirectoryStorage::open(dir.path().join("spool"), capacity).unwrap();
        (dir, storage)
    }

    #[test]
    fn write_sync_then_read_back() {
        let (_dir, storage) = storage(1 << 20);
        let mut w = storage.create("p.1").unwrap();
        w.write_all(b"hello").unwrap();
        w.sync().unwrap();
        drop(w);

        let (mut r, len) = storage.open("p.1").unwrap();
        assert_eq!(len, 5);
        let mut buf = Vec::new();
        r.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"hello");
    }

    #[test]
    fn replace_leaves_no_scratch_file() {
        let (_dir, storage) = storage(1 << 20);
        storage.replace("p.queue", b"one").unwrap();
        storage.replace("p.queue", b"two").unwrap();
        assert_eq!(storage.read("p.queue").unwrap().as_deref(), Some(&b"two"[..]));
        assert!(!storage.exists("p.queue.tmp"));
        assert_eq!(storage.read("missing").unwrap(), None);
    }

    #[test]
    fn rename_remove_and_list() {
        let (_dir, storage) = storage(1 << 20);
        storage.create("a.1").unwrap().sync().unwrap();
        storage.create("a.2").unwrap().sync().unwrap();
        storage.create("b.1").unwrap().sync().unwrap();
        storage.rename("a.1", "a.1.ok").unwrap();

        let mut names = storage.list("a.").unwrap();
        names.sort();
        assert_eq!(names, vec!["a.1.ok", "a.2"]);

        storage.remove("a.2").unwrap();
        storage.remove("a.2").unwrap();
        assert!(!storage.exists("a.2"));
    }

    #[test]
    fn free_space_tracks_quota() {
        let (_dir, storage) = storage(100);
        assert_eq!(storage.free_space().unwrap(), 100);
        storage.replace("x", &[0u8; 40]).unwrap();
        assert_eq!(storage.free_space().unwrap(), 60);
        storage.replace("y", &[0u8; 80]).unwrap();
        assert_eq!(storage.free_space().unwrap(), 0);
    }

    #[test]
    fn estimate_is_shared_and_saturates() {
        let (_dir, storage) = storage(5000);
        let estimate = SpaceEstimate::new(4096);
        assert_eq!(estimate.margin(), 4096);
        assert!(!estimate.can_store_byte());

        assert_eq!(estimate.resync(&storage).unwrap(), 5000);
        let other = estimate.clone();
        assert!(other.can_store_byte());

        other.consume(904);
        assert_eq!(estimate.available(), 4096);
        assert!(!estimate.can_store_byte());

        estimate.consume(u64::MAX);
        assert_eq!(other.available(), 0);
    }
}
