//! Persistence backends.
//!
//! Every component that touches managed files goes through [`Storage`], with
//! paths relative to the backend root. [`FsStorage`] is the real thing;
//! [`MemoryStorage`] keeps everything in a map and can be told to fail writes.

use crate::error::{IndexError, Result};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEntry {
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
}

pub trait Storage: Send + Sync + std::fmt::Debug {
    fn read(&self, path: &Path) -> Result<Vec<u8>>;

    /// Replace `path` so readers see either the old or the new bytes, never a mix.
    /// The parent directory must already exist.
    fn write_atomic(&self, path: &Path, content: &[u8]) -> Result<()>;

    fn exists(&self, path: &Path) -> bool;

    fn is_dir(&self, path: &Path) -> bool;

    fn create_dir_all(&self, path: &Path) -> Result<()>;

    /// Direct children of `path`; a missing directory lists as empty.
    fn list_dir(&self, path: &Path) -> Result<Vec<StorageEntry>>;

    fn remove_file(&self, path: &Path) -> Result<()>;

    fn remove_dir_all(&self, path: &Path) -> Result<()>;

    fn file_size(&self, path: &Path) -> Result<u64>;

    fn copy(&self, from: &Path, to: &Path) -> Result<u64> {
        let content = self.read(from)?;
        self.write_atomic(to, &content)?;
        Ok(content.len() as u64)
    }

    fn read_to_string(&self, path: &Path) -> Result<String> {
        let bytes = self.read(path)?;
        String::from_utf8(bytes)
            .map_err(|e| IndexError::io(path, io::Error::new(io::ErrorKind::InvalidData, e)))
    }
}

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Filesystem backend rooted at a directory.
#[derive(Debug, Clone)]
pub struct FsStorage {
    root: PathBuf,
}

impl FsStorage {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        self.root.join(path)
    }
}

impl Storage for FsStorage {
    fn read(&self, path: &Path) -> Result<Vec<u8>> {
        let full = self.resolve(path);
        fs::read(&full).map_err(|e| IndexError::io(full, e))
    }

    fn write_atomic(&self, path: &Path, content: &[u8]) -> Result<()> {
        let full = self.resolve(path);
        let parent = full
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        let file_name = full
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let temp = parent.join(format!(
            ".{}.tmp-{}-{}",
            file_name,
            std::process::id(),
            TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));

        let written = (|| -> io::Result<()> {
            let mut file = fs::File::create(&temp)?;
            file.write_all(content)?;
            file.sync_all()?;
            fs::rename(&temp, &full)
        })();

        if let Err(e) = written {
            // the temp file may or may not exist depending on where we failed
            let _ = fs::remove_file(&temp);
            return Err(IndexError::io(full, e));
        }
        Ok(())
    }

    fn exists(&self, path: &Path) -> bool {
        self.resolve(path).exists()
    }

    fn is_dir(&self, path: &Path) -> bool {
        self.resolve(path).is_dir()
    }

    fn create_dir_all(&self, path: &Path) -> Result<()> {
        let full = self.resolve(path);
        fs::create_dir_all(&full).map_err(|e| IndexError::io(full, e))
    }

    fn list_dir(&self, path: &Path) -> Result<Vec<StorageEntry>> {
        let full = self.resolve(path);
        let reader = match fs::read_dir(&full) {
            Ok(reader) => reader,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(IndexError::io(full, e)),
        };

        let mut entries = Vec::new();
        for entry in reader {
            let entry = entry.map_err(|e| IndexError::io(&full, e))?;
            let metadata = entry.metadata().map_err(|e| IndexError::io(entry.path(), e))?;
            entries.push(StorageEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                is_dir: metadata.is_dir(),
                size: if metadata.is_dir() { 0 } else { metadata.len() },
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn remove_file(&self, path: &Path) -> Result<()> {
        let full = self.resolve(path);
        fs::remove_file(&full).map_err(|e| IndexError::io(full, e))
    }

    fn remove_dir_all(&self, path: &Path) -> Result<()> {
        let full = self.resolve(path);
        fs::remove_dir_all(&full).map_err(|e| IndexError::io(full, e))
    }

    fn file_size(&self, path: &Path) -> Result<u64> {
        let full = self.resolve(path);
        fs::metadata(&full)
            .map(|m| m.len())
            .map_err(|e| IndexError::io(full, e))
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    files: BTreeMap<PathBuf, Vec<u8>>,
    dirs: BTreeSet<PathBuf>,
    /// (path suffix, fail only once)
    failing_writes: Vec<(String, bool)>,
}

/// In-memory backend for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    state: Mutex<MemoryState>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every write whose path ends with `suffix` fail with `PermissionDenied`.
    pub fn fail_writes_to(&self, suffix: &str) {
        self.state.lock().failing_writes.push((suffix.to_string(), false));
    }

    /// Like [`fail_writes_to`](Self::fail_writes_to), but only for the next matching write.
    pub fn fail_next_write_to(&self, suffix: &str) {
        self.state.lock().failing_writes.push((suffix.to_string(), true));
    }

    pub fn clear_faults(&self) {
        self.state.lock().failing_writes.clear();
    }

    /// Every stored file path, sorted.
    pub fn file_paths(&self) -> Vec<PathBuf> {
        self.state.lock().files.keys().cloned().collect()
    }

    fn normalize(path: &Path) -> PathBuf {
        path.components()
            .filter(|c| matches!(c, Component::Normal(_)))
            .collect()
    }

    fn not_found(path: &Path) -> IndexError {
        IndexError::io(path, io::Error::from(io::ErrorKind::NotFound))
    }
}

impl Storage for MemoryStorage {
    fn read(&self, path: &Path) -> Result<Vec<u8>> {
        let key = Self::normalize(path);
        self.state
            .lock()
            .files
            .get(&key)
            .cloned()
            .ok_or_else(|| Self::not_found(path))
    }

    fn write_atomic(&self, path: &Path, content: &[u8]) -> Result<()> {
        let key = Self::normalize(path);
        let mut state = self.state.lock();

        let rejected = {
            let display = key.to_string_lossy();
            state
                .failing_writes
                .iter()
                .position(|(suffix, _)| display.ends_with(suffix.as_str()))
        };
        if let Some(index) = rejected {
            if state.failing_writes[index].1 {
                state.failing_writes.remove(index);
            }
            return Err(IndexError::io(
                path,
                io::Error::new(io::ErrorKind::PermissionDenied, "write rejected"),
            ));
        }
        if state.dirs.contains(&key) {
            return Err(IndexError::io(
                path,
                io::Error::new(io::ErrorKind::Other, "is a directory"),
            ));
        }
        if let Some(parent) = key.parent() {
            if !parent.as_os_str().is_empty() && !state.dirs.contains(parent) {
                return Err(Self::not_found(path));
            }
        }

        state.files.insert(key, content.to_vec());
        Ok(())
    }

    fn exists(&self, path: &Path) -> bool {
        let key = Self::normalize(path);
        let state = self.state.lock();
        key.as_os_str().is_empty() || state.files.contains_key(&key) || state.dirs.contains(&key)
    }

    fn is_dir(&self, path: &Path) -> bool {
        let key = Self::normalize(path);
        key.as_os_str().is_empty() || self.state.lock().dirs.contains(&key)
    }

    fn create_dir_all(&self, path: &Path) -> Result<()> {
        let key = Self::normalize(path);
        let mut state = self.state.lock();
        let mut current = PathBuf::new();
        for component in key.components() {
            current.push(component);
            if state.files.contains_key(&current) {
                return Err(IndexError::io(
                    &current,
                    io::Error::new(io::ErrorKind::AlreadyExists, "a file is in the way"),
                ));
            }
            state.dirs.insert(current.clone());
        }
        Ok(())
    }

    fn list_dir(&self, path: &Path) -> Result<Vec<StorageEntry>> {
        let key = Self::normalize(path);
        let state = self.state.lock();
        let is_child = |candidate: &Path| candidate.parent() == Some(key.as_path());
        let name_of = |candidate: &Path| {
            candidate
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()
        };

        let mut entries: Vec<StorageEntry> = state
            .dirs
            .iter()
            .filter(|d| is_child(d.as_path()))
            .map(|d| StorageEntry {
                name: name_of(d.as_path()),
                is_dir: true,
                size: 0,
            })
            .chain(
                state
                    .files
                    .iter()
                    .filter(|(f, _)| is_child(f.as_path()))
                    .map(|(f, content)| StorageEntry {
                        name: name_of(f.as_path()),
                        is_dir: false,
                        size: content.len() as u64,
                    }),
            )
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn remove_file(&self, path: &Path) -> Result<()> {
        let key = Self::normalize(path);
        match self.state.lock().files.remove(&key) {
            Some(_) => Ok(()),
            None => Err(Self::not_found(path)),
        }
    }

    fn remove_dir_all(&self, path: &Path) -> Result<()> {
        let key = Self::normalize(path);
        let mut state = self.state.lock();
        if !state.dirs.contains(&key) {
            return Err(Self::not_found(path));
        }
        state.files.retain(|f, _| !f.starts_with(&key));
        state.dirs.retain(|d| !d.starts_with(&key));
        Ok(())
    }

    fn file_size(&self, path: &Path) -> Result<u64> {
        let key = Self::normalize(path);
        self.state
            .lock()
            .files
            .get(&key)
            .map(|c| c.len() as u64)
            .ok_or_else(|| Self::not_found(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn exercise(storage: &dyn Storage) {
        storage.create_dir_all(Path::new("idx/.history")).unwrap();
        storage
            .write_atomic(Path::new("idx/a.jsonl"), b"one\n")
            .unwrap();
        storage
            .write_atomic(Path::new("idx/a.jsonl"), b"two\n")
            .unwrap();
        assert_eq!(storage.read(Path::new("idx/a.jsonl")).unwrap(), b"two\n");
        assert_eq!(storage.file_size(Path::new("idx/a.jsonl")).unwrap(), 4);

        let entries = storage.list_dir(Path::new("idx")).unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec![".history", "a.jsonl"]);
        assert!(entries[0].is_dir);

        assert_eq!(
            storage
                .copy(Path::new("idx/a.jsonl"), Path::new("idx/.history/a.copy"))
                .unwrap(),
            4
        );
        assert!(storage.exists(Path::new("idx/.history/a.copy")));

        storage.remove_dir_all(Path::new("idx/.history")).unwrap();
        assert!(!storage.exists(Path::new("idx/.history/a.copy")));
        storage.remove_file(Path::new("idx/a.jsonl")).unwrap();
        assert!(!storage.exists(Path::new("idx/a.jsonl")));
        assert!(storage.list_dir(Path::new("missing")).unwrap().is_empty());
    }

    #[test]
    fn test_fs_storage_operations() {
        let temp_dir = TempDir::new().unwrap();
        exercise(&FsStorage::new(temp_dir.path()));
    }

    #[test]
    fn test_memory_storage_operations() {
        exercise(&MemoryStorage::new());
    }

    #[test]
    fn test_fs_write_into_missing_parent_fails() {
        let temp_dir = TempDir::new().unwrap();
        let storage = FsStorage::new(temp_dir.path());
        let err = storage
            .write_atomic(Path::new("nope/a.jsonl"), b"x")
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Io);
    }

    #[test]
    fn test_fs_write_leaves_no_temp_files() {
        let temp_dir = TempDir::new().unwrap();
        let storage = FsStorage::new(temp_dir.path());
        storage.write_atomic(Path::new("a.jsonl"), b"x").unwrap();
        let names: Vec<_> = storage
            .list_dir(Path::new(""))
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["a.jsonl"]);
    }

    #[test]
    fn test_memory_fault_injection() {
        let storage = MemoryStorage::new();
        storage.write_atomic(Path::new("a.jsonl"), b"old").unwrap();
        storage.fail_writes_to("a.jsonl");
        assert!(storage.write_atomic(Path::new("a.jsonl"), b"new").is_err());
        assert_eq!(storage.read(Path::new("a.jsonl")).unwrap(), b"old");

        storage.clear_faults();
        storage.write_atomic(Path::new("a.jsonl"), b"new").unwrap();
        assert_eq!(storage.read(Path::new("a.jsonl")).unwrap(), b"new");
    }

    #[test]
    fn test_memory_one_shot_fault() {
        let storage = MemoryStorage::new();
        storage.fail_next_write_to("a.jsonl");
        assert!(storage.write_atomic(Path::new("a.jsonl"), b"x").is_err());
        storage.write_atomic(Path::new("a.jsonl"), b"y").unwrap();
        assert_eq!(storage.read(Path::new("a.jsonl")).unwrap(), b"y");
    }
}
