//! Metadata store: per-file records persisted to a `sled` database under the
//! node's data directory.
//!
//! Every method here is synchronous and blocking (hashing a large file,
//! `sled` I/O) — the controller always calls through
//! [`tokio::task::spawn_blocking`], never inline on the event loop.

use std::fmt;
use std::io::Read;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use sled::Db;

use crate::config::{FINGERPRINT_LENGTH, FILE_CHUNK};
use crate::error::{Error, Result};
use crate::util::short_prefix;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileStatus {
    Ready,
    Downloading,
    Invalid,
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FileStatus::Ready => "READY",
            FileStatus::Downloading => "DOWNLOADING",
            FileStatus::Invalid => "INVALID",
        })
    }
}

/// One file's declared and observed state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
    pub digest: String,
    pub current_size: u64,
    pub current_digest: String,
    pub status: FileStatus,
}

impl FileMetadata {
    /// `is_valid ⇔ current_size == size ∧ current_digest == digest`.
    pub fn is_valid(&self) -> bool {
        self.current_size == self.size && self.current_digest == self.digest
    }

    /// `can_share ⇔ status == READY ∧ is_valid`.
    pub fn can_share(&self) -> bool {
        self.status == FileStatus::Ready && self.is_valid()
    }

    /// Short display prefix of the current digest.
    pub fn fingerprint(&self) -> &str {
        short_prefix(&self.current_digest, FINGERPRINT_LENGTH)
    }
}

/// sha-256 of a file's contents, streamed in [`FILE_CHUNK`] pieces rather
/// than read whole into memory.
pub fn hash_file(path: &Path) -> Result<(u64, String)> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; FILE_CHUNK];
    let mut total = 0u64;
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }
    Ok((total, hex::encode(hasher.finalize())))
}

/// Persistent key→record store, one record per file name. Cheap to clone:
/// `sled::Db` is itself a handle onto shared internal state.
#[derive(Clone)]
pub struct Store {
    db: Db,
}

impl Store {
    pub fn open(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let db = sled::open(data_dir.join(".meta"))?;
        Ok(Self { db })
    }

    fn put(&self, record: &FileMetadata) -> Result<()> {
        let bytes = bincode::serialize(record)?;
        self.db.insert(record.name.as_bytes(), bytes)?;
        self.db.flush()?;
        Ok(())
    }

    /// Loads every persisted record, demoting any READY record whose content
    /// no longer verifies to INVALID before returning it.
    pub fn load(&self) -> Result<Vec<FileMetadata>> {
        let mut out = Vec::new();
        for entry in self.db.iter() {
            let (_, bytes) = entry?;
            let mut record: FileMetadata = bincode::deserialize(&bytes)?;
            if record.status == FileStatus::Ready && !record.is_valid() {
                record.status = FileStatus::Invalid;
                self.put(&record)?;
            }
            out.push(record);
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    pub fn get(&self, name: &str) -> Result<Option<FileMetadata>> {
        match self.db.get(name.as_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Registers an existing local file: hashes it on disk and stores it as
    /// immediately READY.
    pub fn add(&self, name: &str, path: &Path) -> Result<FileMetadata> {
        if self.get(name)?.is_some() {
            return Err(Error::DuplicateFile(name.to_string()));
        }
        let (size, digest) = hash_file(path)?;
        let record = FileMetadata {
            name: name.to_string(),
            path: path.to_path_buf(),
            size,
            digest: digest.clone(),
            current_size: size,
            current_digest: digest,
            status: FileStatus::Ready,
        };
        self.put(&record)?;
        Ok(record)
    }

    /// Registers a pending download: an empty record, DOWNLOADING, waiting
    /// for bytes.
    pub fn init_meta(&self, name: &str, path: &Path, size: u64, digest: &str) -> Result<FileMetadata> {
        if self.get(name)?.is_some() {
            return Err(Error::DuplicateFile(name.to_string()));
        }
        let record = FileMetadata {
            name: name.to_string(),
            path: path.to_path_buf(),
            size,
            digest: digest.to_string(),
            current_size: 0,
            current_digest: String::new(),
            status: FileStatus::Downloading,
        };
        self.put(&record)?;
        Ok(record)
    }

    pub fn remove(&self, name: &str) -> Result<()> {
        self.db.remove(name.as_bytes())?;
        self.db.flush()?;
        Ok(())
    }

    pub fn change_state(&self, name: &str, status: FileStatus) -> Result<FileMetadata> {
        let mut record = self.get(name)?.ok_or_else(|| Error::NotFound(name.to_string()))?;
        record.status = status;
        self.put(&record)?;
        Ok(record)
    }

    /// Progress report from an in-progress download.
    pub fn update_stat(&self, name: &str, current_size: u64) -> Result<FileMetadata> {
        let mut record = self.get(name)?.ok_or_else(|| Error::NotFound(name.to_string()))?;
        record.current_size = current_size;
        self.put(&record)?;
        Ok(record)
    }

    /// Re-hashes the file on disk after a download completes and stores the
    /// observed size/digest.
    pub fn recompute(&self, name: &str) -> Result<FileMetadata> {
        let mut record = self.get(name)?.ok_or_else(|| Error::NotFound(name.to_string()))?;
        let (size, digest) = hash_file(&record.path)?;
        record.current_size = size;
        record.current_digest = digest;
        self.put(&record)?;
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tmp_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn add_computes_digest_and_marks_ready() {
        let (dir, store) = tmp_store();
        let path = dir.path().join("hello.txt");
        std::fs::write(&path, b"hello").unwrap();

        let record = store.add("hello.txt", &path).unwrap();
        assert_eq!(record.status, FileStatus::Ready);
        assert!(record.can_share());
        assert_eq!(record.size, 5);
    }

    #[test]
    fn add_twice_is_duplicate() {
        let (dir, store) = tmp_store();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, b"a").unwrap();
        store.add("a.txt", &path).unwrap();
        assert!(matches!(store.add("a.txt", &path), Err(Error::DuplicateFile(_))));
    }

    #[test]
    fn load_invalidates_tampered_ready_record() {
        let (dir, store) = tmp_store();
        let path = dir.path().join("b.txt");
        std::fs::write(&path, b"original").unwrap();
        store.add("b.txt", &path).unwrap();
        std::fs::write(&path, b"tampered!").unwrap();

        let loaded = store.load().unwrap();
        let record = loaded.into_iter().find(|r| r.name == "b.txt").unwrap();
        assert_eq!(record.status, FileStatus::Invalid);
    }

    #[test]
    fn init_meta_then_update_stat_then_recompute() {
        let (dir, store) = tmp_store();
        let path = dir.path().join("c.txt");
        let record = store.init_meta("c.txt", &path, 5, &"d".repeat(64)).unwrap();
        assert_eq!(record.status, FileStatus::Downloading);

        std::fs::write(&path, b"hello").unwrap();
        store.update_stat("c.txt", 5).unwrap();
        let recomputed = store.recompute("c.txt").unwrap();
        assert_eq!(recomputed.current_size, 5);
        assert!(!recomputed.current_digest.is_empty());
    }

    #[test]
    fn fingerprint_is_a_prefix_of_current_digest() {
        let (dir, store) = tmp_store();
        let path = dir.path().join("d.txt");
        std::fs::write(&path, b"hello").unwrap();
        let record = store.add("d.txt", &path).unwrap();
        assert!(record.current_digest.starts_with(record.fingerprint()));
        assert_eq!(record.fingerprint().len(), FINGERPRINT_LENGTH);
    }
}
