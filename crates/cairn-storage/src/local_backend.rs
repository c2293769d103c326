use std::fs;
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};

use chrono::{DateTime, Utc};

use cairn_types::error::{CairnError, Result};

use crate::{BlobMeta, PutOutcome, StorageBackend};

/// Prefix `tempfile` uses for staging files. Never surfaced as keys.
const TEMP_FILE_PREFIX: &str = ".tmp";

/// Storage backend for a local filesystem directory.
pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    /// Create a backend rooted at the given directory path.
    pub fn new(root: &str) -> Result<Self> {
        let root_path = PathBuf::from(root);
        let root = if root_path.exists() {
            fs::canonicalize(&root_path)?
        } else {
            root_path
        };
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Reject storage keys that could escape the repository root.
    fn validate_key(key: &str) -> Result<()> {
        let problem = if key.is_empty() {
            Some("empty")
        } else if key.starts_with(['/', '\\']) {
            Some("absolute path")
        } else if key.contains('\\') {
            Some("backslash")
        } else if Path::new(key).components().any(|c| c == Component::ParentDir) {
            Some("parent traversal")
        } else {
            None
        };
        match problem {
            Some(why) => Err(CairnError::InvalidFormat(format!(
                "unsafe storage key ({why}): '{key}'"
            ))),
            None => Ok(()),
        }
    }

    fn resolve(&self, key: &str) -> Result<PathBuf> {
        Self::validate_key(key)?;
        Ok(self.root.join(key))
    }

    /// Stage `data` in a temp file next to `path`, creating parent
    /// directories on demand.
    fn stage(&self, path: &Path, data: &[u8]) -> Result<tempfile::NamedTempFile> {
        let dir = path.parent().unwrap_or(&self.root);
        let mut tmp = match tempfile::NamedTempFile::new_in(dir) {
            Ok(tmp) => tmp,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                fs::create_dir_all(dir)?;
                tempfile::NamedTempFile::new_in(dir)?
            }
            Err(e) => return Err(e.into()),
        };
        tmp.write_all(data)?;
        tmp.as_file().sync_all()?;
        Ok(tmp)
    }

    /// Recursively list all files under `dir` as `/`-separated keys.
    fn list_recursive(&self, dir: &Path, keys: &mut Vec<String>) -> Result<()> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            // A directory removed by a concurrent cleanup simply has no keys.
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                self.list_recursive(&entry.path(), keys)?;
            } else if file_type.is_file() {
                if entry
                    .file_name()
                    .to_string_lossy()
                    .starts_with(TEMP_FILE_PREFIX)
                {
                    continue;
                }
                if let Ok(rel) = entry.path().strip_prefix(&self.root) {
                    let key = rel
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy())
                        .collect::<Vec<_>>()
                        .join("/");
                    keys.push(key);
                }
            }
        }
        Ok(())
    }
}

impl StorageBackend for LocalBackend {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.resolve(key)?;
        match fs::read(&path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        let path = self.resolve(key)?;
        let tmp = self.stage(&path, data)?;
        tmp.persist(&path).map_err(|e| e.error)?;
        Ok(())
    }

    fn put_if_absent(&self, key: &str, data: &[u8]) -> Result<PutOutcome> {
        let path = self.resolve(key)?;
        let tmp = self.stage(&path, data)?;
        match tmp.persist_noclobber(&path) {
            Ok(_) => Ok(PutOutcome::Written),
            Err(e) if e.error.kind() == ErrorKind::AlreadyExists => Ok(PutOutcome::AlreadyExists),
            Err(e) => Err(e.error.into()),
        }
    }

    fn delete(&self, key: &str) -> Result<()> {
        let path = self.resolve(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn exists(&self, key: &str) -> Result<bool> {
        let path = self.resolve(key)?;
        match fs::metadata(&path) {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let dir = if prefix.is_empty() {
            self.root.clone()
        } else {
            self.resolve(prefix.trim_end_matches('/'))?
        };
        match fs::metadata(&dir) {
            Ok(meta) if meta.is_dir() => {
                let mut keys = Vec::new();
                self.list_recursive(&dir, &mut keys)?;
                Ok(keys)
            }
            Ok(_) => Ok(Vec::new()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn get_range(&self, key: &str, offset: u64, length: u64) -> Result<Option<Vec<u8>>> {
        let path = self.resolve(key)?;
        let mut file = match fs::File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; length as usize];
        let mut filled = 0;
        while filled < buf.len() {
            match file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) => return Err(e.into()),
            }
        }
        buf.truncate(filled);
        Ok(Some(buf))
    }

    fn stat(&self, key: &str) -> Result<Option<BlobMeta>> {
        let path = self.resolve(key)?;
        match fs::metadata(&path) {
            Ok(meta) if meta.is_file() => Ok(Some(BlobMeta {
                length: meta.len(),
                modified: DateTime::<Utc>::from(meta.modified()?),
            })),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> (tempfile::TempDir, LocalBackend) {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path().to_str().unwrap()).unwrap();
        (dir, backend)
    }

    #[test]
    fn validate_key_rejects_unsafe_keys() {
        assert!(LocalBackend::validate_key("/etc/passwd").is_err());
        assert!(LocalBackend::validate_key("\\Windows\\System32").is_err());
        assert!(LocalBackend::validate_key("../../outside").is_err());
        assert!(LocalBackend::validate_key("foo/../../etc/passwd").is_err());
        assert!(LocalBackend::validate_key("foo\\bar").is_err());
        assert!(LocalBackend::validate_key("").is_err());
    }

    #[test]
    fn validate_key_accepts_safe_keys() {
        assert!(LocalBackend::validate_key("cairn.repository").is_ok());
        assert!(LocalBackend::validate_key("packs/ab/deadbeef").is_ok());
        assert!(LocalBackend::validate_key("format/v0000000002").is_ok());
        assert!(LocalBackend::validate_key("upgrade-lock/v0000000002/r0000000001").is_ok());
    }

    #[test]
    fn put_creates_parent_dirs_on_demand() {
        let (_dir, backend) = backend();
        backend.put("poison/v0000000001", b"p").unwrap();
        assert_eq!(backend.get("poison/v0000000001").unwrap().unwrap(), b"p");
    }

    #[test]
    fn put_if_absent_refuses_existing_key() {
        let (_dir, backend) = backend();
        assert_eq!(
            backend.put_if_absent("format/v1", b"first").unwrap(),
            PutOutcome::Written
        );
        assert_eq!(
            backend.put_if_absent("format/v1", b"second").unwrap(),
            PutOutcome::AlreadyExists
        );
        assert_eq!(backend.get("format/v1").unwrap().unwrap(), b"first");
    }

    #[test]
    fn put_if_absent_has_a_single_winner_under_contention() {
        use std::sync::{Arc, Barrier};
        use std::thread;

        let (_dir, backend) = backend();
        let backend = Arc::new(backend);
        let barrier = Arc::new(Barrier::new(8));
        let handles: Vec<_> = (0..8u8)
            .map(|i| {
                let backend = Arc::clone(&backend);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    backend.put_if_absent("lock/r1", &[i]).unwrap()
                })
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|o| *o == PutOutcome::Written)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn list_skips_staging_files_and_missing_dirs() {
        let (dir, backend) = backend();
        backend.put("index/ab/one", b"1").unwrap();
        fs::write(dir.path().join("index/ab/.tmpXYZ"), b"partial").unwrap();
        assert_eq!(backend.list("index/").unwrap(), vec!["index/ab/one"]);
        assert!(backend.list("no_such_dir").unwrap().is_empty());
    }

    #[test]
    fn stat_reports_length_and_recent_mtime() {
        let (_dir, backend) = backend();
        backend.put("clock-sample/x", b"12345").unwrap();
        let meta = backend.stat("clock-sample/x").unwrap().unwrap();
        assert_eq!(meta.length, 5);
        let age = Utc::now() - meta.modified;
        assert!(age.num_seconds().abs() < 60);
        assert!(backend.stat("clock-sample/missing").unwrap().is_none());
    }

    #[test]
    fn get_range_reads_slice() {
        let (_dir, backend) = backend();
        backend.put("packs/00/p", b"0123456789").unwrap();
        assert_eq!(
            backend.get_range("packs/00/p", 3, 4).unwrap().unwrap(),
            b"3456"
        );
        assert!(backend.get_range("packs/00/none", 0, 1).unwrap().is_none());
    }

    #[test]
    fn resolve_rejects_traversal() {
        let (_dir, backend) = backend();
        assert!(backend.get("../../etc/passwd").is_err());
        assert!(backend.put("../escape", b"bad").is_err());
        assert!(backend.put_if_absent("../escape", b"bad").is_err());
        assert!(backend.delete("/absolute").is_err());
    }
}
