pub mod local_backend;
pub mod memory_backend;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use cairn_types::error::{CairnError, Result};

pub use local_backend::LocalBackend;
pub use memory_backend::MemoryBackend;

/// Result of a conditional write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Written,
    AlreadyExists,
}

/// Metadata the backend keeps for a stored blob. `modified` is assigned by
/// the storage side and is the reference clock for drift checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobMeta {
    pub length: u64,
    pub modified: DateTime<Utc>,
}

/// Abstract key-value blob store. Keys are `/`-separated paths.
pub trait StorageBackend: Send + Sync {
    /// Read an object by key. Returns `None` if not found.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Write an object, replacing any existing value.
    fn put(&self, key: &str, data: &[u8]) -> Result<()>;

    /// Write an object only if no object exists under `key`. Exactly one of
    /// several racing callers observes `Written`.
    fn put_if_absent(&self, key: &str, data: &[u8]) -> Result<PutOutcome>;

    /// Delete an object. Deleting a missing key is not an error.
    fn delete(&self, key: &str) -> Result<()>;

    /// Check if an object exists.
    fn exists(&self, key: &str) -> Result<bool>;

    /// List all keys under a prefix.
    fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Read a byte range from an object.
    fn get_range(&self, key: &str, offset: u64, length: u64) -> Result<Option<Vec<u8>>>;

    /// Length and storage-assigned modification time of an object.
    fn stat(&self, key: &str) -> Result<Option<BlobMeta>>;
}

impl<T: StorageBackend + ?Sized> StorageBackend for Arc<T> {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        (**self).get(key)
    }

    fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        (**self).put(key, data)
    }

    fn put_if_absent(&self, key: &str, data: &[u8]) -> Result<PutOutcome> {
        (**self).put_if_absent(key, data)
    }

    fn delete(&self, key: &str) -> Result<()> {
        (**self).delete(key)
    }

    fn exists(&self, key: &str) -> Result<bool> {
        (**self).exists(key)
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        (**self).list(prefix)
    }

    fn get_range(&self, key: &str, offset: u64, length: u64) -> Result<Option<Vec<u8>>> {
        (**self).get_range(key, offset, length)
    }

    fn stat(&self, key: &str) -> Result<Option<BlobMeta>> {
        (**self).stat(key)
    }
}

/// Supported backend kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Filesystem,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Filesystem => "filesystem",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = CairnError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "filesystem" | "local" => Ok(BackendKind::Filesystem),
            other => Err(CairnError::UnsupportedBackend(other.to_string())),
        }
    }
}

/// Where a repository lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    pub backend: BackendKind,
    pub path: String,
}

/// Build a storage backend from its configuration.
pub fn backend_from_config(cfg: &StorageConfig) -> Result<Arc<dyn StorageBackend>> {
    match cfg.backend {
        BackendKind::Filesystem => {
            if cfg.path.is_empty() {
                return Err(CairnError::Config("filesystem backend requires a path".into()));
            }
            Ok(Arc::new(LocalBackend::new(&cfg.path)?))
        }
    }
}
