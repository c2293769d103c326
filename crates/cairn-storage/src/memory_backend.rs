use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};

use cairn_types::error::{CairnError, Result};

use crate::{BlobMeta, PutOutcome, StorageBackend};

type TimeSource = Box<dyn Fn() -> DateTime<Utc> + Send + Sync>;

struct StoredBlob {
    data: Vec<u8>,
    modified: DateTime<Utc>,
}

/// In-memory storage backend. Modification times come from an injectable
/// time source plus an adjustable skew, which lets callers emulate a storage
/// clock that disagrees with the local one.
pub struct MemoryBackend {
    data: Mutex<HashMap<String, StoredBlob>>,
    time_source: TimeSource,
    skew: Mutex<Duration>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::with_time_source(Utc::now)
    }

    pub fn with_time_source<F>(source: F) -> Self
    where
        F: Fn() -> DateTime<Utc> + Send + Sync + 'static,
    {
        Self {
            data: Mutex::new(HashMap::new()),
            time_source: Box::new(source),
            skew: Mutex::new(Duration::zero()),
        }
    }

    /// Shift the storage clock relative to the time source.
    pub fn set_clock_skew(&self, skew: Duration) {
        *lock(&self.skew) = skew;
    }

    pub fn len(&self) -> usize {
        lock(&self.data).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn storage_now(&self) -> DateTime<Utc> {
        (self.time_source)() + *lock(&self.skew)
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl StorageBackend for MemoryBackend {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(lock(&self.data).get(key).map(|b| b.data.clone()))
    }

    fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        let modified = self.storage_now();
        lock(&self.data).insert(
            key.to_string(),
            StoredBlob {
                data: data.to_vec(),
                modified,
            },
        );
        Ok(())
    }

    fn put_if_absent(&self, key: &str, data: &[u8]) -> Result<PutOutcome> {
        let modified = self.storage_now();
        let mut map = lock(&self.data);
        if map.contains_key(key) {
            return Ok(PutOutcome::AlreadyExists);
        }
        map.insert(
            key.to_string(),
            StoredBlob {
                data: data.to_vec(),
                modified,
            },
        );
        Ok(PutOutcome::Written)
    }

    fn delete(&self, key: &str) -> Result<()> {
        lock(&self.data).remove(key);
        Ok(())
    }

    fn exists(&self, key: &str) -> Result<bool> {
        Ok(lock(&self.data).contains_key(key))
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let map = lock(&self.data);
        let mut keys: Vec<String> = map
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    fn get_range(&self, key: &str, offset: u64, length: u64) -> Result<Option<Vec<u8>>> {
        let map = lock(&self.data);
        let Some(blob) = map.get(key) else {
            return Ok(None);
        };
        let start = offset as usize;
        let end = start.saturating_add(length as usize);
        if end > blob.data.len() {
            return Err(CairnError::Other(format!(
                "short read on {key} at offset {offset}: requested {length} bytes, object is {} bytes",
                blob.data.len()
            )));
        }
        Ok(Some(blob.data[start..end].to_vec()))
    }

    fn stat(&self, key: &str) -> Result<Option<BlobMeta>> {
        Ok(lock(&self.data).get(key).map(|b| BlobMeta {
            length: b.data.len() as u64,
            modified: b.modified,
        }))
    }
}
