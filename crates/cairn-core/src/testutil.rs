//! Shared fixtures for unit tests.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;

use cairn_crypto::{EncryptionAlgorithm, KdfParams};
use cairn_storage::{BlobMeta, MemoryBackend, PutOutcome, StorageBackend};
use cairn_types::error::{CairnError, Result};

use crate::clock::{Clock, ManualClock};
use crate::config::ClientOptions;
use crate::logging;
use crate::repo::version::EngineCapabilities;
use crate::repo::{CreateOptions, OpenOptions, Repository};
use crate::upgrade::UpgradeRequest;

pub const PASSPHRASE: &str = "correct horse battery staple";
pub const LOCATION: &str = "memory://test";

pub fn fast_kdf() -> KdfParams {
    KdfParams::argon2id(1, 64, 1)
}

/// Memory storage whose clock is a shared [`ManualClock`], so storage and
/// clients agree on time unless a test skews them apart.
pub struct Fixture {
    pub clock: Arc<ManualClock>,
    pub memory: Arc<MemoryBackend>,
    pub storage: Arc<dyn StorageBackend>,
}

impl Fixture {
    pub fn new() -> Self {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let source = Arc::clone(&clock);
        let memory = Arc::new(MemoryBackend::with_time_source(move || source.now()));
        let storage: Arc<dyn StorageBackend> = memory.clone();
        Self {
            clock,
            memory,
            storage,
        }
    }

    /// Route all storage access through `storage`, keeping the clock.
    pub fn with_storage(self, storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage, ..self }
    }

    pub fn open_options(&self) -> OpenOptions {
        self.pinned_options(EngineCapabilities::current())
    }

    pub fn pinned_options(&self, capabilities: EngineCapabilities) -> OpenOptions {
        OpenOptions {
            capabilities,
            clock: self.clock.clone(),
            client: ClientOptions {
                status_poll_interval: Duration::from_secs(1),
                upgrade_lock_enabled: Some(true),
                ..ClientOptions::default()
            },
            log: Some(logging::discard()),
        }
    }

    pub fn create(&self, format_version: Option<u32>) -> Repository {
        let create = CreateOptions {
            format_version,
            encryption: EncryptionAlgorithm::Aes256Gcm,
            kdf: fast_kdf(),
            ..CreateOptions::default()
        };
        Repository::create(
            Arc::clone(&self.storage),
            LOCATION,
            Some(PASSPHRASE),
            &create,
            self.open_options(),
        )
        .unwrap()
    }

    pub fn connect(&self) -> Result<Repository> {
        self.connect_with(self.open_options())
    }

    pub fn connect_with(&self, options: OpenOptions) -> Result<Repository> {
        Repository::connect(Arc::clone(&self.storage), LOCATION, Some(PASSPHRASE), options)
    }

    pub fn connect_for_recovery(&self) -> Result<Repository> {
        Repository::connect_for_recovery(
            Arc::clone(&self.storage),
            LOCATION,
            Some(PASSPHRASE),
            self.open_options(),
        )
    }

    /// Step past every client's status poll interval.
    pub fn expire_observations(&self) {
        self.clock.advance(Duration::from_secs(2));
    }
}

/// Unwrap the error of a result whose success type has no `Debug`.
pub fn expect_err<T>(result: Result<T>) -> CairnError {
    match result {
        Ok(_) => panic!("expected an error"),
        Err(e) => e,
    }
}

/// An upgrade request with a short drain window.
pub fn quick_upgrade(owner: &str) -> UpgradeRequest {
    UpgradeRequest {
        io_drain_timeout: Duration::from_secs(2),
        status_poll_interval: Duration::from_secs(1),
        allow_unsafe_upgrade: true,
        ..UpgradeRequest::new(owner)
    }
}

/// Records the key of every successful write, in order.
pub struct RecordingBackend {
    inner: Arc<dyn StorageBackend>,
    writes: Mutex<Vec<String>>,
}

impl RecordingBackend {
    pub fn new(inner: Arc<dyn StorageBackend>) -> Self {
        Self {
            inner,
            writes: Mutex::new(Vec::new()),
        }
    }

    pub fn writes(&self) -> Vec<String> {
        self.writes.lock().unwrap().clone()
    }

    /// Position of the first write whose key starts with `prefix`.
    pub fn first_write(&self, prefix: &str) -> Option<usize> {
        self.writes().iter().position(|k| k.starts_with(prefix))
    }

    fn record(&self, key: &str) {
        self.writes.lock().unwrap().push(key.to_string());
    }
}

impl StorageBackend for RecordingBackend {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.inner.get(key)
    }

    fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        self.inner.put(key, data)?;
        self.record(key);
        Ok(())
    }

    fn put_if_absent(&self, key: &str, data: &[u8]) -> Result<PutOutcome> {
        let outcome = self.inner.put_if_absent(key, data)?;
        if outcome == PutOutcome::Written {
            self.record(key);
        }
        Ok(outcome)
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.inner.delete(key)
    }

    fn exists(&self, key: &str) -> Result<bool> {
        self.inner.exists(key)
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        self.inner.list(prefix)
    }

    fn get_range(&self, key: &str, offset: u64, length: u64) -> Result<Option<Vec<u8>>> {
        self.inner.get_range(key, offset, length)
    }

    fn stat(&self, key: &str) -> Result<Option<BlobMeta>> {
        self.inner.stat(key)
    }
}

/// Fails writes to keys under a configurable prefix.
pub struct FailingBackend {
    inner: Arc<dyn StorageBackend>,
    fail_prefix: Mutex<Option<String>>,
}

impl FailingBackend {
    pub fn new(inner: Arc<dyn StorageBackend>) -> Self {
        Self {
            inner,
            fail_prefix: Mutex::new(None),
        }
    }

    pub fn fail_writes_under(&self, prefix: &str) {
        *self.fail_prefix.lock().unwrap() = Some(prefix.to_string());
    }

    pub fn heal(&self) {
        *self.fail_prefix.lock().unwrap() = None;
    }

    fn check(&self, key: &str) -> Result<()> {
        match self.fail_prefix.lock().unwrap().as_deref() {
            Some(prefix) if key.starts_with(prefix) => Err(CairnError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("injected failure writing {key}"),
            ))),
            _ => Ok(()),
        }
    }
}

impl StorageBackend for FailingBackend {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.inner.get(key)
    }

    fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        self.check(key)?;
        self.inner.put(key, data)
    }

    fn put_if_absent(&self, key: &str, data: &[u8]) -> Result<PutOutcome> {
        self.check(key)?;
        self.inner.put_if_absent(key, data)
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.inner.delete(key)
    }

    fn exists(&self, key: &str) -> Result<bool> {
        self.inner.exists(key)
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        self.inner.list(prefix)
    }

    fn get_range(&self, key: &str, offset: u64, length: u64) -> Result<Option<Vec<u8>>> {
        self.inner.get_range(key, offset, length)
    }

    fn stat(&self, key: &str) -> Result<Option<BlobMeta>> {
        self.inner.stat(key)
    }
}
