pub mod bootstrap;
pub mod descriptor;
pub mod object;
pub mod pack;
pub mod poison;
pub mod version;

use std::sync::Arc;

use tracing::{info, warn, Dispatch};

use cairn_crypto::{CryptoEngine, EncryptionAlgorithm, HashAlgorithm, KdfParams};
use cairn_storage::StorageBackend;
use cairn_types::error::{CairnError, Result};
use cairn_types::ContentId;

use crate::check::CheckReport;
use crate::clock::{Clock, SystemClock};
use crate::compress::Compression;
use crate::config::ClientOptions;
use crate::content::ContentStore;
use crate::index::compaction::CompactionStats;
use crate::index::loader::LoadedIndex;
use crate::logging;
use crate::upgrade::{
    LockRecord, UpgradeCoordinator, UpgradeOutcome, UpgradeRequest, UpgradeStatus, UpgradeWatch,
};

use bootstrap::BootstrapBlob;
use descriptor::{FormatDescriptor, FormatDescriptorStore, DEFAULT_MAX_PACK_SIZE};
use poison::{check_not_superseded, read_poison};
use version::{negotiate, EngineCapabilities, FormatFeatures};

/// Parameters fixed when a repository is created.
#[derive(Debug, Clone)]
pub struct CreateOptions {
    /// Defaults to the engine's default create version.
    pub format_version: Option<u32>,
    pub encryption: EncryptionAlgorithm,
    pub hash_algorithm: HashAlgorithm,
    pub compression: Compression,
    pub max_pack_size: u32,
    pub kdf: KdfParams,
}

impl Default for CreateOptions {
    fn default() -> Self {
        Self {
            format_version: None,
            encryption: EncryptionAlgorithm::default(),
            hash_algorithm: HashAlgorithm::default(),
            compression: Compression::default(),
            max_pack_size: DEFAULT_MAX_PACK_SIZE,
            kdf: KdfParams::default(),
        }
    }
}

/// How a client opens a repository.
#[derive(Clone)]
pub struct OpenOptions {
    pub capabilities: EngineCapabilities,
    pub clock: Arc<dyn Clock>,
    pub client: ClientOptions,
    /// Dispatcher every operation logs through. Defaults to the one in
    /// effect when the repository is opened.
    pub log: Option<Dispatch>,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            capabilities: EngineCapabilities::current(),
            clock: Arc::new(SystemClock),
            client: ClientOptions::default(),
            log: None,
        }
    }
}

/// An open repository pinned to one format version.
///
/// Once that version is superseded every operation fails with
/// `RepositoryFormatSuperseded`; the caller has to connect again.
pub struct Repository {
    location: String,
    storage: Arc<dyn StorageBackend>,
    formats: Arc<FormatDescriptorStore>,
    descriptor: FormatDescriptor,
    options: ClientOptions,
    watch: Arc<UpgradeWatch>,
    content: ContentStore,
    upgrades: UpgradeCoordinator,
    /// Opened past a poisoned format to finish or inspect an upgrade.
    recovery: bool,
    log: Dispatch,
}

impl Repository {
    /// Initialize a new repository in empty storage.
    pub fn create(
        storage: Arc<dyn StorageBackend>,
        location: &str,
        passphrase: Option<&str>,
        create: &CreateOptions,
        open: OpenOptions,
    ) -> Result<Self> {
        let log = open.log.clone().unwrap_or_else(logging::current);
        logging::scoped(&log, || {
            let caps = open.capabilities;
            let version = create
                .format_version
                .unwrap_or_else(|| caps.default_create_version());
            caps.check_supported(version)?;

            let now = open.clock.now();
            let (bootstrap, crypto) =
                BootstrapBlob::generate(create.encryption, passphrase, create.kdf.clone(), now)?;
            let descriptor = FormatDescriptor::new(
                version,
                &bootstrap.unique_id,
                create.encryption,
                create.hash_algorithm,
                create.compression,
                create.max_pack_size,
                now,
            )?;
            bootstrap.write_new(storage.as_ref(), location)?;

            let formats = Arc::new(FormatDescriptorStore::new(
                Arc::clone(&storage),
                Arc::clone(&crypto),
                &bootstrap.unique_id,
            ));
            formats.propose_new_format(&descriptor)?;
            info!(
                location,
                version,
                encryption = %create.encryption,
                "created repository"
            );
            Self::assemble(location, storage, crypto, formats, descriptor, open, log.clone(), false)
        })
    }

    /// Connect by reading the current format descriptor from storage.
    pub fn connect(
        storage: Arc<dyn StorageBackend>,
        location: &str,
        passphrase: Option<&str>,
        open: OpenOptions,
    ) -> Result<Self> {
        let log = open.log.clone().unwrap_or_else(logging::current);
        logging::scoped(&log, || {
            let bootstrap = BootstrapBlob::read(storage.as_ref(), location)?;
            let crypto = bootstrap.unlock(passphrase)?;
            let formats = Arc::new(FormatDescriptorStore::new(
                Arc::clone(&storage),
                Arc::clone(&crypto),
                &bootstrap.unique_id,
            ));
            let descriptor = formats.read_current_format()?;
            negotiate(&descriptor, &open.capabilities)?;
            if let Err(e) = check_not_superseded(storage.as_ref(), descriptor.format_version) {
                return Err(CairnError::UpgradeIncomplete(format!(
                    "current format v{} is poisoned but nothing newer was published ({e})",
                    descriptor.format_version
                )));
            }
            info!(location, version = descriptor.format_version, "connected to repository");
            Self::assemble(location, storage, crypto, formats, descriptor, open, log.clone(), false)
        })
    }

    /// Connect to the current format even if it is poisoned, as happens
    /// when an upgrade stopped between the poison write and the new format
    /// publish. The handle only serves [`upgrade`](Self::upgrade),
    /// [`rollback_upgrade`](Self::rollback_upgrade) and
    /// [`upgrade_status`](Self::upgrade_status).
    pub fn connect_for_recovery(
        storage: Arc<dyn StorageBackend>,
        location: &str,
        passphrase: Option<&str>,
        open: OpenOptions,
    ) -> Result<Self> {
        let log = open.log.clone().unwrap_or_else(logging::current);
        logging::scoped(&log, || {
            let bootstrap = BootstrapBlob::read(storage.as_ref(), location)?;
            let crypto = bootstrap.unlock(passphrase)?;
            let formats = Arc::new(FormatDescriptorStore::new(
                Arc::clone(&storage),
                Arc::clone(&crypto),
                &bootstrap.unique_id,
            ));
            let descriptor = formats.read_current_format()?;
            negotiate(&descriptor, &open.capabilities)?;
            match read_poison(storage.as_ref(), descriptor.format_version)? {
                Some(poison) => warn!(
                    location,
                    version = descriptor.format_version,
                    superseded_by = poison.superseded_by,
                    lock_id = %poison.lock_id,
                    "connected to poisoned format for upgrade recovery"
                ),
                None => info!(
                    location,
                    version = descriptor.format_version,
                    "connected for upgrade recovery"
                ),
            }
            Self::assemble(location, storage, crypto, formats, descriptor, open, log.clone(), true)
        })
    }

    /// Reopen with a descriptor remembered from an earlier connect. Fails
    /// with `RepositoryFormatSuperseded` if that version has since been
    /// poisoned.
    pub fn open_cached(
        storage: Arc<dyn StorageBackend>,
        location: &str,
        passphrase: Option<&str>,
        cached: &FormatDescriptor,
        open: OpenOptions,
    ) -> Result<Self> {
        let log = open.log.clone().unwrap_or_else(logging::current);
        logging::scoped(&log, || {
            let bootstrap = BootstrapBlob::read(storage.as_ref(), location)?;
            if bootstrap.unique_id != cached.unique_id {
                return Err(CairnError::InvalidFormat(format!(
                    "'{location}' holds repository {}, connection expects {}",
                    bootstrap.unique_id, cached.unique_id
                )));
            }
            negotiate(cached, &open.capabilities)?;
            check_not_superseded(storage.as_ref(), cached.format_version)?;

            let crypto = bootstrap.unlock(passphrase)?;
            let formats = Arc::new(FormatDescriptorStore::new(
                Arc::clone(&storage),
                Arc::clone(&crypto),
                &bootstrap.unique_id,
            ));
            let descriptor = formats
                .read_format(cached.format_version)?
                .ok_or_else(|| {
                    CairnError::InvalidFormat(format!(
                        "format v{} is missing from storage",
                        cached.format_version
                    ))
                })?;
            Self::assemble(location, storage, crypto, formats, descriptor, open, log.clone(), false)
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn assemble(
        location: &str,
        storage: Arc<dyn StorageBackend>,
        crypto: Arc<dyn CryptoEngine>,
        formats: Arc<FormatDescriptorStore>,
        descriptor: FormatDescriptor,
        open: OpenOptions,
        log: Dispatch,
        recovery: bool,
    ) -> Result<Self> {
        open.client.validate()?;
        let features = negotiate(&descriptor, &open.capabilities)?;
        let watch = Arc::new(UpgradeWatch::new(
            Arc::clone(&storage),
            Arc::clone(&open.clock),
            descriptor.format_version,
            &open.client,
        ));
        let content = ContentStore::open(
            Arc::clone(&storage),
            Arc::clone(&crypto),
            descriptor.clone(),
            features,
            Arc::clone(&open.clock),
            Arc::clone(&watch),
        )?;
        let upgrades = UpgradeCoordinator::new(
            Arc::clone(&storage),
            crypto,
            Arc::clone(&formats),
            open.clock,
            open.capabilities,
        );
        Ok(Self {
            location: location.to_string(),
            storage,
            formats,
            descriptor,
            options: open.client,
            watch,
            content,
            upgrades,
            recovery,
            log,
        })
    }

    fn logged<T>(&self, f: impl FnOnce() -> T) -> T {
        logging::scoped(&self.log, f)
    }

    /// The content store, unless this handle was opened for recovery.
    fn content(&self) -> Result<&ContentStore> {
        if self.recovery {
            return Err(CairnError::UpgradeIncomplete(format!(
                "format v{} was opened for upgrade recovery; only upgrade, \
                 rollback and status are available",
                self.descriptor.format_version
            )));
        }
        Ok(&self.content)
    }

    pub fn is_recovery(&self) -> bool {
        self.recovery
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn descriptor(&self) -> &FormatDescriptor {
        &self.descriptor
    }

    pub fn features(&self) -> &FormatFeatures {
        self.content.features()
    }

    pub fn storage(&self) -> &Arc<dyn StorageBackend> {
        &self.storage
    }

    pub fn client_options(&self) -> &ClientOptions {
        &self.options
    }

    /// Highest format version this handle has seen in storage.
    pub fn highest_observed_format(&self) -> u32 {
        self.formats.highest_observed()
    }

    /// Fail if this handle's format version has been superseded.
    pub fn check_format_current(&self) -> Result<()> {
        self.logged(|| self.watch.check_format_current())
    }

    pub fn put_content(&self, data: &[u8]) -> Result<ContentId> {
        self.logged(|| self.content()?.put_content(data))
    }

    pub fn get_content(&self, id: &ContentId) -> Result<Vec<u8>> {
        self.logged(|| self.content()?.get_content(id))
    }

    pub fn delete_content(&self, id: &ContentId) -> Result<()> {
        self.logged(|| self.content()?.delete_content(id))
    }

    pub fn contains_content(&self, id: &ContentId) -> bool {
        self.content.contains(id)
    }

    pub fn list_content(&self) -> Result<Vec<ContentId>> {
        self.logged(|| self.content()?.list())
    }

    pub fn live_content_count(&self) -> usize {
        self.content.live_count()
    }

    pub fn flush(&self) -> Result<()> {
        self.logged(|| self.content()?.flush())
    }

    pub fn refresh(&self) -> Result<()> {
        self.logged(|| {
            let content = self.content()?;
            self.watch.invalidate();
            content.refresh()
        })
    }

    pub fn compact_indexes(&self, min_blobs: usize) -> Result<CompactionStats> {
        self.logged(|| self.content()?.compact(min_blobs))
    }

    pub fn cleanup_indexes(&self, min_age: chrono::Duration) -> Result<usize> {
        self.logged(|| self.content()?.cleanup(min_age))
    }

    pub fn index_blobs(&self) -> Result<LoadedIndex> {
        self.logged(|| self.content()?.index_blobs())
    }

    pub fn check_packs(&self) -> Result<CheckReport> {
        self.logged(|| self.content()?.check_packs())
    }

    /// Run a live format upgrade. Pending content is flushed first. On
    /// success this handle is superseded and the caller must reconnect.
    pub fn upgrade(&self, req: &UpgradeRequest) -> Result<UpgradeOutcome> {
        self.logged(|| {
            if !self.recovery {
                self.content.flush()?;
            }
            self.upgrades.run(req)
        })
    }

    /// Abort a stale (or, with `force`, any) upgrade lock that has not
    /// reached the commit phase.
    pub fn rollback_upgrade(&self, owner_id: &str, force: bool) -> Result<Option<LockRecord>> {
        self.logged(|| {
            self.upgrades
                .rollback(owner_id, force, self.options.stale_lock_multiplier)
        })
    }

    pub fn upgrade_status(&self) -> Result<UpgradeStatus> {
        self.logged(|| self.upgrades.status(self.options.stale_lock_multiplier))
    }
}

impl Drop for Repository {
    fn drop(&mut self) {
        if self.recovery {
            return;
        }
        self.logged(|| {
            if let Err(e) = self.content.flush() {
                warn!(error = %e, "failed to flush content on close");
            }
        });
    }
}
