use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use cairn_crypto::{CryptoEngine, EncryptionAlgorithm, HashAlgorithm};
use cairn_storage::{PutOutcome, StorageBackend};
use cairn_types::error::{CairnError, Result};

use crate::compress::Compression;

use super::object::{pack_object_with_context, unpack_object_expect_with_context, ObjectType};
use super::version::{features_for_version, MIN_FORMAT_VERSION};

pub const FORMAT_PREFIX: &str = "format/";

pub const DEFAULT_MAX_PACK_SIZE: u32 = 32 * 1024 * 1024;
pub const MIN_MAX_PACK_SIZE: u32 = 4 * 1024;
pub const MAX_MAX_PACK_SIZE: u32 = 512 * 1024 * 1024;

/// Authoritative description of how a repository is laid out. One blob per
/// version under `format/`; the highest version present is current.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatDescriptor {
    pub format_version: u32,
    pub unique_id: String,
    pub encryption: EncryptionAlgorithm,
    pub hash_algorithm: HashAlgorithm,
    pub compression: Compression,
    pub max_pack_size: u32,
    pub index_version: u8,
    pub created: DateTime<Utc>,
    /// Lock id of the upgrade that committed this version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upgraded_by: Option<String>,
}

impl FormatDescriptor {
    pub fn new(
        format_version: u32,
        unique_id: &str,
        encryption: EncryptionAlgorithm,
        hash_algorithm: HashAlgorithm,
        compression: Compression,
        max_pack_size: u32,
        created: DateTime<Utc>,
    ) -> Result<Self> {
        let features = features_for_version(format_version)?;
        validate_max_pack_size(max_pack_size)?;
        Ok(Self {
            format_version,
            unique_id: unique_id.to_string(),
            encryption,
            hash_algorithm,
            compression: if features.compression {
                compression
            } else {
                Compression::None
            },
            max_pack_size,
            index_version: features.index_version.as_u8(),
            created,
            upgraded_by: None,
        })
    }

    /// Descriptor for `target`, carrying over everything that does not
    /// change across versions.
    pub fn upgraded_to(
        &self,
        target: u32,
        lock_id: &str,
        max_pack_size: Option<u32>,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        if target <= self.format_version {
            return Err(CairnError::FormatDowngrade {
                proposed: target,
                current: self.format_version,
            });
        }
        let features = features_for_version(target)?;
        let max_pack_size = max_pack_size.unwrap_or(self.max_pack_size);
        validate_max_pack_size(max_pack_size)?;
        let compression = match self.compression {
            Compression::None if features.compression => Compression::default(),
            other => other,
        };
        Ok(Self {
            format_version: target,
            unique_id: self.unique_id.clone(),
            encryption: self.encryption,
            hash_algorithm: self.hash_algorithm,
            compression,
            max_pack_size,
            index_version: features.index_version.as_u8(),
            created: now,
            upgraded_by: Some(lock_id.to_string()),
        })
    }
}

fn validate_max_pack_size(size: u32) -> Result<()> {
    if !(MIN_MAX_PACK_SIZE..=MAX_MAX_PACK_SIZE).contains(&size) {
        return Err(CairnError::Config(format!(
            "max_pack_size must be between {MIN_MAX_PACK_SIZE} and {MAX_MAX_PACK_SIZE} bytes, got {size}"
        )));
    }
    Ok(())
}

pub fn format_key(version: u32) -> String {
    format!("{FORMAT_PREFIX}v{version:010}")
}

pub fn parse_format_key(key: &str) -> Option<u32> {
    key.strip_prefix(FORMAT_PREFIX)?
        .strip_prefix('v')?
        .parse()
        .ok()
}

/// Reads and writes format descriptor blobs. Remembers the highest version
/// it has ever seen and refuses to write anything below it.
pub struct FormatDescriptorStore {
    storage: Arc<dyn StorageBackend>,
    crypto: Arc<dyn CryptoEngine>,
    unique_id: String,
    highest_observed: AtomicU32,
}

impl FormatDescriptorStore {
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        crypto: Arc<dyn CryptoEngine>,
        unique_id: &str,
    ) -> Self {
        Self {
            storage,
            crypto,
            unique_id: unique_id.to_string(),
            highest_observed: AtomicU32::new(0),
        }
    }

    pub fn highest_observed(&self) -> u32 {
        self.highest_observed.load(Ordering::SeqCst)
    }

    fn observe(&self, version: u32) {
        self.highest_observed.fetch_max(version, Ordering::SeqCst);
    }

    /// All descriptor versions present, ascending.
    pub fn list_versions(&self) -> Result<Vec<u32>> {
        let mut versions: Vec<u32> = self
            .storage
            .list(FORMAT_PREFIX)?
            .iter()
            .filter_map(|k| parse_format_key(k))
            .collect();
        versions.sort_unstable();
        versions.dedup();
        if let Some(&max) = versions.last() {
            self.observe(max);
        }
        Ok(versions)
    }

    /// Read the descriptor with the highest version.
    pub fn read_current_format(&self) -> Result<FormatDescriptor> {
        let versions = self.list_versions()?;
        let Some(&latest) = versions.last() else {
            return Err(CairnError::NotFound(
                "repository has no format descriptor".into(),
            ));
        };
        self.read_format(latest)?
            .ok_or_else(|| CairnError::NotFound(format_key(latest)))
    }

    /// Read one specific descriptor version.
    pub fn read_format(&self, version: u32) -> Result<Option<FormatDescriptor>> {
        let key = format_key(version);
        let Some(data) = self.storage.get(&key)? else {
            return Ok(None);
        };
        let plaintext = unpack_object_expect_with_context(
            &data,
            ObjectType::FormatDescriptor,
            key.as_bytes(),
            self.crypto.as_ref(),
        )?;
        let desc: FormatDescriptor = rmp_serde::from_slice(&plaintext)?;
        if desc.format_version != version {
            return Err(CairnError::InvalidFormat(format!(
                "{key} holds a descriptor for v{}",
                desc.format_version
            )));
        }
        if desc.unique_id != self.unique_id {
            return Err(CairnError::InvalidFormat(format!(
                "{key} belongs to repository {}, expected {}",
                desc.unique_id, self.unique_id
            )));
        }
        self.observe(version);
        Ok(Some(desc))
    }

    /// Publish a new descriptor. Succeeds for at most one writer per version
    /// and never below a version already seen.
    pub fn propose_new_format(&self, desc: &FormatDescriptor) -> Result<()> {
        if desc.unique_id != self.unique_id {
            return Err(CairnError::InvalidFormat(
                "descriptor belongs to a different repository".into(),
            ));
        }
        if desc.format_version < MIN_FORMAT_VERSION {
            return Err(CairnError::InvalidFormat(format!(
                "format version {} is below the minimum {MIN_FORMAT_VERSION}",
                desc.format_version
            )));
        }
        let listed = self.list_versions()?.last().copied().unwrap_or(0);
        let current = listed.max(self.highest_observed());
        if desc.format_version < current {
            return Err(CairnError::FormatDowngrade {
                proposed: desc.format_version,
                current,
            });
        }
        if desc.format_version == current {
            return Err(CairnError::FormatConflict(desc.format_version));
        }

        let key = format_key(desc.format_version);
        let plaintext = rmp_serde::to_vec_named(desc)?;
        let data = pack_object_with_context(
            ObjectType::FormatDescriptor,
            key.as_bytes(),
            &plaintext,
            self.crypto.as_ref(),
        )?;
        match self.storage.put_if_absent(&key, &data)? {
            PutOutcome::Written => {
                self.observe(desc.format_version);
                info!(version = desc.format_version, "published format descriptor");
                Ok(())
            }
            PutOutcome::AlreadyExists => {
                debug!(version = desc.format_version, "format descriptor already present");
                self.observe(desc.format_version);
                Err(CairnError::FormatConflict(desc.format_version))
            }
        }
    }
}
