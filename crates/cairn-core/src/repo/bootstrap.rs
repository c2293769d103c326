use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::debug;

use cairn_crypto::{engine_for, CryptoEngine, EncryptedKey, EncryptionAlgorithm, KdfParams, MasterKey};
use cairn_storage::{PutOutcome, StorageBackend};
use cairn_types::error::{CairnError, Result};

/// Storage key of the unencrypted bootstrap blob.
pub const BOOTSTRAP_KEY: &str = "cairn.repository";
const BOOTSTRAP_MAGIC: &str = "cairn-repository";

/// Everything a client needs before it can decrypt anything: the repository
/// identity and the passphrase-wrapped master key. Written once at creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapBlob {
    pub magic: String,
    pub unique_id: String,
    pub encryption: EncryptionAlgorithm,
    #[serde(default)]
    pub key: Option<EncryptedKey>,
    pub created: DateTime<Utc>,
}

impl BootstrapBlob {
    /// Generate identity and key material for a new repository.
    pub fn generate(
        encryption: EncryptionAlgorithm,
        passphrase: Option<&str>,
        kdf: KdfParams,
        now: DateTime<Utc>,
    ) -> Result<(Self, Arc<dyn CryptoEngine>)> {
        let mut id = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut id);
        let unique_id = hex::encode(id);

        let (key, master) = match encryption {
            EncryptionAlgorithm::None => (None, MasterKey::for_unencrypted(&unique_id)),
            _ => {
                let passphrase = passphrase.ok_or_else(|| {
                    CairnError::Config("an encrypted repository requires a passphrase".into())
                })?;
                let master = MasterKey::generate();
                (Some(master.wrap(passphrase, kdf)?), master)
            }
        };
        let blob = Self {
            magic: BOOTSTRAP_MAGIC.to_string(),
            unique_id,
            encryption,
            key,
            created: now,
        };
        Ok((blob, engine_for(encryption, &master)))
    }

    /// Persist the bootstrap blob; fails if a repository already exists.
    pub fn write_new(&self, storage: &dyn StorageBackend, location: &str) -> Result<()> {
        let data = rmp_serde::to_vec_named(self)?;
        match storage.put_if_absent(BOOTSTRAP_KEY, &data)? {
            PutOutcome::Written => {
                debug!(unique_id = %self.unique_id, "wrote repository bootstrap");
                Ok(())
            }
            PutOutcome::AlreadyExists => Err(CairnError::RepoAlreadyExists(location.to_string())),
        }
    }

    pub fn read(storage: &dyn StorageBackend, location: &str) -> Result<Self> {
        let data = storage
            .get(BOOTSTRAP_KEY)?
            .ok_or_else(|| CairnError::RepoNotFound(location.to_string()))?;
        let blob: Self = rmp_serde::from_slice(&data)?;
        if blob.magic != BOOTSTRAP_MAGIC {
            return Err(CairnError::InvalidFormat(format!(
                "bad bootstrap magic '{}'",
                blob.magic
            )));
        }
        Ok(blob)
    }

    /// Unwrap the master key and build the repository's crypto engine.
    pub fn unlock(&self, passphrase: Option<&str>) -> Result<Arc<dyn CryptoEngine>> {
        let master = match (&self.encryption, &self.key) {
            (EncryptionAlgorithm::None, _) => MasterKey::for_unencrypted(&self.unique_id),
            (_, Some(wrapped)) => {
                let passphrase = passphrase.ok_or_else(|| {
                    CairnError::Config("this repository is encrypted; a passphrase is required".into())
                })?;
                MasterKey::unwrap_with(wrapped, passphrase)?
            }
            (_, None) => {
                return Err(CairnError::InvalidFormat(
                    "encrypted repository has no wrapped key".into(),
                ))
            }
        };
        Ok(engine_for(self.encryption, &master))
    }
}
