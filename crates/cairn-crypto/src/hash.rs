use std::fmt;
use std::str::FromStr;

use blake2::digest::consts::U32;
use blake2::digest::Mac;
use blake2::{Blake2bMac, Blake2sMac};
use serde::{Deserialize, Serialize};

use cairn_types::error::{CairnError, Result};
use cairn_types::ContentId;

type KeyedBlake2b256 = Blake2bMac<U32>;
type KeyedBlake2s256 = Blake2sMac<U32>;

/// Keyed hash used to derive content IDs. Fixed per repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HashAlgorithm {
    #[default]
    Blake2bKeyed256,
    Blake2sKeyed256,
}

impl HashAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            HashAlgorithm::Blake2bKeyed256 => "blake2b-256-keyed",
            HashAlgorithm::Blake2sKeyed256 => "blake2s-256-keyed",
        }
    }

    /// Compute the content ID of `data` under `key`.
    pub fn compute(&self, key: &[u8; 32], data: &[u8]) -> Result<ContentId> {
        let digest = match self {
            HashAlgorithm::Blake2bKeyed256 => {
                let mut mac = KeyedBlake2b256::new_from_slice(key)
                    .map_err(|e| CairnError::KeyDerivation(format!("blake2b key: {e}")))?;
                Mac::update(&mut mac, data);
                mac.finalize().into_bytes()
            }
            HashAlgorithm::Blake2sKeyed256 => {
                let mut mac = KeyedBlake2s256::new_from_slice(key)
                    .map_err(|e| CairnError::KeyDerivation(format!("blake2s key: {e}")))?;
                Mac::update(&mut mac, data);
                mac.finalize().into_bytes()
            }
        };
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        Ok(ContentId(out))
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HashAlgorithm {
    type Err = CairnError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "blake2b" | "blake2b-256" | "blake2b-256-keyed" => Ok(HashAlgorithm::Blake2bKeyed256),
            "blake2s" | "blake2s-256" | "blake2s-256-keyed" => Ok(HashAlgorithm::Blake2sKeyed256),
            other => Err(CairnError::Config(format!("unknown hash algorithm '{other}'"))),
        }
    }
}
