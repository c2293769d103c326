pub mod aes_gcm;
pub mod chacha20_poly1305;
pub mod hash;
pub mod key;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use cairn_types::error::{CairnError, Result};

pub use hash::HashAlgorithm;
pub use key::{EncryptedKey, KdfParams, MasterKey};

/// Trait for encrypting and decrypting repository objects.
pub trait CryptoEngine: Send + Sync {
    /// Encrypt plaintext. Returns `[nonce][ciphertext+tag]`.
    /// `aad` is authenticated but not encrypted (e.g., the type tag byte).
    fn encrypt(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>>;

    /// Decrypt data produced by `encrypt`.
    /// `aad` must match what was passed during encryption.
    fn decrypt(&self, data: &[u8], aad: &[u8]) -> Result<Vec<u8>>;

    /// Whether this engine actually encrypts data.
    fn is_encrypting(&self) -> bool;

    /// The key mixed into content-ID hashing.
    fn content_id_key(&self) -> &[u8; 32];
}

/// No-encryption engine. Still computes deterministic content IDs.
pub struct PlaintextEngine {
    content_id_key: [u8; 32],
}

impl PlaintextEngine {
    pub fn new(content_id_key: &[u8; 32]) -> Self {
        Self {
            content_id_key: *content_id_key,
        }
    }
}

impl CryptoEngine for PlaintextEngine {
    fn encrypt(&self, plaintext: &[u8], _aad: &[u8]) -> Result<Vec<u8>> {
        Ok(plaintext.to_vec())
    }

    fn decrypt(&self, data: &[u8], _aad: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn is_encrypting(&self) -> bool {
        false
    }

    fn content_id_key(&self) -> &[u8; 32] {
        &self.content_id_key
    }
}

/// Encryption algorithm recorded in the repository bootstrap and format
/// descriptor. Fixed at creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EncryptionAlgorithm {
    None,
    #[default]
    Aes256Gcm,
    Chacha20Poly1305,
}

impl EncryptionAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            EncryptionAlgorithm::None => "none",
            EncryptionAlgorithm::Aes256Gcm => "aes256gcm",
            EncryptionAlgorithm::Chacha20Poly1305 => "chacha20poly1305",
        }
    }
}

impl fmt::Display for EncryptionAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EncryptionAlgorithm {
    type Err = CairnError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('-', "").as_str() {
            "none" => Ok(EncryptionAlgorithm::None),
            "aes256gcm" => Ok(EncryptionAlgorithm::Aes256Gcm),
            "chacha20poly1305" => Ok(EncryptionAlgorithm::Chacha20Poly1305),
            other => Err(CairnError::Config(format!(
                "unknown encryption algorithm '{other}' (expected none, aes256gcm or chacha20poly1305)"
            ))),
        }
    }
}

/// Build the engine for a repository's encryption algorithm.
pub fn engine_for(algorithm: EncryptionAlgorithm, key: &MasterKey) -> Arc<dyn CryptoEngine> {
    match algorithm {
        EncryptionAlgorithm::None => Arc::new(PlaintextEngine::new(&key.content_id_key)),
        EncryptionAlgorithm::Aes256Gcm => Arc::new(aes_gcm::Aes256GcmEngine::new(
            &key.encryption_key,
            &key.content_id_key,
        )),
        EncryptionAlgorithm::Chacha20Poly1305 => Arc::new(
            chacha20_poly1305::ChaCha20Poly1305Engine::new(&key.encryption_key, &key.content_id_key),
        ),
    }
}
