use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use argon2::Argon2;
use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use cairn_types::error::{CairnError, Result};

/// The master key material. Never stored in plaintext.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct MasterKey {
    pub encryption_key: [u8; 32],
    pub content_id_key: [u8; 32],
}

#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct MasterKeyPayload {
    encryption_key: Vec<u8>,
    content_id_key: Vec<u8>,
}

/// KDF parameters stored alongside the wrapped key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    pub algorithm: String,
    pub time_cost: u32,
    pub memory_cost: u32,
    pub parallelism: u32,
    pub salt: Vec<u8>,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self::argon2id(3, 65536, 4)
    }
}

impl KdfParams {
    /// Argon2id parameters with a fresh random salt. `memory_cost` is in KiB.
    pub fn argon2id(time_cost: u32, memory_cost: u32, parallelism: u32) -> Self {
        let mut salt = vec![0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut salt);
        Self {
            algorithm: "argon2id".to_string(),
            time_cost,
            memory_cost,
            parallelism,
            salt,
        }
    }
}

/// Wrapped master key as stored in the repository bootstrap blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedKey {
    pub kdf: KdfParams,
    pub nonce: Vec<u8>,
    pub encrypted_payload: Vec<u8>,
}

impl MasterKey {
    /// Generate a new random master key using OS entropy.
    pub fn generate() -> Self {
        let mut encryption_key = [0u8; 32];
        let mut content_id_key = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut encryption_key);
        rand::rngs::OsRng.fill_bytes(&mut content_id_key);
        Self::from_parts(encryption_key, content_id_key)
    }

    pub fn from_parts(encryption_key: [u8; 32], content_id_key: [u8; 32]) -> Self {
        Self {
            encryption_key,
            content_id_key,
        }
    }

    /// Key material for unencrypted repositories. The content-ID key is
    /// derived from the repository's unique id so IDs stay repository-scoped.
    pub fn for_unencrypted(unique_id: &str) -> Self {
        let digest = Blake2b::<U32>::new()
            .chain_update(b"cairn:content-id-key:v1\0")
            .chain_update(unique_id.as_bytes())
            .finalize();
        let mut content_id_key = [0u8; 32];
        content_id_key.copy_from_slice(&digest);
        Self::from_parts([0u8; 32], content_id_key)
    }

    /// Wrap the master key with a passphrase using Argon2id + AES-256-GCM.
    pub fn wrap(&self, passphrase: &str, kdf: KdfParams) -> Result<EncryptedKey> {
        let wrapping_key = derive_key_from_passphrase(passphrase, &kdf)?;

        let payload = MasterKeyPayload {
            encryption_key: self.encryption_key.to_vec(),
            content_id_key: self.content_id_key.to_vec(),
        };
        let plaintext = Zeroizing::new(rmp_serde::to_vec(&payload)?);

        // KDF params are bound as AAD so they cannot be swapped undetected.
        let kdf_aad = kdf_params_aad(&kdf)?;
        let cipher = Aes256Gcm::new_from_slice(wrapping_key.as_ref())
            .map_err(|e| CairnError::KeyDerivation(format!("cipher init: {e}")))?;
        let mut nonce_bytes = [0u8; 12];
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: plaintext.as_ref(),
                    aad: &kdf_aad,
                },
            )
            .map_err(|e| CairnError::KeyDerivation(format!("encrypt: {e}")))?;

        Ok(EncryptedKey {
            kdf,
            nonce: nonce_bytes.to_vec(),
            encrypted_payload: ciphertext,
        })
    }

    /// Unwrap a master key. A wrong passphrase surfaces as `DecryptionFailed`.
    pub fn unwrap_with(encrypted: &EncryptedKey, passphrase: &str) -> Result<Self> {
        if encrypted.kdf.algorithm != "argon2id" {
            return Err(CairnError::KeyDerivation(format!(
                "unsupported KDF '{}'",
                encrypted.kdf.algorithm
            )));
        }
        if encrypted.nonce.len() != 12 {
            return Err(CairnError::DecryptionFailed);
        }
        let wrapping_key = derive_key_from_passphrase(passphrase, &encrypted.kdf)?;
        let cipher = Aes256Gcm::new_from_slice(wrapping_key.as_ref())
            .map_err(|_| CairnError::DecryptionFailed)?;
        let kdf_aad = kdf_params_aad(&encrypted.kdf)?;

        let plaintext = Zeroizing::new(
            cipher
                .decrypt(
                    Nonce::from_slice(&encrypted.nonce),
                    Payload {
                        msg: encrypted.encrypted_payload.as_ref(),
                        aad: &kdf_aad,
                    },
                )
                .map_err(|_| CairnError::DecryptionFailed)?,
        );

        let payload: MasterKeyPayload =
            rmp_serde::from_slice(&plaintext).map_err(|_| CairnError::DecryptionFailed)?;
        if payload.encryption_key.len() != 32 || payload.content_id_key.len() != 32 {
            return Err(CairnError::DecryptionFailed);
        }
        let mut encryption_key = [0u8; 32];
        let mut content_id_key = [0u8; 32];
        encryption_key.copy_from_slice(&payload.encryption_key);
        content_id_key.copy_from_slice(&payload.content_id_key);
        Ok(Self::from_parts(encryption_key, content_id_key))
    }
}

fn kdf_params_aad(kdf: &KdfParams) -> Result<Vec<u8>> {
    rmp_serde::to_vec(kdf)
        .map_err(|e| CairnError::KeyDerivation(format!("serialize kdf aad: {e}")))
}

/// Derive a 32-byte key from a passphrase using Argon2id.
fn derive_key_from_passphrase(passphrase: &str, kdf: &KdfParams) -> Result<Zeroizing<[u8; 32]>> {
    let params = argon2::Params::new(kdf.memory_cost, kdf.time_cost, kdf.parallelism, Some(32))
        .map_err(|e| CairnError::KeyDerivation(format!("argon2 params: {e}")))?;
    let argon2 = Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::V0x13, params);

    let mut output = Zeroizing::new([0u8; 32]);
    argon2
        .hash_password_into(passphrase.as_bytes(), &kdf.salt, output.as_mut())
        .map_err(|e| CairnError::KeyDerivation(format!("argon2 hash: {e}")))?;
    Ok(output)
}
