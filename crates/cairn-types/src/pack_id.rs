use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::CairnError;

type Blake2b256 = Blake2b<U32>;

/// A 32-byte identifier for an immutable storage object (pack or index blob),
/// computed as unkeyed BLAKE2b-256 of the stored bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PackId(pub [u8; 32]);

impl PackId {
    /// Compute an ID as unkeyed BLAKE2b-256 of the entire object contents.
    pub fn compute(data: &[u8]) -> Self {
        let digest = Blake2b256::digest(data);
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        PackId(out)
    }

    /// Hex-encode the full ID.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First byte as a two-char hex string, used for shard directory.
    pub fn shard_prefix(&self) -> String {
        hex::encode(&self.0[..1])
    }

    /// Storage key path: `packs/<shard>/<full_hex>`.
    pub fn storage_key(&self) -> String {
        self.storage_key_in("packs")
    }

    /// Storage key under an arbitrary namespace: `<namespace>/<shard>/<full_hex>`.
    pub fn storage_key_in(&self, namespace: &str) -> String {
        format!("{namespace}/{}/{}", self.shard_prefix(), self.to_hex())
    }

    /// Parse the ID back out of a sharded storage key.
    pub fn from_storage_key(key: &str) -> Result<Self, CairnError> {
        let hex_part = key.rsplit('/').next().unwrap_or(key);
        let bytes = hex::decode(hex_part)
            .map_err(|e| CairnError::InvalidFormat(format!("invalid object key '{key}': {e}")))?;
        if bytes.len() != 32 {
            return Err(CairnError::InvalidFormat(format!(
                "invalid object key '{key}': expected 32 bytes"
            )));
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(PackId(arr))
    }
}

impl fmt::Debug for PackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PackId({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for PackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.to_hex()[..16])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compute_is_deterministic() {
        assert_eq!(PackId::compute(b"pack"), PackId::compute(b"pack"));
        assert_ne!(PackId::compute(b"pack"), PackId::compute(b"other"));
    }

    #[test]
    fn storage_key_is_sharded() {
        let id = PackId([0xcd; 32]);
        let key = id.storage_key();
        assert!(key.starts_with("packs/cd/"));
        assert_eq!(PackId::from_storage_key(&key).unwrap(), id);
    }

    #[test]
    fn storage_key_in_namespace() {
        let id = PackId([0x01; 32]);
        assert!(id.storage_key_in("index").starts_with("index/01/"));
    }

    #[test]
    fn from_storage_key_rejects_garbage() {
        assert!(PackId::from_storage_key("packs/zz/not-hex").is_err());
    }
}
