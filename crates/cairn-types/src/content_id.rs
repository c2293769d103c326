use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::CairnError;

/// A 32-byte content identifier: the keyed hash of a content's plaintext.
///
/// The hash algorithm is chosen per repository by the format descriptor; the
/// identifier itself is algorithm-agnostic.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContentId(pub [u8; 32]);

impl ContentId {
    /// Hex-encode the full content ID.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First byte as a two-char hex string, used for shard directories.
    pub fn shard_prefix(&self) -> String {
        hex::encode(&self.0[..1])
    }

    /// Parse a ContentId from a 64-character hex string.
    pub fn from_hex(hex_str: &str) -> Result<Self, CairnError> {
        let bytes = hex::decode(hex_str)
            .map_err(|e| CairnError::InvalidFormat(format!("invalid content id '{hex_str}': {e}")))?;
        if bytes.len() != 32 {
            return Err(CairnError::InvalidFormat(format!(
                "content id must be 32 bytes, got {}",
                bytes.len()
            )));
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(ContentId(arr))
    }

    /// Raw bytes for use as AAD context.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl FromStr for ContentId {
    type Err = CairnError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ContentId::from_hex(s.trim())
    }
}

impl fmt::Debug for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentId({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_parse_accepts_display_output() {
        let id = ContentId([0x5c; 32]);
        let parsed: ContentId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn from_hex_rejects_short_input() {
        let err = ContentId::from_hex("abcd").unwrap_err();
        assert!(err.to_string().contains("32 bytes"));
    }

    #[test]
    fn from_hex_rejects_non_hex() {
        assert!(ContentId::from_hex(&"zz".repeat(32)).is_err());
    }

    #[test]
    fn shard_prefix_is_first_byte() {
        let id = ContentId([0xAB; 32]);
        assert_eq!(id.shard_prefix(), "ab");
    }

    #[test]
    fn debug_is_abbreviated() {
        let id = ContentId([0x01; 32]);
        assert_eq!(format!("{id:?}"), "ContentId(0101010101010101)");
    }

    #[test]
    fn ordering_follows_bytes() {
        let low = ContentId([0x00; 32]);
        let high = ContentId([0xff; 32]);
        assert!(low < high);
    }
}
