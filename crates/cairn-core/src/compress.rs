use std::fmt;
use std::io::Read;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use cairn_types::error::{CairnError, Result};

const TAG_NONE: u8 = 0x00;
const TAG_LZ4: u8 = 0x01;
const TAG_ZSTD: u8 = 0x02;

/// Largest plaintext a single content may have. Also bounds decompression
/// output so a crafted payload cannot balloon memory.
pub const MAX_DECOMPRESS_SIZE: u64 = 64 * 1024 * 1024;

pub const DEFAULT_ZSTD_LEVEL: i32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "algorithm", rename_all = "lowercase")]
pub enum Compression {
    None,
    #[default]
    Lz4,
    Zstd {
        level: i32,
    },
}

impl Compression {
    /// Parse from config string like "lz4", "zstd", "zstd:9", "none".
    pub fn from_config(algorithm: &str, zstd_level: i32) -> Result<Self> {
        match algorithm.split_once(':') {
            Some(("zstd", level)) => {
                let level = level
                    .parse()
                    .map_err(|_| CairnError::Config(format!("invalid zstd level '{level}'")))?;
                Ok(Compression::Zstd { level })
            }
            Some(_) => Err(CairnError::Config(format!(
                "unknown compression algorithm: {algorithm}"
            ))),
            None => match algorithm {
                "none" => Ok(Compression::None),
                "lz4" => Ok(Compression::Lz4),
                "zstd" => Ok(Compression::Zstd { level: zstd_level }),
                other => Err(CairnError::Config(format!(
                    "unknown compression algorithm: {other}"
                ))),
            },
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Compression::None => f.write_str("none"),
            Compression::Lz4 => f.write_str("lz4"),
            Compression::Zstd { level } => write!(f, "zstd:{level}"),
        }
    }
}

impl FromStr for Compression {
    type Err = CairnError;

    fn from_str(s: &str) -> Result<Self> {
        Compression::from_config(s, DEFAULT_ZSTD_LEVEL)
    }
}

/// Compress data and prepend a 1-byte tag identifying the codec.
pub fn compress(compression: Compression, data: &[u8]) -> Result<Vec<u8>> {
    let (tag, body) = match compression {
        Compression::None => (TAG_NONE, None),
        Compression::Lz4 => (TAG_LZ4, Some(lz4_flex::compress_prepend_size(data))),
        Compression::Zstd { level } => (
            TAG_ZSTD,
            Some(
                zstd::bulk::compress(data, level)
                    .map_err(|e| CairnError::Other(format!("zstd compress: {e}")))?,
            ),
        ),
    };
    let body = body.as_deref().unwrap_or(data);
    let mut out = Vec::with_capacity(1 + body.len());
    out.push(tag);
    out.extend_from_slice(body);
    Ok(out)
}

/// Decompress data by reading the 1-byte tag prefix and dispatching.
pub fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    decompress_with_hint(data, None)
}

/// Like [`decompress`], with a capacity hint. The hint is capped by
/// `MAX_DECOMPRESS_SIZE` and never bypasses the size limit.
pub fn decompress_with_hint(data: &[u8], expected_size: Option<usize>) -> Result<Vec<u8>> {
    let Some((&tag, payload)) = data.split_first() else {
        return Err(CairnError::Decompression("empty data".into()));
    };
    match tag {
        TAG_NONE => Ok(payload.to_vec()),
        TAG_LZ4 => {
            let Some(size_prefix) = payload.get(..4) else {
                return Err(CairnError::Decompression("lz4: payload too short".into()));
            };
            let mut size_bytes = [0u8; 4];
            size_bytes.copy_from_slice(size_prefix);
            let uncompressed_size = u32::from_le_bytes(size_bytes) as u64;
            if uncompressed_size > MAX_DECOMPRESS_SIZE {
                return Err(CairnError::Decompression(format!(
                    "lz4: decompressed size ({uncompressed_size}) exceeds limit of {MAX_DECOMPRESS_SIZE} bytes"
                )));
            }
            lz4_flex::decompress_size_prepended(payload)
                .map_err(|e| CairnError::Decompression(format!("lz4: {e}")))
        }
        TAG_ZSTD => {
            let mut decoder = zstd::stream::Decoder::new(std::io::Cursor::new(payload))
                .map_err(|e| CairnError::Decompression(format!("zstd init: {e}")))?;
            let hinted_capacity = expected_size
                .unwrap_or(0)
                .min(MAX_DECOMPRESS_SIZE as usize);
            let mut output = Vec::with_capacity(hinted_capacity);
            decoder
                .by_ref()
                .take(MAX_DECOMPRESS_SIZE + 1)
                .read_to_end(&mut output)
                .map_err(|e| CairnError::Decompression(format!("zstd: {e}")))?;
            if output.len() as u64 > MAX_DECOMPRESS_SIZE {
                return Err(CairnError::Decompression(format!(
                    "zstd: decompressed size exceeds limit of {MAX_DECOMPRESS_SIZE} bytes"
                )));
            }
            Ok(output)
        }
        _ => Err(CairnError::UnknownCompressionTag(tag)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decompress_rejects_lz4_bomb() {
        let mut data = vec![TAG_LZ4];
        data.extend_from_slice(&(1u32 << 30).to_le_bytes());
        data.extend_from_slice(&[0u8; 10]);
        assert!(decompress(&data).is_err());
    }

    #[test]
    fn decompress_rejects_lz4_short_payload() {
        assert!(decompress(&[TAG_LZ4, 0x00, 0x00]).is_err());
    }

    #[test]
    fn decompress_rejects_unknown_tag() {
        assert!(matches!(
            decompress(&[0x7f, 1, 2]),
            Err(CairnError::UnknownCompressionTag(0x7f))
        ));
    }

    #[test]
    fn every_codec_restores_input() {
        let payloads: &[&[u8]] = &[b"", b"short", &[0x42; 4096]];
        for codec in [
            Compression::None,
            Compression::Lz4,
            Compression::Zstd { level: 3 },
        ] {
            for payload in payloads {
                let encoded = compress(codec, payload).unwrap();
                assert_eq!(decompress(&encoded).unwrap(), *payload);
            }
        }
    }

    #[test]
    fn from_config_parses_level_suffix() {
        assert_eq!(
            "zstd:9".parse::<Compression>().unwrap(),
            Compression::Zstd { level: 9 }
        );
        assert_eq!(
            "zstd".parse::<Compression>().unwrap(),
            Compression::Zstd {
                level: DEFAULT_ZSTD_LEVEL
            }
        );
        assert!("brotli".parse::<Compression>().is_err());
        assert!("lz4:3".parse::<Compression>().is_err());
    }

    #[test]
    fn display_roundtrips_through_parse() {
        for c in [Compression::None, Compression::Lz4, Compression::Zstd { level: 7 }] {
            assert_eq!(c.to_string().parse::<Compression>().unwrap(), c);
        }
    }
}
