use cairn_types::error::{CairnError, Result};

use crate::index::IndexVersion;

use super::descriptor::FormatDescriptor;

/// Oldest format this engine can read and write.
pub const MIN_FORMAT_VERSION: u32 = 1;
/// Format newly created repositories get unless asked otherwise.
pub const DEFAULT_FORMAT_VERSION: u32 = 2;
/// Newest format this engine understands; the default upgrade target.
pub const LATEST_FORMAT_VERSION: u32 = 3;

/// What a given format version permits writers to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatFeatures {
    pub format_version: u32,
    pub index_version: IndexVersion,
    /// Whether content payloads may be compressed.
    pub compression: bool,
    /// Whether content envelopes bind the content ID into the AEAD AAD.
    pub content_bound_aad: bool,
}

/// Feature set of a format version, independent of any engine's limits.
pub fn features_for_version(version: u32) -> Result<FormatFeatures> {
    let features = match version {
        1 => FormatFeatures {
            format_version: 1,
            index_version: IndexVersion::V1,
            compression: false,
            content_bound_aad: false,
        },
        2 => FormatFeatures {
            format_version: 2,
            index_version: IndexVersion::V2,
            compression: true,
            content_bound_aad: false,
        },
        3 => FormatFeatures {
            format_version: 3,
            index_version: IndexVersion::V2,
            compression: true,
            content_bound_aad: true,
        },
        other => {
            return Err(CairnError::UnsupportedFormatVersion {
                found: other,
                max_supported: LATEST_FORMAT_VERSION,
            })
        }
    };
    Ok(features)
}

/// The format range an engine build supports. Pinning `max_format_version`
/// below [`LATEST_FORMAT_VERSION`] makes the engine behave like an older
/// release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineCapabilities {
    pub max_format_version: u32,
}

impl Default for EngineCapabilities {
    fn default() -> Self {
        Self::current()
    }
}

impl EngineCapabilities {
    pub const fn current() -> Self {
        Self {
            max_format_version: LATEST_FORMAT_VERSION,
        }
    }

    pub fn pinned(max_format_version: u32) -> Result<Self> {
        if !(MIN_FORMAT_VERSION..=LATEST_FORMAT_VERSION).contains(&max_format_version) {
            return Err(CairnError::Config(format!(
                "max format version must be between {MIN_FORMAT_VERSION} and {LATEST_FORMAT_VERSION}"
            )));
        }
        Ok(Self { max_format_version })
    }

    /// Version used by `create` when none is requested.
    pub fn default_create_version(&self) -> u32 {
        DEFAULT_FORMAT_VERSION.min(self.max_format_version)
    }

    /// Reject versions this engine cannot operate.
    pub fn check_supported(&self, version: u32) -> Result<()> {
        if version < MIN_FORMAT_VERSION || version > self.max_format_version {
            return Err(CairnError::UnsupportedFormatVersion {
                found: version,
                max_supported: self.max_format_version,
            });
        }
        Ok(())
    }
}

/// Decide how an engine operates a repository described by `desc`. Pure:
/// no I/O, same answer for the same inputs.
pub fn negotiate(desc: &FormatDescriptor, caps: &EngineCapabilities) -> Result<FormatFeatures> {
    caps.check_supported(desc.format_version)?;
    let features = features_for_version(desc.format_version)?;
    if desc.index_version != features.index_version.as_u8() {
        return Err(CairnError::InvalidFormat(format!(
            "format v{} declares index version {}, expected {}",
            desc.format_version,
            desc.index_version,
            features.index_version.as_u8()
        )));
    }
    Ok(features)
}
