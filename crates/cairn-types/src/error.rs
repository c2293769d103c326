use thiserror::Error;

use crate::content_id::ContentId;

pub type Result<T> = std::result::Result<T, CairnError>;

#[derive(Debug, Error)]
pub enum CairnError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("object not found: '{0}'")]
    NotFound(String),

    #[error("repository not found at '{0}'")]
    RepoNotFound(String),

    #[error("repository already exists at '{0}'")]
    RepoAlreadyExists(String),

    #[error("decryption failed: wrong passphrase or corrupted data")]
    DecryptionFailed,

    #[error("key derivation error: {0}")]
    KeyDerivation(String),

    #[error("invalid repository format: {0}")]
    InvalidFormat(String),

    #[error("unknown object type tag: {0}")]
    UnknownObjectType(u8),

    #[error("unknown compression tag: {0}")]
    UnknownCompressionTag(u8),

    #[error("decompression error: {0}")]
    Decompression(String),

    #[error(
        "repository format version {found} is not supported by this client \
         (supports up to {max_supported}); upgrade the client"
    )]
    UnsupportedFormatVersion { found: u32, max_supported: u32 },

    #[error(
        "repository format v{cached} has been superseded by v{superseded_by}; \
         reconnect to pick up the new format"
    )]
    RepositoryFormatSuperseded { cached: u32, superseded_by: u32 },

    #[error("refusing to write format v{proposed}: repository is already at v{current}")]
    FormatDowngrade { proposed: u32, current: u32 },

    #[error("format v{0} was written concurrently by another client")]
    FormatConflict(u32),

    #[error("upgrade lock is held by '{holder}'")]
    LockContention { holder: String },

    #[error(
        "local clock differs from the storage clock by {drift_ms}ms \
         (max permitted {max_ms}ms)"
    )]
    ClockDrift { drift_ms: i64, max_ms: u64 },

    #[error("repository upgrade by '{owner}' is {state}; writes are refused until it finishes")]
    UpgradeInProgress { owner: String, state: String },

    #[error("repository upgrade is incomplete: {0}")]
    UpgradeIncomplete(String),

    #[error("content not found: {0}")]
    ContentNotFound(ContentId),

    #[error("content {0} failed integrity verification")]
    ContentIntegrity(ContentId),

    #[error("serialization error: {0}")]
    Serialization(#[from] rmp_serde::encode::Error),

    #[error("deserialization error: {0}")]
    Deserialization(#[from] rmp_serde::decode::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("unsupported backend: '{0}'")]
    UnsupportedBackend(String),

    #[error("{0}")]
    Other(String),
}

impl CairnError {
    /// Errors a caller may retry after waiting or reconnecting. The engine
    /// itself never retries them.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CairnError::LockContention { .. }
                | CairnError::RepositoryFormatSuperseded { .. }
                | CairnError::UpgradeInProgress { .. }
        )
    }

    /// Errors that mean the client's view of the repository format is no
    /// longer authoritative and it must reconnect.
    pub fn requires_reconnect(&self) -> bool {
        matches!(
            self,
            CairnError::RepositoryFormatSuperseded { .. }
                | CairnError::UnsupportedFormatVersion { .. }
        )
    }
}
