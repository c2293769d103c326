use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use cairn_storage::StorageConfig;
use cairn_types::error::{CairnError, Result};

use crate::repo::descriptor::FormatDescriptor;

/// Environment variable selecting the connection config file.
pub const CONFIG_ENV: &str = "CAIRN_CONFIG";
/// Environment variable toggling the live-upgrade lock protocol.
pub const UPGRADE_LOCK_ENV: &str = "CAIRN_UPGRADE_LOCK_ENABLED";
/// Accepted alias of [`UPGRADE_LOCK_ENV`].
pub const UPGRADE_LOCK_ENV_ALIAS: &str = "KOPIA_UPGRADE_LOCK_ENABLED";

pub const DEFAULT_STATUS_POLL_INTERVAL: Duration = Duration::from_secs(15);
pub const DEFAULT_IO_DRAIN_TIMEOUT: Duration = Duration::from_secs(15 * 60);
pub const DEFAULT_MAX_PERMITTED_CLOCK_DRIFT: Duration = Duration::from_secs(5);
pub const DEFAULT_STALE_LOCK_MULTIPLIER: u32 = 3;
/// A lock whose last revision is younger than two drain windows is never stale.
pub const MIN_STALE_LOCK_MULTIPLIER: u32 = 2;

fn default_status_poll_interval() -> Duration {
    DEFAULT_STATUS_POLL_INTERVAL
}

fn default_stale_lock_multiplier() -> u32 {
    DEFAULT_STALE_LOCK_MULTIPLIER
}

/// Per-client tuning persisted with the connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientOptions {
    /// How long an observation of lock and poison state stays fresh.
    #[serde(
        default = "default_status_poll_interval",
        with = "human_duration"
    )]
    pub status_poll_interval: Duration,
    #[serde(default = "default_stale_lock_multiplier")]
    pub stale_lock_multiplier: u32,
    /// Overrides the environment toggle when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upgrade_lock_enabled: Option<bool>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            status_poll_interval: DEFAULT_STATUS_POLL_INTERVAL,
            stale_lock_multiplier: DEFAULT_STALE_LOCK_MULTIPLIER,
            upgrade_lock_enabled: None,
        }
    }
}

impl ClientOptions {
    pub fn lock_enabled(&self) -> bool {
        self.upgrade_lock_enabled
            .unwrap_or_else(upgrade_lock_enabled_from_env)
    }

    pub fn validate(&self) -> Result<()> {
        if self.status_poll_interval.is_zero() {
            return Err(CairnError::Config(
                "status_poll_interval must be greater than zero".into(),
            ));
        }
        if self.stale_lock_multiplier < MIN_STALE_LOCK_MULTIPLIER {
            return Err(CairnError::Config(format!(
                "stale_lock_multiplier must be at least {MIN_STALE_LOCK_MULTIPLIER}"
            )));
        }
        Ok(())
    }
}

/// A client's persisted connection: where the repository lives and the
/// format descriptor it last observed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub storage: StorageConfig,
    pub format: FormatDescriptor,
    pub connected_at: DateTime<Utc>,
    /// Owner id used for upgrades started from this connection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<String>,
    #[serde(default)]
    pub options: ClientOptions,
}

/// Where the connection config path came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    /// Explicitly passed via `--config`.
    CliArg(PathBuf),
    /// Set via the `CAIRN_CONFIG` env var.
    EnvVar(PathBuf),
    /// Per-user default location.
    UserDefault(PathBuf),
}

impl ConfigSource {
    pub fn path(&self) -> &Path {
        match self {
            ConfigSource::CliArg(p) => p,
            ConfigSource::EnvVar(p) => p,
            ConfigSource::UserDefault(p) => p,
        }
    }
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigSource::CliArg(p) => write!(f, "{} (--config)", p.display()),
            ConfigSource::EnvVar(p) => write!(f, "{} ({CONFIG_ENV})", p.display()),
            ConfigSource::UserDefault(p) => write!(f, "{} (user)", p.display()),
        }
    }
}

/// Resolve the connection config path: `--config`, then `$CAIRN_CONFIG`,
/// then `<config dir>/cairn/repository.yaml`.
pub fn resolve_config_path(cli_config: Option<&str>) -> Result<ConfigSource> {
    if let Some(path) = cli_config {
        return Ok(ConfigSource::CliArg(PathBuf::from(path)));
    }
    if let Ok(val) = std::env::var(CONFIG_ENV) {
        if !val.is_empty() {
            return Ok(ConfigSource::EnvVar(PathBuf::from(val)));
        }
    }
    dirs::config_dir()
        .map(|base| ConfigSource::UserDefault(base.join("cairn").join("repository.yaml")))
        .ok_or_else(|| {
            CairnError::Config(format!(
                "cannot determine a config directory; pass --config or set {CONFIG_ENV}"
            ))
        })
}

/// Load a connection config. A missing file means "not connected".
pub fn load_connection(path: &Path) -> Result<ConnectionConfig> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(CairnError::Config(format!(
                "not connected to a repository ({} does not exist); run `cairn repo connect`",
                path.display()
            )));
        }
        Err(e) => return Err(e.into()),
    };
    let cfg: ConnectionConfig = serde_yaml::from_str(&contents)
        .map_err(|e| CairnError::Config(format!("{}: {e}", path.display())))?;
    cfg.options.validate()?;
    Ok(cfg)
}

/// Atomically write a connection config, creating parent directories.
pub fn save_connection(path: &Path, cfg: &ConnectionConfig) -> Result<()> {
    let yaml = serde_yaml::to_string(cfg)
        .map_err(|e| CairnError::Config(format!("serialize connection: {e}")))?;
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
    tmp.write_all(yaml.as_bytes())?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Remove a connection config. Returns false if none existed.
pub fn remove_connection(path: &Path) -> Result<bool> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Interpret an upgrade-lock toggle value. Unset means enabled; only `0`
/// and `false` disable the protocol.
pub fn parse_lock_toggle(value: Option<&str>) -> bool {
    match value.map(str::trim) {
        None | Some("") => true,
        Some(v) => !(v == "0" || v.eq_ignore_ascii_case("false")),
    }
}

/// Read the upgrade-lock toggle from the environment.
pub fn upgrade_lock_enabled_from_env() -> bool {
    let value = std::env::var(UPGRADE_LOCK_ENV)
        .ok()
        .or_else(|| std::env::var(UPGRADE_LOCK_ENV_ALIAS).ok());
    parse_lock_toggle(value.as_deref())
}

/// Parse a duration like "500ms", "30s", "15m", "4h" or "2d". A bare number
/// is seconds.
pub fn parse_human_duration(raw: &str) -> Result<Duration> {
    let input = raw.trim();
    if input.is_empty() {
        return Err(CairnError::Config("duration must not be empty".into()));
    }

    let split = input
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(input.len());
    let (num_part, unit) = input.split_at(split);
    let value: u64 = num_part
        .parse()
        .map_err(|_| CairnError::Config(format!("invalid duration value: '{raw}'")))?;

    let duration = match unit.to_ascii_lowercase().as_str() {
        "ms" => Duration::from_millis(value),
        "" | "s" => Duration::from_secs(value),
        "m" => Duration::from_secs(value.saturating_mul(60)),
        "h" => Duration::from_secs(value.saturating_mul(60 * 60)),
        "d" => Duration::from_secs(value.saturating_mul(60 * 60 * 24)),
        other => {
            return Err(CairnError::Config(format!(
                "unsupported duration suffix '{other}' in '{raw}' (use ms/s/m/h/d)"
            )));
        }
    };

    if duration.is_zero() {
        return Err(CairnError::Config(
            "duration must be greater than zero".into(),
        ));
    }
    Ok(duration)
}

/// Render a duration in the largest unit that represents it exactly.
pub fn format_human_duration(d: Duration) -> String {
    let millis = d.as_millis();
    if millis % 1000 != 0 {
        return format!("{millis}ms");
    }
    let secs = d.as_secs();
    for (unit, size) in [("d", 86_400), ("h", 3_600), ("m", 60)] {
        if secs >= size && secs % size == 0 {
            return format!("{}{unit}", secs / size);
        }
    }
    format!("{secs}s")
}

mod human_duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::format_human_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        super::parse_human_duration(&raw).map_err(serde::de::Error::custom)
    }
}
