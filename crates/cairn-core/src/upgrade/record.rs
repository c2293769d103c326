use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use cairn_storage::{PutOutcome, StorageBackend};
use cairn_types::error::{CairnError, Result};

use crate::clock::to_chrono;

pub const UPGRADE_LOCK_PREFIX: &str = "upgrade-lock/";

/// Re-list attempts when the latest revision disappears under a reader.
const MAX_READ_ATTEMPTS: usize = 3;

/// Where an upgrade stands. `None` and `Acquiring` only exist in memory;
/// every persisted revision carries one of the others.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpgradeState {
    None,
    Acquiring,
    Held,
    Draining,
    Committing,
    Committed,
    Aborted,
}

impl UpgradeState {
    pub fn as_str(self) -> &'static str {
        match self {
            UpgradeState::None => "none",
            UpgradeState::Acquiring => "acquiring",
            UpgradeState::Held => "held",
            UpgradeState::Draining => "draining",
            UpgradeState::Committing => "committing",
            UpgradeState::Committed => "committed",
            UpgradeState::Aborted => "aborted",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, UpgradeState::Committed | UpgradeState::Aborted)
    }

    /// Whether a revision in this state may directly follow one in `prev`.
    /// `Held` after `Held`/`Draining` is a takeover of a stale lock, and
    /// `Committing` after `Committing` is a heartbeat or a resumed commit.
    pub fn may_follow(self, prev: Option<UpgradeState>) -> bool {
        use UpgradeState::*;
        match self {
            None | Acquiring => false,
            Held => matches!(
                prev,
                Option::None | Some(Aborted) | Some(Committed) | Some(Held) | Some(Draining)
            ),
            Draining => matches!(prev, Some(Held) | Some(Draining)),
            Committing => matches!(prev, Some(Draining) | Some(Committing)),
            Committed => matches!(prev, Some(Committing)),
            Aborted => matches!(prev, Some(Held) | Some(Draining) | Some(Committing)),
        }
    }
}

impl fmt::Display for UpgradeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One revision of the upgrade lock, stored as
/// `upgrade-lock/v<source>/r<revision>` (plain JSON, readable without keys).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    /// Unique per upgrade attempt. Survives a resumed commit.
    pub lock_id: String,
    pub owner_id: String,
    pub state: UpgradeState,
    pub revision: u64,
    pub source_version: u32,
    pub target_version: u32,
    pub creation_time: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub io_drain_timeout_ms: u64,
    pub status_poll_interval_ms: u64,
    pub allow_unsafe_upgrade: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drain_deadline: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_max_pack_size: Option<u32>,
    /// Index blob written for the target format, once known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rewrite_blob: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl LockRecord {
    pub fn io_drain_timeout(&self) -> Duration {
        Duration::from_millis(self.io_drain_timeout_ms)
    }

    pub fn status_poll_interval(&self) -> Duration {
        Duration::from_millis(self.status_poll_interval_ms)
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// The owner has not advanced the record for `multiplier` drain windows.
    pub fn is_stale(&self, now: DateTime<Utc>, multiplier: u32) -> bool {
        if self.is_terminal() {
            return false;
        }
        let window = to_chrono(self.io_drain_timeout().saturating_mul(multiplier));
        now - self.updated_at > window
    }

    /// The next revision of this record in `state`.
    pub fn advance(&self, state: UpgradeState, now: DateTime<Utc>) -> Result<LockRecord> {
        if !state.may_follow(Some(self.state)) {
            return Err(CairnError::Other(format!(
                "invalid upgrade lock transition {} -> {state}",
                self.state
            )));
        }
        Ok(LockRecord {
            state,
            revision: self.revision + 1,
            updated_at: now,
            ..self.clone()
        })
    }

    pub fn key(&self) -> String {
        record_key(self.source_version, self.revision)
    }
}

pub fn lock_dir(source_version: u32) -> String {
    format!("{UPGRADE_LOCK_PREFIX}v{source_version:010}/")
}

pub fn record_key(source_version: u32, revision: u64) -> String {
    format!("{}r{revision:010}", lock_dir(source_version))
}

fn parse_revision(key: &str, dir: &str) -> Option<u64> {
    key.strip_prefix(dir)?.strip_prefix('r')?.parse().ok()
}

/// Revisions present for an upgrade away from `source_version`, ascending.
pub fn list_revisions(storage: &dyn StorageBackend, source_version: u32) -> Result<Vec<u64>> {
    let dir = lock_dir(source_version);
    let mut revisions: Vec<u64> = storage
        .list(&dir)?
        .iter()
        .filter_map(|k| parse_revision(k, &dir))
        .collect();
    revisions.sort_unstable();
    revisions.dedup();
    Ok(revisions)
}

/// The highest revision of the lock for `source_version`, if any.
pub fn read_latest(storage: &dyn StorageBackend, source_version: u32) -> Result<Option<LockRecord>> {
    for attempt in 1..=MAX_READ_ATTEMPTS {
        let Some(&revision) = list_revisions(storage, source_version)?.last() else {
            return Ok(None);
        };
        match storage.get(&record_key(source_version, revision))? {
            Some(data) => return Ok(Some(serde_json::from_slice(&data)?)),
            None => debug!(attempt, revision, "lock revision vanished, re-listing"),
        }
    }
    Ok(None)
}

/// Publish `record` at its revision. `false` means that revision was
/// already taken, so whoever wrote it owns the lock now.
pub fn try_write(storage: &dyn StorageBackend, record: &LockRecord) -> Result<bool> {
    let data = serde_json::to_vec_pretty(record)?;
    let outcome = storage.put_if_absent(&record.key(), &data)?;
    debug!(
        lock_id = %record.lock_id,
        revision = record.revision,
        state = %record.state,
        written = outcome == PutOutcome::Written,
        "upgrade lock write"
    );
    Ok(outcome == PutOutcome::Written)
}

/// Delete every revision for `source_version`, oldest first so the latest
/// revision stays readable until the end. Returns how many were removed.
pub fn remove_chain(storage: &dyn StorageBackend, source_version: u32) -> Result<usize> {
    let revisions = list_revisions(storage, source_version)?;
    for revision in &revisions {
        storage.delete(&record_key(source_version, *revision))?;
    }
    Ok(revisions.len())
}

/// Source versions that have a lock directory.
pub fn list_lock_sources(storage: &dyn StorageBackend) -> Result<Vec<u32>> {
    let mut sources: Vec<u32> = storage
        .list(UPGRADE_LOCK_PREFIX)?
        .iter()
        .filter_map(|k| {
            k.strip_prefix(UPGRADE_LOCK_PREFIX)?
                .strip_prefix('v')?
                .split('/')
                .next()?
                .parse()
                .ok()
        })
        .collect();
    sources.sort_unstable();
    sources.dedup();
    Ok(sources)
}
