use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use cairn_storage::{PutOutcome, StorageBackend};
use cairn_types::error::{CairnError, Result};

pub const POISON_PREFIX: &str = "poison/";

/// Marker saying "format v`superseded_version` is dead". Once present,
/// clients still operating at that version must stop and reconnect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoisonRecord {
    pub superseded_version: u32,
    pub superseded_by: u32,
    pub lock_id: String,
    pub owner_id: String,
    pub written_at: DateTime<Utc>,
}

pub fn poison_key(version: u32) -> String {
    format!("{POISON_PREFIX}v{version:010}")
}

fn parse_poison_key(key: &str) -> Option<u32> {
    key.strip_prefix(POISON_PREFIX)?
        .strip_prefix('v')?
        .parse()
        .ok()
}

/// Write a poison record. An existing record for the same version is left
/// untouched and reported as `AlreadyExists`.
pub fn write_poison(storage: &dyn StorageBackend, record: &PoisonRecord) -> Result<PutOutcome> {
    let data = serde_json::to_vec_pretty(record)?;
    let outcome = storage.put_if_absent(&poison_key(record.superseded_version), &data)?;
    match outcome {
        PutOutcome::Written => info!(
            version = record.superseded_version,
            superseded_by = record.superseded_by,
            "poisoned format version"
        ),
        PutOutcome::AlreadyExists => debug!(
            version = record.superseded_version,
            "format version already poisoned"
        ),
    }
    Ok(outcome)
}

/// Poisoned versions, ascending.
pub fn list_poisoned_versions(storage: &dyn StorageBackend) -> Result<Vec<u32>> {
    let mut versions: Vec<u32> = storage
        .list(POISON_PREFIX)?
        .iter()
        .filter_map(|k| parse_poison_key(k))
        .collect();
    versions.sort_unstable();
    versions.dedup();
    Ok(versions)
}

pub fn read_poison(storage: &dyn StorageBackend, version: u32) -> Result<Option<PoisonRecord>> {
    match storage.get(&poison_key(version))? {
        Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
        None => Ok(None),
    }
}

/// Fail with `RepositoryFormatSuperseded` if `version` (or anything newer)
/// has been poisoned.
pub fn check_not_superseded(storage: &dyn StorageBackend, version: u32) -> Result<()> {
    let poisoned = list_poisoned_versions(storage)?;
    let Some(&highest) = poisoned.iter().filter(|v| **v >= version).max() else {
        return Ok(());
    };
    let superseded_by = read_poison(storage, highest)?
        .map(|r| r.superseded_by)
        .unwrap_or(highest + 1);
    Err(CairnError::RepositoryFormatSuperseded {
        cached: version,
        superseded_by,
    })
}
