use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use cairn_crypto::CryptoEngine;
use cairn_storage::StorageBackend;
use cairn_types::error::{CairnError, Result};

use super::blob::{list_index_blobs, read_index_blob, IndexBlob};
use super::ContentIndex;

/// Attempts at a consistent listing before giving up.
const MAX_LOAD_ATTEMPTS: usize = 5;

/// Result of reading every index blob visible at one format version.
#[derive(Debug, Default)]
pub struct LoadedIndex {
    pub index: ContentIndex,
    /// Blobs whose entries were merged.
    pub live_blobs: Vec<String>,
    /// Blobs replaced by a newer one, with the creation time of the newest
    /// blob that replaced them.
    pub superseded: Vec<(String, DateTime<Utc>)>,
    /// Blobs written under an older format after the upgrade began.
    pub rejected: Vec<String>,
    /// Blobs written under a newer format than the one being loaded.
    pub future: Vec<String>,
}

/// Load the index as seen by a client operating at `format_version`.
///
/// Blobs from newer formats are invisible. Blobs named in another visible
/// blob's `supersedes` list are skipped. Any remaining blob from an older
/// format is a write that lost the race with an upgrade and is rejected.
pub fn load_visible_index(
    storage: &dyn StorageBackend,
    crypto: &dyn CryptoEngine,
    format_version: u32,
) -> Result<LoadedIndex> {
    for attempt in 1..=MAX_LOAD_ATTEMPTS {
        match read_all(storage, crypto)? {
            Some(blobs) => return Ok(resolve(blobs, format_version)),
            None => debug!(attempt, "index blob vanished during load, re-listing"),
        }
    }
    Err(CairnError::Other(format!(
        "index kept changing while loading ({MAX_LOAD_ATTEMPTS} attempts)"
    )))
}

/// Read every listed blob, or `None` if one disappeared mid-read.
fn read_all(
    storage: &dyn StorageBackend,
    crypto: &dyn CryptoEngine,
) -> Result<Option<Vec<IndexBlob>>> {
    let keys = list_index_blobs(storage)?;
    let mut blobs = Vec::with_capacity(keys.len());
    for key in keys {
        match read_index_blob(storage, crypto, &key)? {
            Some(blob) => blobs.push(blob),
            None => return Ok(None),
        }
    }
    Ok(Some(blobs))
}

fn resolve(blobs: Vec<IndexBlob>, format_version: u32) -> LoadedIndex {
    let mut loaded = LoadedIndex::default();

    let (visible, future): (Vec<IndexBlob>, Vec<IndexBlob>) = blobs
        .into_iter()
        .partition(|b| b.header.format_version <= format_version);
    loaded.future = future.into_iter().map(|b| b.key).collect();

    let mut superseded_at: HashMap<&str, DateTime<Utc>> = HashMap::new();
    for blob in &visible {
        for key in &blob.header.supersedes {
            let at = superseded_at.entry(key.as_str()).or_insert(blob.header.created);
            if blob.header.created > *at {
                *at = blob.header.created;
            }
        }
    }

    let mut merged: HashSet<String> = HashSet::new();
    for blob in &visible {
        if let Some(at) = superseded_at.get(blob.key.as_str()) {
            loaded.superseded.push((blob.key.clone(), *at));
            continue;
        }
        if blob.header.format_version < format_version {
            warn!(
                key = %blob.key,
                written_at = blob.header.format_version,
                current = format_version,
                "ignoring index blob written under a superseded format"
            );
            loaded.rejected.push(blob.key.clone());
            continue;
        }
        loaded.index.extend(blob.entries.iter().copied());
        merged.insert(blob.key.clone());
    }
    loaded.live_blobs = merged.into_iter().collect();
    loaded.live_blobs.sort();
    loaded
}
