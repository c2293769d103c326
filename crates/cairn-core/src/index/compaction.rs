use chrono::{DateTime, Utc};
use tracing::{info, warn};

use cairn_crypto::CryptoEngine;
use cairn_storage::StorageBackend;
use cairn_types::error::Result;

use crate::repo::version::FormatFeatures;

use super::blob::{write_index_blob, IndexBlobHeader};
use super::loader::{load_visible_index, LoadedIndex};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CompactionStats {
    pub blobs_merged: usize,
    pub entries_written: usize,
    pub new_blob: Option<String>,
}

/// Every blob key a replacement must name in `supersedes`. Already
/// superseded blobs are carried forward so they stay hidden once their
/// original replacement is cleaned up.
fn consumed_keys(loaded: &LoadedIndex) -> Vec<String> {
    let mut keys = loaded.live_blobs.clone();
    keys.extend(loaded.superseded.iter().map(|(k, _)| k.clone()));
    keys.extend(loaded.rejected.iter().cloned());
    keys.sort();
    keys.dedup();
    keys
}

/// Merge every live index blob into one that supersedes them. Lookups give
/// the same answers before and after.
pub fn compact_indexes(
    storage: &dyn StorageBackend,
    crypto: &dyn CryptoEngine,
    features: &FormatFeatures,
    min_blobs: usize,
    now: DateTime<Utc>,
) -> Result<CompactionStats> {
    let loaded = load_visible_index(storage, crypto, features.format_version)?;
    if loaded.live_blobs.len() < min_blobs.max(2) {
        return Ok(CompactionStats::default());
    }

    let entries = loaded.index.sorted_entries();
    let header = IndexBlobHeader {
        format_version: features.format_version,
        created: now,
        supersedes: consumed_keys(&loaded),
    };
    let key = write_index_blob(storage, crypto, features.index_version, &header, &entries)?;
    info!(
        merged = loaded.live_blobs.len(),
        entries = entries.len(),
        key = %key,
        "compacted index blobs"
    );
    Ok(CompactionStats {
        blobs_merged: loaded.live_blobs.len(),
        entries_written: entries.len(),
        new_blob: Some(key),
    })
}

/// Re-encode the index visible at `from` as a single blob for `to`.
///
/// The new blob supersedes every blob that was visible, superseded or
/// rejected at `from`, so readers at `to` only see it and later writes.
/// Returns the new blob's key, or `None` if there was nothing to carry over.
pub fn rewrite_for_format(
    storage: &dyn StorageBackend,
    crypto: &dyn CryptoEngine,
    from: &FormatFeatures,
    to: &FormatFeatures,
    now: DateTime<Utc>,
) -> Result<Option<String>> {
    let loaded = load_visible_index(storage, crypto, from.format_version)?;
    let supersedes = consumed_keys(&loaded);
    if supersedes.is_empty() {
        return Ok(None);
    }

    let entries = loaded.index.sorted_entries();
    let header = IndexBlobHeader {
        format_version: to.format_version,
        created: now,
        supersedes,
    };
    let key = write_index_blob(storage, crypto, to.index_version, &header, &entries)?;
    info!(
        from = from.format_version,
        to = to.format_version,
        entries = entries.len(),
        key = %key,
        "rewrote index for new format"
    );
    Ok(Some(key))
}

/// Delete superseded index blobs whose replacement is older than `min_age`.
/// Returns the number of blobs deleted.
pub fn cleanup_superseded(
    storage: &dyn StorageBackend,
    crypto: &dyn CryptoEngine,
    format_version: u32,
    min_age: chrono::Duration,
    now: DateTime<Utc>,
) -> Result<usize> {
    let loaded = load_visible_index(storage, crypto, format_version)?;
    let mut deleted = 0;
    for (key, superseded_at) in &loaded.superseded {
        if now - *superseded_at < min_age {
            continue;
        }
        match storage.delete(key) {
            Ok(()) => deleted += 1,
            Err(e) => warn!(key = %key, error = %e, "failed to delete superseded index blob"),
        }
    }
    if deleted > 0 {
        info!(deleted, "removed superseded index blobs");
    }
    Ok(deleted)
}
