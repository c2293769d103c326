use std::collections::{BTreeMap, HashSet};

use tracing::debug;

use cairn_crypto::CryptoEngine;
use cairn_storage::StorageBackend;
use cairn_types::error::{CairnError, Result};
use cairn_types::PackId;

use crate::index::{ContentEntry, ContentIndex};
use crate::repo::pack::read_pack_header;

/// A single integrity issue found during check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckError {
    pub context: String,
    pub message: String,
}

/// Summary of a pack check.
#[derive(Debug, Default)]
pub struct CheckReport {
    pub packs_checked: usize,
    pub entries_checked: usize,
    /// Packs in storage no index entry points at. A publish still in
    /// flight elsewhere shows up here too.
    pub unreferenced_packs: Vec<PackId>,
    pub errors: Vec<CheckError>,
}

/// Read the header of every pack the index references and confirm each
/// live entry sits where the index says it does.
pub fn check_packs(
    storage: &dyn StorageBackend,
    crypto: &dyn CryptoEngine,
    index: &ContentIndex,
) -> Result<CheckReport> {
    let mut referenced = HashSet::new();
    let mut live: BTreeMap<PackId, Vec<ContentEntry>> = BTreeMap::new();
    for entry in index.sorted_entries() {
        referenced.insert(entry.pack_id);
        if !entry.deleted {
            live.entry(entry.pack_id).or_default().push(entry);
        }
    }

    let mut report = CheckReport::default();
    for (pack_id, entries) in &live {
        report.packs_checked += 1;
        report.entries_checked += entries.len();
        let header = match read_pack_header(storage, pack_id, crypto) {
            Ok(header) => header,
            Err(CairnError::NotFound(_)) => {
                report.errors.push(CheckError {
                    context: format!("pack {pack_id}"),
                    message: format!("missing from storage ({} live entries)", entries.len()),
                });
                continue;
            }
            Err(e) => {
                report.errors.push(CheckError {
                    context: format!("pack {pack_id}"),
                    message: format!("unreadable header: {e}"),
                });
                continue;
            }
        };

        for entry in entries {
            let found = header.iter().find(|h| h.content_id == entry.content_id);
            let message = match found {
                None => "not listed in the pack header".to_string(),
                Some(h)
                    if h.offset != entry.offset
                        || h.length != entry.length
                        || h.original_length != entry.original_length =>
                {
                    format!(
                        "index says {}+{} ({} bytes), pack header says {}+{} ({} bytes)",
                        entry.offset,
                        entry.length,
                        entry.original_length,
                        h.offset,
                        h.length,
                        h.original_length
                    )
                }
                Some(_) => continue,
            };
            report.errors.push(CheckError {
                context: format!("content {} in pack {pack_id}", entry.content_id),
                message,
            });
        }
    }

    for key in storage.list("packs/")? {
        let pack_id = PackId::from_storage_key(&key)?;
        if !referenced.contains(&pack_id) {
            report.unreferenced_packs.push(pack_id);
        }
    }
    report.unreferenced_packs.sort();

    debug!(
        packs = report.packs_checked,
        entries = report.entries_checked,
        unreferenced = report.unreferenced_packs.len(),
        errors = report.errors.len(),
        "pack check finished"
    );
    Ok(report)
}
