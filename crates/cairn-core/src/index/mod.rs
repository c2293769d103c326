pub mod blob;
pub mod compaction;
pub mod loader;

use std::cmp::Ordering;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use cairn_types::error::{CairnError, Result};
use cairn_types::{ContentId, PackId};

/// On-storage encoding of index blobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum IndexVersion {
    /// Location and deletion flag only.
    V1,
    /// Adds original length, per-entry timestamp and flags.
    V2,
}

impl IndexVersion {
    pub fn as_u8(self) -> u8 {
        match self {
            IndexVersion::V1 => 1,
            IndexVersion::V2 => 2,
        }
    }

    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            1 => Ok(IndexVersion::V1),
            2 => Ok(IndexVersion::V2),
            other => Err(CairnError::InvalidFormat(format!(
                "unsupported index version {other}"
            ))),
        }
    }
}

/// Where a content lives, or a tombstone saying it was deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentEntry {
    pub content_id: ContentId,
    pub pack_id: PackId,
    pub offset: u64,
    pub length: u32,
    pub original_length: u32,
    /// Microseconds since the Unix epoch.
    pub timestamp: i64,
    pub deleted: bool,
    /// Whether the stored envelope binds the content ID into its AAD.
    pub context_bound: bool,
}

impl ContentEntry {
    pub fn tombstone(&self, timestamp: i64) -> Self {
        Self {
            timestamp,
            deleted: true,
            ..*self
        }
    }

    /// Total order deciding which of two entries for the same content wins:
    /// newer timestamp, then tombstone over live, then lower pack location.
    fn precedence(&self, other: &Self) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then(self.deleted.cmp(&other.deleted))
            .then_with(|| {
                (other.pack_id, other.offset).cmp(&(self.pack_id, self.offset))
            })
    }
}

/// Resolved view of all visible index entries: one winning entry per ID.
#[derive(Debug, Default, Clone)]
pub struct ContentIndex {
    entries: HashMap<ContentId, ContentEntry>,
}

impl ContentIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge an entry. Returns true if it became the winning entry.
    pub fn insert(&mut self, entry: ContentEntry) -> bool {
        match self.entries.get(&entry.content_id) {
            Some(existing) if existing.precedence(&entry) != Ordering::Less => false,
            _ => {
                self.entries.insert(entry.content_id, entry);
                true
            }
        }
    }

    pub fn extend(&mut self, entries: impl IntoIterator<Item = ContentEntry>) {
        for entry in entries {
            self.insert(entry);
        }
    }

    /// Winning entry, including tombstones.
    pub fn get(&self, id: &ContentId) -> Option<&ContentEntry> {
        self.entries.get(id)
    }

    /// Winning entry if it is not a tombstone.
    pub fn get_live(&self, id: &ContentId) -> Option<&ContentEntry> {
        self.entries.get(id).filter(|e| !e.deleted)
    }

    pub fn contains_live(&self, id: &ContentId) -> bool {
        self.get_live(id).is_some()
    }

    /// Number of resolved IDs, tombstones included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn live_count(&self) -> usize {
        self.entries.values().filter(|e| !e.deleted).count()
    }

    /// All winning entries sorted by content ID.
    pub fn sorted_entries(&self) -> Vec<ContentEntry> {
        let mut out: Vec<ContentEntry> = self.entries.values().copied().collect();
        out.sort_by_key(|e| e.content_id);
        out
    }
}
