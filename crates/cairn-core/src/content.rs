//! Content-addressable store: dedup, pack assembly and index upkeep for
//! one client operating at one format version.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use tracing::{debug, info};

use cairn_crypto::CryptoEngine;
use cairn_storage::StorageBackend;
use cairn_types::error::{CairnError, Result};
use cairn_types::{ContentId, PackId};

use crate::check::{check_packs, CheckReport};
use crate::clock::Clock;
use crate::compress::{self, Compression};
use crate::index::blob::{write_index_blob, IndexBlobHeader};
use crate::index::compaction::{cleanup_superseded, compact_indexes, CompactionStats};
use crate::index::loader::{load_visible_index, LoadedIndex};
use crate::index::{ContentEntry, ContentIndex};
use crate::repo::descriptor::FormatDescriptor;
use crate::repo::object::{
    content_context, pack_object, pack_object_with_context, unpack_object_expect,
    unpack_object_expect_with_context, ObjectType,
};
use crate::repo::pack::{read_blob_from_pack, PackWriter, PackedEntry, SealedPack};
use crate::repo::version::FormatFeatures;
use crate::upgrade::UpgradeWatch;

/// A sealed pack and the entry it provides, until both pack and index blob
/// are in storage.
type Unpublished = HashMap<ContentId, (Arc<SealedPack>, ContentEntry)>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

/// Thread-safe content store.
///
/// Lock order: `publish` → `writer` → `unpublished`, and `index` →
/// `tombstones`. The index is behind a `RwLock` and never held across
/// storage I/O.
///
/// Two clients that stage the same content concurrently can both publish
/// it if neither has seen the other's index blob when it publishes. The
/// loader resolves both entries to one; the losing pack copy is never read.
pub struct ContentStore {
    storage: Arc<dyn StorageBackend>,
    crypto: Arc<dyn CryptoEngine>,
    descriptor: FormatDescriptor,
    features: FormatFeatures,
    compression: Compression,
    clock: Arc<dyn Clock>,
    watch: Arc<UpgradeWatch>,
    index: RwLock<ContentIndex>,
    writer: Mutex<PackWriter>,
    unpublished: Mutex<Unpublished>,
    tombstones: Mutex<Vec<ContentEntry>>,
    /// Serializes pack uploads and index blob writes.
    publish: Mutex<()>,
}

impl ContentStore {
    /// Open the store and load every index blob visible at the descriptor's
    /// format version.
    pub fn open(
        storage: Arc<dyn StorageBackend>,
        crypto: Arc<dyn CryptoEngine>,
        descriptor: FormatDescriptor,
        features: FormatFeatures,
        clock: Arc<dyn Clock>,
        watch: Arc<UpgradeWatch>,
    ) -> Result<Self> {
        let loaded = load_visible_index(
            storage.as_ref(),
            crypto.as_ref(),
            features.format_version,
        )?;
        debug!(
            version = features.format_version,
            blobs = loaded.live_blobs.len(),
            entries = loaded.index.len(),
            "loaded content index"
        );
        let compression = if features.compression {
            descriptor.compression
        } else {
            Compression::None
        };
        let writer = PackWriter::new(descriptor.max_pack_size as usize);
        Ok(Self {
            storage,
            crypto,
            descriptor,
            features,
            compression,
            clock,
            watch,
            index: RwLock::new(loaded.index),
            writer: Mutex::new(writer),
            unpublished: Mutex::new(HashMap::new()),
            tombstones: Mutex::new(Vec::new()),
            publish: Mutex::new(()),
        })
    }

    pub fn features(&self) -> &FormatFeatures {
        &self.features
    }

    /// Compute the content ID of `data` under this repository's keyed hash.
    pub fn content_id(&self, data: &[u8]) -> Result<ContentId> {
        self.descriptor
            .hash_algorithm
            .compute(self.crypto.content_id_key(), data)
    }

    /// Store `data`, returning its content ID. Content already present in
    /// any visible index or still pending in this client is not stored again.
    pub fn put_content(&self, data: &[u8]) -> Result<ContentId> {
        self.watch.check_writes_allowed(false)?;
        let id = self.content_id(data)?;
        if self.read_index().contains_live(&id) {
            debug!(id = %id, "content already indexed");
            return Ok(id);
        }
        if lock(&self.unpublished).contains_key(&id) {
            return Ok(id);
        }

        let original_length = u32::try_from(data.len())
            .map_err(|_| CairnError::Other("content larger than 4 GiB".into()))?;
        let compressed = compress::compress(self.compression, data)?;
        let bound = self.features.content_bound_aad;
        let stored = if bound {
            pack_object_with_context(
                ObjectType::ContentData,
                content_context(&id),
                &compressed,
                self.crypto.as_ref(),
            )?
        } else {
            pack_object(ObjectType::ContentData, &compressed, self.crypto.as_ref())?
        };

        let sealed = {
            let mut writer = lock(&self.writer);
            // A publish may have moved the ID from `unpublished` into the
            // index since the checks above; it indexes before unstaging.
            if writer.contains_pending(&id)
                || lock(&self.unpublished).contains_key(&id)
                || self.read_index().contains_live(&id)
            {
                return Ok(id);
            }
            writer.add_blob(id, &stored, original_length, bound)?;
            if writer.should_flush() {
                Some(self.seal_locked(&mut writer)?)
            } else {
                None
            }
        };
        if sealed.is_some() {
            self.publish_unpublished()?;
        }
        Ok(id)
    }

    /// Read the plaintext stored under `id` and verify it hashes back to
    /// `id`.
    pub fn get_content(&self, id: &ContentId) -> Result<Vec<u8>> {
        self.watch.check_format_current()?;

        {
            let writer = lock(&self.writer);
            if let Some((stored, bound)) = writer.pending_blob(id) {
                return self.decode(id, stored, bound, None);
            }
        }
        let staged = lock(&self.unpublished).get(id).cloned();
        if let Some((pack, entry)) = staged {
            let stored = pack
                .blob(entry.offset, entry.length)
                .ok_or_else(|| CairnError::ContentNotFound(*id))?;
            return self.decode(id, stored, entry.context_bound, Some(entry.original_length));
        }

        let indexed = self.read_index().get_live(id).copied();
        let entry = match indexed {
            Some(entry) => entry,
            None => {
                // Another client may have written it since we loaded.
                self.refresh()?;
                let refreshed = self.read_index().get_live(id).copied();
                refreshed.ok_or(CairnError::ContentNotFound(*id))?
            }
        };
        let stored =
            read_blob_from_pack(self.storage.as_ref(), &entry.pack_id, entry.offset, entry.length)?;
        self.decode(id, &stored, entry.context_bound, Some(entry.original_length))
    }

    /// Whether `id` is stored and not deleted, as far as this client knows.
    pub fn contains(&self, id: &ContentId) -> bool {
        if self.read_index().contains_live(id) {
            return true;
        }
        let writer = lock(&self.writer);
        writer.contains_pending(id) || lock(&self.unpublished).contains_key(id)
    }

    /// Record a tombstone for `id`. Pack data stays where it is; the
    /// tombstone becomes visible to other clients on the next flush.
    pub fn delete_content(&self, id: &ContentId) -> Result<()> {
        self.watch.check_writes_allowed(false)?;
        if lock(&self.writer).contains_pending(id) || lock(&self.unpublished).contains_key(id) {
            self.flush_packs()?;
        }
        {
            let mut index = self.write_index();
            let live = index
                .get_live(id)
                .copied()
                .ok_or(CairnError::ContentNotFound(*id))?;
            let at = self.clock.now().timestamp_micros().max(live.timestamp + 1);
            let tombstone = live.tombstone(at);
            index.insert(tombstone);
            lock(&self.tombstones).push(tombstone);
        }
        debug!(id = %id, "content marked deleted");
        Ok(())
    }

    /// Live content IDs, sorted. Includes content not yet flushed.
    pub fn list(&self) -> Result<Vec<ContentId>> {
        self.watch.check_format_current()?;
        let mut ids: BTreeSet<ContentId> = self
            .read_index()
            .sorted_entries()
            .into_iter()
            .filter(|e| !e.deleted)
            .map(|e| e.content_id)
            .collect();
        ids.extend(lock(&self.unpublished).keys().copied());
        ids.extend(lock(&self.writer).pending_ids().copied());
        Ok(ids.into_iter().collect())
    }

    /// Seal the pending pack and make everything written so far, tombstones
    /// included, visible to other clients.
    pub fn flush(&self) -> Result<()> {
        self.flush_packs()?;

        let _publish = lock(&self.publish);
        let tombstones = std::mem::take(&mut *lock(&self.tombstones));
        if tombstones.is_empty() {
            return Ok(());
        }
        if let Err(e) = self
            .watch
            .check_writes_allowed(true)
            .and_then(|_| self.write_entries(&tombstones))
        {
            lock(&self.tombstones).extend(tombstones);
            return Err(e);
        }
        Ok(())
    }

    /// Reload the index from storage. Local tombstones not yet flushed are
    /// re-applied on top.
    pub fn refresh(&self) -> Result<()> {
        self.watch.check_format_current()?;
        self.reload_index()
    }

    /// Merge index blobs once there are at least `min_blobs` of them.
    pub fn compact(&self, min_blobs: usize) -> Result<CompactionStats> {
        self.flush()?;
        self.watch.check_writes_allowed(true)?;
        let stats = {
            let _publish = lock(&self.publish);
            compact_indexes(
                self.storage.as_ref(),
                self.crypto.as_ref(),
                &self.features,
                min_blobs,
                self.clock.now(),
            )?
        };
        self.refresh()?;
        Ok(stats)
    }

    /// Delete index blobs superseded for longer than `min_age`.
    pub fn cleanup(&self, min_age: chrono::Duration) -> Result<usize> {
        self.watch.check_writes_allowed(true)?;
        let _publish = lock(&self.publish);
        cleanup_superseded(
            self.storage.as_ref(),
            self.crypto.as_ref(),
            self.features.format_version,
            min_age,
            self.clock.now(),
        )
    }

    pub fn live_count(&self) -> usize {
        self.read_index().live_count()
    }

    /// Classify every index blob in storage as seen at this format version.
    pub fn index_blobs(&self) -> Result<LoadedIndex> {
        self.watch.check_format_current()?;
        load_visible_index(
            self.storage.as_ref(),
            self.crypto.as_ref(),
            self.features.format_version,
        )
    }

    /// Check every pack referenced by the index blobs in storage.
    pub fn check_packs(&self) -> Result<CheckReport> {
        let loaded = self.index_blobs()?;
        check_packs(self.storage.as_ref(), self.crypto.as_ref(), &loaded.index)
    }

    fn flush_packs(&self) -> Result<()> {
        {
            let mut writer = lock(&self.writer);
            if writer.has_pending() {
                self.seal_locked(&mut writer)?;
            }
        }
        self.publish_unpublished()
    }

    /// Seal the writer and stage its entries. Caller holds the writer lock.
    fn seal_locked(&self, writer: &mut PackWriter) -> Result<Arc<SealedPack>> {
        let sealed = Arc::new(writer.seal(self.crypto.as_ref())?);
        let now = self.clock.now().timestamp_micros();
        let mut unpublished = lock(&self.unpublished);
        for packed in &sealed.entries {
            let entry = entry_in(&sealed, packed, now);
            unpublished.insert(packed.content_id, (Arc::clone(&sealed), entry));
        }
        debug!(
            pack = %sealed.pack_id,
            blobs = sealed.entries.len(),
            bytes = sealed.bytes.len(),
            "sealed pack"
        );
        Ok(sealed)
    }

    /// Upload every staged pack and write one index blob covering them.
    /// Content that another client indexed after it was staged here is not
    /// uploaded again; packs holding some of it are rebuilt without it.
    /// Entries stay staged if anything fails, so the next flush retries.
    fn publish_unpublished(&self) -> Result<()> {
        let _publish = lock(&self.publish);
        let staged: Vec<(Arc<SealedPack>, ContentEntry)> =
            lock(&self.unpublished).values().cloned().collect();
        if staged.is_empty() {
            return Ok(());
        }

        // Lock and poison state must be current right before anything new
        // lands in the index.
        self.watch.check_writes_allowed(true)?;
        self.reload_index()?;

        let mut by_pack: HashMap<PackId, (Arc<SealedPack>, Vec<ContentEntry>)> = HashMap::new();
        let mut already_indexed = 0usize;
        {
            let index = self.read_index();
            for (pack, entry) in &staged {
                if index.contains_live(&entry.content_id) {
                    already_indexed += 1;
                    continue;
                }
                by_pack
                    .entry(pack.pack_id)
                    .or_insert_with(|| (Arc::clone(pack), Vec::new()))
                    .1
                    .push(*entry);
            }
        }

        let mut entries = Vec::new();
        let mut packs = 0usize;
        for (pack, kept) in by_pack.into_values() {
            let (pack, kept) = if kept.len() == pack.entries.len() {
                (pack, kept)
            } else {
                self.repack(&pack, &kept)?
            };
            pack.upload(self.storage.as_ref())?;
            packs += 1;
            entries.extend(kept);
        }
        if !entries.is_empty() {
            self.write_entries(&entries)?;
        }

        let mut unpublished = lock(&self.unpublished);
        for (_, entry) in &staged {
            unpublished.remove(&entry.content_id);
        }
        info!(
            packs,
            entries = entries.len(),
            already_indexed,
            "published content"
        );
        Ok(())
    }

    /// A new pack holding only the `kept` blobs of `pack`.
    fn repack(
        &self,
        pack: &SealedPack,
        kept: &[ContentEntry],
    ) -> Result<(Arc<SealedPack>, Vec<ContentEntry>)> {
        let mut writer = PackWriter::new(self.descriptor.max_pack_size as usize);
        for entry in kept {
            let stored = pack
                .blob(entry.offset, entry.length)
                .ok_or(CairnError::ContentNotFound(entry.content_id))?;
            writer.add_blob(
                entry.content_id,
                stored,
                entry.original_length,
                entry.context_bound,
            )?;
        }
        let sealed = Arc::new(writer.seal(self.crypto.as_ref())?);
        let timestamp = kept.iter().map(|e| e.timestamp).max().unwrap_or_default();
        let entries = sealed
            .entries
            .iter()
            .map(|packed| entry_in(&sealed, packed, timestamp))
            .collect();
        debug!(
            from = %pack.pack_id,
            to = %sealed.pack_id,
            kept = kept.len(),
            dropped = pack.entries.len() - kept.len(),
            "rebuilt pack without content indexed elsewhere"
        );
        Ok((sealed, entries))
    }

    /// Replace the in-memory index with what storage holds now. Local
    /// tombstones not yet flushed are re-applied on top.
    fn reload_index(&self) -> Result<()> {
        let loaded = load_visible_index(
            self.storage.as_ref(),
            self.crypto.as_ref(),
            self.features.format_version,
        )?;
        let mut index = self.write_index();
        *index = loaded.index;
        index.extend(lock(&self.tombstones).iter().copied());
        Ok(())
    }

    fn write_entries(&self, entries: &[ContentEntry]) -> Result<()> {
        let header = IndexBlobHeader {
            format_version: self.features.format_version,
            created: self.clock.now(),
            supersedes: Vec::new(),
        };
        write_index_blob(
            self.storage.as_ref(),
            self.crypto.as_ref(),
            self.features.index_version,
            &header,
            entries,
        )?;
        self.write_index().extend(entries.iter().copied());
        Ok(())
    }

    fn decode(
        &self,
        id: &ContentId,
        stored: &[u8],
        bound: bool,
        original_length: Option<u32>,
    ) -> Result<Vec<u8>> {
        let compressed = if bound {
            unpack_object_expect_with_context(
                stored,
                ObjectType::ContentData,
                content_context(id),
                self.crypto.as_ref(),
            )?
        } else {
            unpack_object_expect(stored, ObjectType::ContentData, self.crypto.as_ref())?
        };
        let plaintext =
            compress::decompress_with_hint(&compressed, original_length.map(|l| l as usize))?;
        if self.content_id(&plaintext)? != *id {
            return Err(CairnError::ContentIntegrity(*id));
        }
        Ok(plaintext)
    }

    fn read_index(&self) -> std::sync::RwLockReadGuard<'_, ContentIndex> {
        self.index.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write_index(&self) -> std::sync::RwLockWriteGuard<'_, ContentIndex> {
        self.index.write().unwrap_or_else(|p| p.into_inner())
    }
}

fn entry_in(pack: &SealedPack, packed: &PackedEntry, timestamp: i64) -> ContentEntry {
    ContentEntry {
        content_id: packed.content_id,
        pack_id: pack.pack_id,
        offset: packed.offset,
        length: packed.length,
        original_length: packed.original_length,
        timestamp,
        deleted: false,
        context_bound: packed.context_bound,
    }
}
