use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use cairn_crypto::CryptoEngine;
use cairn_storage::StorageBackend;
use cairn_types::error::{CairnError, Result};
use cairn_types::{ContentId, PackId};

use super::object::{pack_object, unpack_object_expect, ObjectType};

/// Magic bytes at the start of every pack file.
pub const PACK_MAGIC: &[u8; 8] = b"CAIRNPAK";
/// Pack format version.
pub const PACK_VERSION: u8 = 1;
/// Size of the pack header (magic + version byte).
pub const PACK_HEADER_SIZE: usize = 9;

/// Maximum number of blobs in a single pack file.
pub const MAX_BLOBS_PER_PACK: usize = 10_000;

/// Maximum time a pack may stay open before it is flushed.
pub const PACK_MAX_AGE: Duration = Duration::from_secs(300);

/// Skip upfront `reserve()` for unreasonably large target sizes.
const MAX_PREALLOC_SIZE: usize = 64 * 1024 * 1024;

/// One entry in the pack's trailing header. Describes a single blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackHeaderEntry {
    pub content_id: ContentId,
    pub offset: u64,
    pub length: u32,
    pub original_length: u32,
}

/// Location of a content blob inside a sealed pack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackedEntry {
    pub content_id: ContentId,
    pub offset: u64,
    pub length: u32,
    pub original_length: u32,
    pub context_bound: bool,
}

/// A finished pack held in memory until it is uploaded and indexed.
#[derive(Debug)]
pub struct SealedPack {
    pub pack_id: PackId,
    pub bytes: Vec<u8>,
    pub entries: Vec<PackedEntry>,
}

impl SealedPack {
    /// The stored (encrypted) bytes of one blob.
    pub fn blob(&self, offset: u64, length: u32) -> Option<&[u8]> {
        let start = usize::try_from(offset).ok()?;
        self.bytes.get(start..start.checked_add(length as usize)?)
    }

    pub fn entry(&self, id: &ContentId) -> Option<&PackedEntry> {
        self.entries.iter().find(|e| e.content_id == *id)
    }

    /// Upload under the pack's content-derived key. Re-uploading identical
    /// bytes is harmless.
    pub fn upload(&self, storage: &dyn StorageBackend) -> Result<()> {
        storage.put_if_absent(&self.pack_id.storage_key(), &self.bytes)?;
        Ok(())
    }
}

struct BlobMeta {
    content_id: ContentId,
    offset: u64,
    stored_size: u32,
    original_length: u32,
    context_bound: bool,
}

/// Accumulates encrypted content blobs and seals them into pack files.
///
/// Blob data is appended directly into one contiguous buffer, so sealing
/// only appends the header trailer.
pub struct PackWriter {
    target_size: usize,
    max_blobs: usize,
    max_age: Duration,
    pack_bytes: Vec<u8>,
    blob_meta: Vec<BlobMeta>,
    current_size: usize,
    pending: HashMap<ContentId, usize>,
    first_blob_time: Option<Instant>,
}

impl PackWriter {
    pub fn new(target_size: usize) -> Self {
        Self::with_limits(target_size, MAX_BLOBS_PER_PACK, PACK_MAX_AGE)
    }

    pub fn with_limits(target_size: usize, max_blobs: usize, max_age: Duration) -> Self {
        Self {
            target_size,
            max_blobs,
            max_age,
            pack_bytes: Vec::new(),
            blob_meta: Vec::new(),
            current_size: 0,
            pending: HashMap::new(),
            first_blob_time: None,
        }
    }

    /// Add an encrypted blob. Returns the offset within the pack where the
    /// blob data starts (after its 4-byte length prefix).
    pub fn add_blob(
        &mut self,
        content_id: ContentId,
        encrypted_blob: &[u8],
        original_length: u32,
        context_bound: bool,
    ) -> Result<u64> {
        let blob_len = u32::try_from(encrypted_blob.len())
            .map_err(|_| CairnError::Other("blob too large for a pack".into()))?;

        if self.blob_meta.is_empty() {
            if self.pack_bytes.capacity() == 0 && self.target_size <= MAX_PREALLOC_SIZE {
                self.pack_bytes.reserve(self.target_size);
            }
            self.pack_bytes.extend_from_slice(PACK_MAGIC);
            self.pack_bytes.push(PACK_VERSION);
            self.first_blob_time = Some(Instant::now());
        }

        let offset = (PACK_HEADER_SIZE + self.current_size + 4) as u64;
        self.pack_bytes.extend_from_slice(&blob_len.to_le_bytes());
        self.pack_bytes.extend_from_slice(encrypted_blob);
        self.current_size += 4 + encrypted_blob.len();
        debug_assert_eq!(self.pack_bytes.len(), PACK_HEADER_SIZE + self.current_size);

        self.pending.insert(content_id, self.blob_meta.len());
        self.blob_meta.push(BlobMeta {
            content_id,
            offset,
            stored_size: blob_len,
            original_length,
            context_bound,
        });
        Ok(offset)
    }

    /// Check if a content is pending in this writer (not yet sealed).
    pub fn contains_pending(&self, content_id: &ContentId) -> bool {
        self.pending.contains_key(content_id)
    }

    pub fn pending_ids(&self) -> impl Iterator<Item = &ContentId> + '_ {
        self.pending.keys()
    }

    /// Stored bytes of a pending blob and whether it is context-bound.
    pub fn pending_blob(&self, content_id: &ContentId) -> Option<(&[u8], bool)> {
        let meta = &self.blob_meta[*self.pending.get(content_id)?];
        let start = meta.offset as usize;
        let end = start + meta.stored_size as usize;
        Some((&self.pack_bytes[start..end], meta.context_bound))
    }

    /// Whether the pack reached its size, blob-count or age limit.
    pub fn should_flush(&self) -> bool {
        if self.blob_meta.is_empty() {
            return false;
        }
        if self.current_size >= self.target_size || self.blob_meta.len() >= self.max_blobs {
            return true;
        }
        self.first_blob_time
            .is_some_and(|t| t.elapsed() >= self.max_age)
    }

    /// Whether there are any pending blobs.
    pub fn has_pending(&self) -> bool {
        !self.blob_meta.is_empty()
    }

    /// Append the encrypted header trailer, compute the pack ID and reset
    /// the writer. On error the writer is left untouched.
    pub fn seal(&mut self, crypto: &dyn CryptoEngine) -> Result<SealedPack> {
        if self.blob_meta.is_empty() {
            return Err(CairnError::Other("cannot seal empty pack writer".into()));
        }

        let header_entries: Vec<PackHeaderEntry> = self
            .blob_meta
            .iter()
            .map(|m| PackHeaderEntry {
                content_id: m.content_id,
                offset: m.offset,
                length: m.stored_size,
                original_length: m.original_length,
            })
            .collect();
        let header_bytes = rmp_serde::to_vec(&header_entries)?;
        let encrypted_header = pack_object(ObjectType::PackHeader, &header_bytes, crypto)?;

        let header_len = encrypted_header.len() as u32;
        self.pack_bytes.extend_from_slice(&encrypted_header);
        self.pack_bytes.extend_from_slice(&header_len.to_le_bytes());

        let bytes = std::mem::take(&mut self.pack_bytes);
        let pack_id = PackId::compute(&bytes);
        let entries = self
            .blob_meta
            .drain(..)
            .map(|m| PackedEntry {
                content_id: m.content_id,
                offset: m.offset,
                length: m.stored_size,
                original_length: m.original_length,
                context_bound: m.context_bound,
            })
            .collect();

        self.current_size = 0;
        self.pending.clear();
        self.first_blob_time = None;

        Ok(SealedPack {
            pack_id,
            bytes,
            entries,
        })
    }
}

/// Read a single blob from a pack file using a range read.
pub fn read_blob_from_pack(
    storage: &dyn StorageBackend,
    pack_id: &PackId,
    offset: u64,
    length: u32,
) -> Result<Vec<u8>> {
    let data = storage
        .get_range(&pack_id.storage_key(), offset, length as u64)?
        .ok_or_else(|| CairnError::NotFound(pack_id.storage_key()))?;
    if data.len() != length as usize {
        return Err(CairnError::InvalidFormat(format!(
            "short read from pack {pack_id}: wanted {length} bytes, got {}",
            data.len()
        )));
    }
    Ok(data)
}

/// Read and decrypt the trailing header from a pack file.
pub fn read_pack_header(
    storage: &dyn StorageBackend,
    pack_id: &PackId,
    crypto: &dyn CryptoEngine,
) -> Result<Vec<PackHeaderEntry>> {
    let pack_data = storage
        .get(&pack_id.storage_key())?
        .ok_or_else(|| CairnError::NotFound(pack_id.storage_key()))?;
    parse_pack_header(&pack_data, crypto)
}

/// Decode the header trailer of an in-memory pack.
pub fn parse_pack_header(
    pack_data: &[u8],
    crypto: &dyn CryptoEngine,
) -> Result<Vec<PackHeaderEntry>> {
    if pack_data.len() < PACK_HEADER_SIZE + 4 {
        return Err(CairnError::InvalidFormat("pack too small".into()));
    }
    if &pack_data[..8] != PACK_MAGIC {
        return Err(CairnError::InvalidFormat("invalid pack magic".into()));
    }
    if pack_data[8] != PACK_VERSION {
        return Err(CairnError::InvalidFormat(format!(
            "unsupported pack version {}",
            pack_data[8]
        )));
    }

    let len_offset = pack_data.len() - 4;
    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&pack_data[len_offset..]);
    let header_len = u32::from_le_bytes(len_bytes) as usize;
    if header_len > len_offset - PACK_HEADER_SIZE {
        return Err(CairnError::InvalidFormat("invalid pack header length".into()));
    }

    let encrypted_header = &pack_data[len_offset - header_len..len_offset];
    let header_bytes = unpack_object_expect(encrypted_header, ObjectType::PackHeader, crypto)?;
    Ok(rmp_serde::from_slice(&header_bytes)?)
}
