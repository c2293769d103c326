use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use cairn_crypto::CryptoEngine;
use cairn_storage::StorageBackend;
use cairn_types::error::{CairnError, Result};
use cairn_types::{ContentId, PackId};

use crate::repo::object::{pack_object, unpack_object_expect, ObjectType};

use super::{ContentEntry, IndexVersion};

pub const INDEX_PREFIX: &str = "index";

const FLAG_DELETED: u8 = 0b0000_0001;
const FLAG_CONTEXT_BOUND: u8 = 0b0000_0010;

/// Metadata carried by every index blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexBlobHeader {
    /// Format version the writer was operating under.
    pub format_version: u32,
    pub created: DateTime<Utc>,
    /// Storage keys of index blobs whose contents this blob replaces.
    #[serde(default)]
    pub supersedes: Vec<String>,
}

#[derive(Serialize, Deserialize)]
struct EntryV1 {
    content_id: ContentId,
    pack_id: PackId,
    offset: u64,
    length: u32,
    deleted: bool,
}

#[derive(Serialize, Deserialize)]
struct EntryV2 {
    content_id: ContentId,
    pack_id: PackId,
    offset: u64,
    length: u32,
    original_length: u32,
    timestamp: i64,
    flags: u8,
}

#[derive(Serialize, Deserialize)]
struct Payload<E> {
    header: IndexBlobHeader,
    entries: Vec<E>,
}

/// V1 entries have no time of their own and all decode to one timestamp:
/// the latest entry time the writer held, or the blob's creation time for
/// blobs written without it.
#[derive(Serialize, Deserialize)]
struct PayloadV1 {
    header: IndexBlobHeader,
    entries: Vec<EntryV1>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    entries_timestamp: Option<i64>,
}

/// A decoded index blob.
#[derive(Debug, Clone)]
pub struct IndexBlob {
    pub key: String,
    pub version: IndexVersion,
    pub header: IndexBlobHeader,
    pub entries: Vec<ContentEntry>,
}

pub fn is_index_key(key: &str) -> bool {
    key.strip_prefix(INDEX_PREFIX)
        .is_some_and(|rest| rest.starts_with('/'))
}

/// Encode and encrypt an index blob. The first plaintext byte is the index
/// version so readers can dispatch before decoding.
pub fn encode_index_blob(
    version: IndexVersion,
    header: &IndexBlobHeader,
    entries: &[ContentEntry],
    crypto: &dyn CryptoEngine,
) -> Result<Vec<u8>> {
    let mut plaintext = vec![version.as_u8()];
    match version {
        IndexVersion::V1 => {
            let mut v1 = Vec::with_capacity(entries.len());
            for e in entries {
                if e.context_bound {
                    return Err(CairnError::InvalidFormat(format!(
                        "index v1 cannot record context-bound content {}",
                        e.content_id
                    )));
                }
                v1.push(EntryV1 {
                    content_id: e.content_id,
                    pack_id: e.pack_id,
                    offset: e.offset,
                    length: e.length,
                    deleted: e.deleted,
                });
            }
            plaintext.extend(rmp_serde::to_vec_named(&PayloadV1 {
                header: header.clone(),
                entries: v1,
                entries_timestamp: entries.iter().map(|e| e.timestamp).max(),
            })?);
        }
        IndexVersion::V2 => {
            let v2: Vec<EntryV2> = entries
                .iter()
                .map(|e| EntryV2 {
                    content_id: e.content_id,
                    pack_id: e.pack_id,
                    offset: e.offset,
                    length: e.length,
                    original_length: e.original_length,
                    timestamp: e.timestamp,
                    flags: (if e.deleted { FLAG_DELETED } else { 0 })
                        | (if e.context_bound { FLAG_CONTEXT_BOUND } else { 0 }),
                })
                .collect();
            plaintext.extend(rmp_serde::to_vec_named(&Payload {
                header: header.clone(),
                entries: v2,
            })?);
        }
    }
    pack_object(ObjectType::IndexBlob, &plaintext, crypto)
}

/// Decrypt and decode an index blob.
pub fn decode_index_blob(key: &str, data: &[u8], crypto: &dyn CryptoEngine) -> Result<IndexBlob> {
    let plaintext = unpack_object_expect(data, ObjectType::IndexBlob, crypto)?;
    let Some((&version_byte, body)) = plaintext.split_first() else {
        return Err(CairnError::InvalidFormat(format!("empty index blob {key}")));
    };
    let version = IndexVersion::from_u8(version_byte)?;
    let (header, entries) = match version {
        IndexVersion::V1 => {
            let payload: PayloadV1 = rmp_serde::from_slice(body)?;
            let ts = payload
                .entries_timestamp
                .unwrap_or_else(|| payload.header.created.timestamp_micros());
            let entries = payload
                .entries
                .into_iter()
                .map(|e| ContentEntry {
                    content_id: e.content_id,
                    pack_id: e.pack_id,
                    offset: e.offset,
                    length: e.length,
                    original_length: 0,
                    timestamp: ts,
                    deleted: e.deleted,
                    context_bound: false,
                })
                .collect();
            (payload.header, entries)
        }
        IndexVersion::V2 => {
            let payload: Payload<EntryV2> = rmp_serde::from_slice(body)?;
            let entries = payload
                .entries
                .into_iter()
                .map(|e| ContentEntry {
                    content_id: e.content_id,
                    pack_id: e.pack_id,
                    offset: e.offset,
                    length: e.length,
                    original_length: e.original_length,
                    timestamp: e.timestamp,
                    deleted: e.flags & FLAG_DELETED != 0,
                    context_bound: e.flags & FLAG_CONTEXT_BOUND != 0,
                })
                .collect();
            (payload.header, entries)
        }
    };
    Ok(IndexBlob {
        key: key.to_string(),
        version,
        header,
        entries,
    })
}

/// Write an index blob under a key derived from its bytes. Returns the key.
pub fn write_index_blob(
    storage: &dyn StorageBackend,
    crypto: &dyn CryptoEngine,
    version: IndexVersion,
    header: &IndexBlobHeader,
    entries: &[ContentEntry],
) -> Result<String> {
    let data = encode_index_blob(version, header, entries, crypto)?;
    let key = PackId::compute(&data).storage_key_in(INDEX_PREFIX);
    storage.put_if_absent(&key, &data)?;
    debug!(
        key = %key,
        entries = entries.len(),
        supersedes = header.supersedes.len(),
        format_version = header.format_version,
        "wrote index blob"
    );
    Ok(key)
}

/// Keys of all index blobs currently in storage, sorted.
pub fn list_index_blobs(storage: &dyn StorageBackend) -> Result<Vec<String>> {
    let mut keys: Vec<String> = storage
        .list(&format!("{INDEX_PREFIX}/"))?
        .into_iter()
        .filter(|k| is_index_key(k))
        .collect();
    keys.sort();
    Ok(keys)
}

/// Read one index blob. `None` if it vanished.
pub fn read_index_blob(
    storage: &dyn StorageBackend,
    crypto: &dyn CryptoEngine,
    key: &str,
) -> Result<Option<IndexBlob>> {
    match storage.get(key)? {
        Some(data) => decode_index_blob(key, &data, crypto).map(Some),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_crypto::aes_gcm::Aes256GcmEngine;
    use cairn_storage::MemoryBackend;

    fn entry(id: u8, deleted: bool, bound: bool) -> ContentEntry {
        ContentEntry {
            content_id: ContentId([id; 32]),
            pack_id: PackId([0xEE; 32]),
            offset: 13,
            length: 44,
            original_length: 30,
            timestamp: 1_700_000_000_000_000,
            deleted,
            context_bound: bound,
        }
    }

    fn header(version: u32) -> IndexBlobHeader {
        IndexBlobHeader {
            format_version: version,
            created: DateTime::from_timestamp(1_800_000_000, 0).unwrap(),
            supersedes: vec!["index/aa/old".into()],
        }
    }

    #[test]
    fn v2_preserves_flags_and_timestamps() {
        let crypto = Aes256GcmEngine::new(&[1; 32], &[2; 32]);
        let entries = vec![entry(1, false, true), entry(2, true, false)];
        let data = encode_index_blob(IndexVersion::V2, &header(3), &entries, &crypto).unwrap();
        let blob = decode_index_blob("index/xx/k", &data, &crypto).unwrap();
        assert_eq!(blob.version, IndexVersion::V2);
        assert_eq!(blob.header, header(3));
        assert_eq!(blob.entries, entries);
    }

    #[test]
    fn v1_keeps_latest_entry_time_and_drops_lengths() {
        let crypto = Aes256GcmEngine::new(&[1; 32], &[2; 32]);
        let mut later = entry(2, false, false);
        later.timestamp += 5;
        let data = encode_index_blob(
            IndexVersion::V1,
            &header(1),
            &[entry(1, true, false), later],
            &crypto,
        )
        .unwrap();
        let blob = decode_index_blob("k", &data, &crypto).unwrap();
        assert!(blob.entries.iter().all(|e| e.timestamp == later.timestamp));
        assert_eq!(blob.entries[0].original_length, 0);
        assert!(blob.entries[0].deleted);
    }

    #[test]
    fn v1_without_entry_time_falls_back_to_blob_time() {
        let crypto = Aes256GcmEngine::new(&[1; 32], &[2; 32]);
        let mut plaintext = vec![IndexVersion::V1.as_u8()];
        plaintext.extend(
            rmp_serde::to_vec_named(&Payload {
                header: header(1),
                entries: vec![EntryV1 {
                    content_id: ContentId([1; 32]),
                    pack_id: PackId([0xEE; 32]),
                    offset: 0,
                    length: 8,
                    deleted: false,
                }],
            })
            .unwrap(),
        );
        let data = pack_object(ObjectType::IndexBlob, &plaintext, &crypto).unwrap();
        let blob = decode_index_blob("k", &data, &crypto).unwrap();
        assert_eq!(
            blob.entries[0].timestamp,
            header(1).created.timestamp_micros()
        );
    }

    #[test]
    fn v1_refuses_context_bound_entries() {
        let crypto = Aes256GcmEngine::new(&[1; 32], &[2; 32]);
        assert!(
            encode_index_blob(IndexVersion::V1, &header(1), &[entry(1, false, true)], &crypto)
                .is_err()
        );
    }

    #[test]
    fn write_uses_content_addressed_key() {
        let crypto = Aes256GcmEngine::new(&[1; 32], &[2; 32]);
        let storage = MemoryBackend::new();
        let key = write_index_blob(
            &storage,
            &crypto,
            IndexVersion::V2,
            &header(2),
            &[entry(5, false, false)],
        )
        .unwrap();
        assert!(is_index_key(&key));
        assert_eq!(list_index_blobs(&storage).unwrap(), vec![key.clone()]);
        let blob = read_index_blob(&storage, &crypto, &key).unwrap().unwrap();
        assert_eq!(blob.entries.len(), 1);
        assert!(read_index_blob(&storage, &crypto, "index/00/gone")
            .unwrap()
            .is_none());
    }

    #[test]
    fn wrong_key_fails_to_decode() {
        let a = Aes256GcmEngine::new(&[1; 32], &[2; 32]);
        let b = Aes256GcmEngine::new(&[3; 32], &[2; 32]);
        let data = encode_index_blob(IndexVersion::V2, &header(2), &[], &a).unwrap();
        assert!(decode_index_blob("k", &data, &b).is_err());
    }
}
