use std::collections::HashSet;
use std::sync::Arc;

use rand::RngCore;

use cairn_crypto::EncryptionAlgorithm;
use cairn_types::error::CairnError;
use cairn_types::{ContentId, PackId};

use crate::repo::descriptor::MIN_MAX_PACK_SIZE;
use crate::repo::{CreateOptions, Repository};
use crate::testutil::{fast_kdf, Fixture, LOCATION, PASSPHRASE};

fn random_bytes(len: usize) -> Vec<u8> {
    let mut data = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut data);
    data
}

fn packs(fx: &Fixture) -> Vec<String> {
    fx.storage.list("packs/").unwrap()
}

#[test]
fn put_get_roundtrip() {
    let fx = Fixture::new();
    let repo = fx.create(None);
    let id = repo.put_content(b"hello content store").unwrap();
    assert_eq!(repo.get_content(&id).unwrap(), b"hello content store");
    repo.flush().unwrap();
    assert_eq!(repo.get_content(&id).unwrap(), b"hello content store");
    assert!(repo.contains_content(&id));
}

#[test]
fn pending_content_is_readable_before_flush() {
    let fx = Fixture::new();
    let repo = fx.create(None);
    let id = repo.put_content(b"not flushed yet").unwrap();
    assert!(packs(&fx).is_empty());
    assert!(repo.contains_content(&id));
    assert_eq!(repo.get_content(&id).unwrap(), b"not flushed yet");
}

#[test]
fn identical_content_is_stored_once() {
    let fx = Fixture::new();
    let repo = fx.create(None);
    let a = repo.put_content(b"same bytes").unwrap();
    let b = repo.put_content(b"same bytes").unwrap();
    assert_eq!(a, b);
    repo.flush().unwrap();
    let c = repo.put_content(b"same bytes").unwrap();
    assert_eq!(a, c);
    repo.flush().unwrap();
    assert_eq!(packs(&fx).len(), 1);
    assert_eq!(repo.live_content_count(), 1);
}

#[test]
fn content_ids_are_keyed_per_repository() {
    let first = Fixture::new();
    let second = Fixture::new();
    let a = first.create(None).put_content(b"same bytes").unwrap();
    let b = second.create(None).put_content(b"same bytes").unwrap();
    assert_ne!(a, b);
}

#[test]
fn flushed_content_is_visible_to_other_clients() {
    let fx = Fixture::new();
    let writer = fx.create(None);
    let reader = fx.connect().unwrap();
    let id = writer.put_content(b"shared").unwrap();
    writer.flush().unwrap();

    // The reader loaded its index before the write; a miss triggers a refresh.
    assert_eq!(reader.get_content(&id).unwrap(), b"shared");
    assert!(reader.contains_content(&id));
    // And dedups against it from now on.
    reader.put_content(b"shared").unwrap();
    reader.flush().unwrap();
    assert_eq!(packs(&fx).len(), 1);
}

#[test]
fn missing_content_is_not_found() {
    let fx = Fixture::new();
    let repo = fx.create(None);
    let missing = ContentId([7; 32]);
    assert!(matches!(
        repo.get_content(&missing),
        Err(CairnError::ContentNotFound(id)) if id == missing
    ));
    assert!(!repo.contains_content(&missing));
}

#[test]
fn concurrent_puts_of_same_data_store_one_copy() {
    let fx = Fixture::new();
    let repo = fx.create(None);
    let data = random_bytes(2048);
    let ids: Vec<ContentId> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..8)
            .map(|_| s.spawn(|| repo.put_content(&data).unwrap()))
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });
    assert_eq!(ids.iter().collect::<HashSet<_>>().len(), 1);
    repo.flush().unwrap();
    assert_eq!(packs(&fx).len(), 1);
    assert_eq!(repo.live_content_count(), 1);
    assert_eq!(repo.get_content(&ids[0]).unwrap(), data);
}

#[test]
fn concurrent_clients_resolve_to_one_entry() {
    let fx = Fixture::new();
    let _created = fx.create(None);
    let clients: Vec<Repository> = (0..3).map(|_| fx.connect().unwrap()).collect();
    let data = random_bytes(1024);
    let ids: Vec<ContentId> = std::thread::scope(|s| {
        let handles: Vec<_> = clients
            .iter()
            .map(|repo| {
                let data = &data;
                s.spawn(move || repo.put_content(data).unwrap())
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });
    assert_eq!(ids.iter().collect::<HashSet<_>>().len(), 1);

    // Every client staged its own copy; only the first to publish uploads it.
    for repo in &clients {
        repo.flush().unwrap();
    }
    assert_eq!(packs(&fx).len(), 1);

    let reader = fx.connect().unwrap();
    assert_eq!(reader.live_content_count(), 1);
    assert_eq!(reader.index_blobs().unwrap().live_blobs.len(), 1);
    assert_eq!(reader.get_content(&ids[0]).unwrap(), data);
}

#[test]
fn content_published_elsewhere_is_not_uploaded_again() {
    let fx = Fixture::new();
    let first = fx.create(None);
    let second = fx.connect().unwrap();
    let data = random_bytes(2048);

    let id = first.put_content(&data).unwrap();
    first.flush().unwrap();
    assert_eq!(second.put_content(&data).unwrap(), id);
    second.flush().unwrap();

    assert_eq!(packs(&fx).len(), 1);
    assert_eq!(second.get_content(&id).unwrap(), data);
    let reader = fx.connect().unwrap();
    assert_eq!(reader.live_content_count(), 1);
}

#[test]
fn shared_pack_is_rebuilt_without_content_indexed_elsewhere() {
    let fx = Fixture::new();
    let first = fx.create(None);
    let second = fx.connect().unwrap();
    let shared = random_bytes(4096);
    let own = random_bytes(512);

    let shared_id = first.put_content(&shared).unwrap();
    first.flush().unwrap();

    second.put_content(&shared).unwrap();
    let own_id = second.put_content(&own).unwrap();
    second.flush().unwrap();

    let mut sizes: Vec<usize> = packs(&fx)
        .iter()
        .map(|key| fx.storage.get(key).unwrap().unwrap().len())
        .collect();
    sizes.sort_unstable();
    assert_eq!(sizes.len(), 2);
    // The rebuilt pack carries only the small blob.
    assert!(sizes[0] < shared.len());
    assert!(sizes[1] > shared.len());
    let reader = fx.connect().unwrap();
    assert_eq!(reader.live_content_count(), 2);
    assert_eq!(reader.get_content(&shared_id).unwrap(), shared);
    assert_eq!(reader.get_content(&own_id).unwrap(), own);
    assert_eq!(second.get_content(&own_id).unwrap(), own);
}

#[test]
fn pack_check_finds_stray_and_damaged_packs() {
    let fx = Fixture::new();
    let repo = fx.create(None);
    repo.put_content(b"first").unwrap();
    repo.put_content(b"second").unwrap();
    repo.flush().unwrap();

    let clean = repo.check_packs().unwrap();
    assert_eq!(clean.packs_checked, 1);
    assert_eq!(clean.entries_checked, 2);
    assert!(clean.errors.is_empty());
    assert!(clean.unreferenced_packs.is_empty());

    let stray = PackId([0xab; 32]);
    fx.storage.put(&stray.storage_key(), b"not indexed").unwrap();
    let key = packs(&fx).into_iter().find(|k| !k.ends_with(&stray.to_hex())).unwrap();
    fx.storage.put(&key, b"truncated").unwrap();

    let report = repo.check_packs().unwrap();
    assert_eq!(report.unreferenced_packs, vec![stray]);
    assert_eq!(report.errors.len(), 1);
    assert!(report.errors[0].message.contains("unreadable header"));
}

#[test]
fn delete_hides_content_after_flush() {
    let fx = Fixture::new();
    let repo = fx.create(None);
    let keep = repo.put_content(b"keep me").unwrap();
    let gone = repo.put_content(b"delete me").unwrap();
    repo.delete_content(&gone).unwrap();
    assert!(!repo.contains_content(&gone));
    assert!(matches!(
        repo.get_content(&gone),
        Err(CairnError::ContentNotFound(_))
    ));
    repo.flush().unwrap();

    let other = fx.connect().unwrap();
    assert!(!other.contains_content(&gone));
    assert!(other.contains_content(&keep));
    assert_eq!(other.list_content().unwrap(), vec![keep]);
}

#[test]
fn delete_of_unknown_content_fails() {
    let fx = Fixture::new();
    let repo = fx.create(None);
    assert!(matches!(
        repo.delete_content(&ContentId([1; 32])),
        Err(CairnError::ContentNotFound(_))
    ));
}

#[test]
fn put_after_delete_restores_content() {
    let fx = Fixture::new();
    let repo = fx.create(None);
    let id = repo.put_content(b"comes back").unwrap();
    repo.flush().unwrap();
    repo.delete_content(&id).unwrap();
    repo.flush().unwrap();
    fx.clock.advance(std::time::Duration::from_secs(1));

    let again = repo.put_content(b"comes back").unwrap();
    assert_eq!(again, id);
    repo.flush().unwrap();
    assert_eq!(repo.get_content(&id).unwrap(), b"comes back");
    assert!(fx.connect().unwrap().contains_content(&id));
}

#[test]
fn unflushed_tombstones_survive_refresh() {
    let fx = Fixture::new();
    let repo = fx.create(None);
    let id = repo.put_content(b"soon deleted").unwrap();
    repo.flush().unwrap();
    repo.delete_content(&id).unwrap();
    repo.refresh().unwrap();
    assert!(!repo.contains_content(&id));
}

#[test]
fn list_is_sorted_and_includes_pending() {
    let fx = Fixture::new();
    let repo = fx.create(None);
    let mut ids: Vec<ContentId> = (0..5u8)
        .map(|i| repo.put_content(&[i; 100]).unwrap())
        .collect();
    repo.flush().unwrap();
    ids.push(repo.put_content(b"pending").unwrap());
    ids.sort();
    assert_eq!(repo.list_content().unwrap(), ids);
}

#[test]
fn full_pack_is_published_without_flush() {
    let fx = Fixture::new();
    let create = CreateOptions {
        max_pack_size: MIN_MAX_PACK_SIZE,
        kdf: fast_kdf(),
        encryption: EncryptionAlgorithm::Aes256Gcm,
        ..CreateOptions::default()
    };
    let repo = Repository::create(
        Arc::clone(&fx.storage),
        LOCATION,
        Some(PASSPHRASE),
        &create,
        fx.open_options(),
    )
    .unwrap();
    let first = random_bytes(3000);
    let second = random_bytes(3000);
    repo.put_content(&first).unwrap();
    assert!(packs(&fx).is_empty());
    let id = repo.put_content(&second).unwrap();
    assert_eq!(packs(&fx).len(), 1);

    let other = fx.connect().unwrap();
    assert_eq!(other.get_content(&id).unwrap(), second);
}

#[test]
fn v1_content_is_not_compressed() {
    let fx = Fixture::new();
    let v1 = fx.create(Some(1));
    v1.put_content(&[0u8; 16 * 1024]).unwrap();
    v1.flush().unwrap();
    let v1_pack = fx.storage.stat(&packs(&fx)[0]).unwrap().unwrap();
    assert!(v1_pack.length >= 16 * 1024);

    let fx = Fixture::new();
    let v2 = fx.create(Some(2));
    v2.put_content(&[0u8; 16 * 1024]).unwrap();
    v2.flush().unwrap();
    let v2_pack = fx.storage.stat(&packs(&fx)[0]).unwrap().unwrap();
    assert!(v2_pack.length < 4 * 1024);
}

#[test]
fn tampered_pack_fails_integrity() {
    let fx = Fixture::new();
    let repo = fx.create(None);
    let id = repo.put_content(&random_bytes(512)).unwrap();
    repo.flush().unwrap();

    let key = &packs(&fx)[0];
    let mut data = fx.storage.get(key).unwrap().unwrap();
    data[40] ^= 0xFF;
    fx.storage.put(key, &data).unwrap();

    let other = fx.connect().unwrap();
    assert!(other.get_content(&id).is_err());
}
