use chrono::Duration;

use crate::clock::Clock;
use crate::index::blob::list_index_blobs;
use crate::testutil::{quick_upgrade, Fixture};

#[test]
fn compaction_keeps_lookups_identical() {
    let fx = Fixture::new();
    let repo = fx.create(None);
    let mut ids = Vec::new();
    for i in 0..3u8 {
        ids.push(repo.put_content(&[i; 64]).unwrap());
        repo.flush().unwrap();
    }
    repo.delete_content(&ids[1]).unwrap();
    repo.flush().unwrap();
    let before = repo.list_content().unwrap();
    assert_eq!(list_index_blobs(fx.storage.as_ref()).unwrap().len(), 4);

    let stats = repo.compact_indexes(2).unwrap();
    assert_eq!(stats.blobs_merged, 4);
    assert_eq!(stats.entries_written, 3);
    assert!(stats.new_blob.is_some());
    assert_eq!(repo.list_content().unwrap(), before);

    let other = fx.connect().unwrap();
    assert_eq!(other.list_content().unwrap(), before);
    assert!(!other.contains_content(&ids[1]));
    assert_eq!(other.get_content(&ids[2]).unwrap(), [2u8; 64]);
}

#[test]
fn compaction_below_threshold_does_nothing() {
    let fx = Fixture::new();
    let repo = fx.create(None);
    repo.put_content(b"one").unwrap();
    repo.flush().unwrap();
    repo.put_content(b"two").unwrap();
    repo.flush().unwrap();

    let stats = repo.compact_indexes(5).unwrap();
    assert_eq!(stats.blobs_merged, 0);
    assert!(stats.new_blob.is_none());
    assert_eq!(list_index_blobs(fx.storage.as_ref()).unwrap().len(), 2);
}

#[test]
fn cleanup_waits_for_min_age() {
    let fx = Fixture::new();
    let repo = fx.create(None);
    let mut ids = Vec::new();
    for i in 0..3u8 {
        ids.push(repo.put_content(&[i; 32]).unwrap());
        repo.flush().unwrap();
    }
    repo.delete_content(&ids[0]).unwrap();
    repo.flush().unwrap();
    repo.compact_indexes(2).unwrap();

    assert_eq!(repo.cleanup_indexes(Duration::hours(1)).unwrap(), 0);
    fx.clock.advance(std::time::Duration::from_secs(2 * 3600));
    assert_eq!(repo.cleanup_indexes(Duration::hours(1)).unwrap(), 4);
    assert_eq!(list_index_blobs(fx.storage.as_ref()).unwrap().len(), 1);

    // Tombstones travel with the merged blob.
    let other = fx.connect().unwrap();
    assert!(!other.contains_content(&ids[0]));
    assert_eq!(other.live_content_count(), 2);
}

#[test]
fn second_compaction_carries_superseded_keys_forward() {
    let fx = Fixture::new();
    let repo = fx.create(None);
    for i in 0..2u8 {
        repo.put_content(&[i; 16]).unwrap();
        repo.flush().unwrap();
    }
    repo.compact_indexes(2).unwrap();
    repo.put_content(b"after first compaction").unwrap();
    repo.flush().unwrap();
    repo.compact_indexes(2).unwrap();

    // Cleaning up everything superseded leaves only the newest blob.
    fx.clock.advance(std::time::Duration::from_secs(60));
    repo.cleanup_indexes(Duration::zero()).unwrap();
    assert_eq!(list_index_blobs(fx.storage.as_ref()).unwrap().len(), 1);
    assert_eq!(fx.connect().unwrap().live_content_count(), 3);
}

#[test]
fn cleanup_after_upgrade_removes_old_format_blobs() {
    let fx = Fixture::new();
    let repo = fx.create(None);
    let id = repo.put_content(b"from v2").unwrap();
    repo.flush().unwrap();
    repo.put_content(b"also from v2").unwrap();
    repo.flush().unwrap();
    repo.upgrade(&quick_upgrade("upgrader")).unwrap();

    let upgraded = fx.connect().unwrap();
    fx.clock.advance(std::time::Duration::from_secs(60));
    assert_eq!(upgraded.cleanup_indexes(Duration::seconds(30)).unwrap(), 2);
    assert_eq!(list_index_blobs(fx.storage.as_ref()).unwrap().len(), 1);
    assert_eq!(upgraded.get_content(&id).unwrap(), b"from v2");
}

#[test]
fn index_listing_reports_live_and_superseded_blobs() {
    let fx = Fixture::new();
    let repo = fx.create(None);
    for i in 0..3u8 {
        repo.put_content(&[i; 8]).unwrap();
        repo.flush().unwrap();
    }
    assert_eq!(repo.index_blobs().unwrap().live_blobs.len(), 3);

    let stats = repo.compact_indexes(2).unwrap();
    let listing = repo.index_blobs().unwrap();
    assert_eq!(listing.live_blobs, vec![stats.new_blob.unwrap()]);
    assert_eq!(listing.superseded.len(), 3);
    assert!(listing.rejected.is_empty());
}

#[test]
fn v1_compaction_does_not_restamp_live_entries() {
    let fx = Fixture::new();
    let repo = fx.create(Some(1));
    let doomed = repo.put_content(b"deleted elsewhere").unwrap();
    repo.flush().unwrap();
    repo.put_content(b"kept").unwrap();
    repo.flush().unwrap();

    let deleter = fx.connect().unwrap();
    fx.clock.advance(std::time::Duration::from_secs(10));
    deleter.delete_content(&doomed).unwrap();
    let deleted_at = fx.clock.now();

    // The compacting client's clock runs ahead of the deleter's.
    fx.clock.advance(std::time::Duration::from_secs(60));
    repo.compact_indexes(2).unwrap();
    fx.clock.set(deleted_at);
    deleter.flush().unwrap();

    let reader = fx.connect().unwrap();
    assert!(!reader.contains_content(&doomed));
    assert_eq!(reader.live_content_count(), 1);
}
