use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tempfile::TempDir;

use cairn_core::clock::{Clock, ManualClock};
use cairn_core::config::ClientOptions;
use cairn_core::logging;
use cairn_core::repo::version::{EngineCapabilities, LATEST_FORMAT_VERSION, MIN_FORMAT_VERSION};
use cairn_core::repo::{CreateOptions, OpenOptions, Repository};
use cairn_core::upgrade::{UpgradeOutcome, UpgradeRequest};
use cairn_core::CairnError;
use cairn_crypto::KdfParams;
use cairn_storage::local_backend::LocalBackend;
use cairn_storage::{MemoryBackend, StorageBackend};

const PASSPHRASE: &str = "integration-pass";

struct Harness {
    _tmp: Option<TempDir>,
    location: String,
    clock: Arc<ManualClock>,
    storage: Arc<dyn StorageBackend>,
}

impl Harness {
    fn memory() -> Self {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let source = Arc::clone(&clock);
        let storage: Arc<dyn StorageBackend> =
            Arc::new(MemoryBackend::with_time_source(move || source.now()));
        Self {
            _tmp: None,
            location: "memory://integration".into(),
            clock,
            storage,
        }
    }

    fn filesystem() -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("repo");
        std::fs::create_dir_all(&root).unwrap();
        let location = root.to_string_lossy().to_string();
        let storage: Arc<dyn StorageBackend> = Arc::new(LocalBackend::new(&location).unwrap());
        Self {
            _tmp: Some(tmp),
            location,
            clock: Arc::new(ManualClock::new(Utc::now())),
            storage,
        }
    }

    fn options(&self, max_format_version: u32) -> OpenOptions {
        OpenOptions {
            capabilities: EngineCapabilities::pinned(max_format_version).unwrap(),
            clock: self.clock.clone(),
            client: ClientOptions {
                status_poll_interval: Duration::from_secs(1),
                upgrade_lock_enabled: Some(true),
                ..ClientOptions::default()
            },
            log: Some(logging::discard()),
        }
    }

    fn create(&self, format_version: u32) -> Repository {
        let create = CreateOptions {
            format_version: Some(format_version),
            kdf: KdfParams::argon2id(1, 64, 1),
            ..CreateOptions::default()
        };
        Repository::create(
            Arc::clone(&self.storage),
            &self.location,
            Some(PASSPHRASE),
            &create,
            self.options(LATEST_FORMAT_VERSION),
        )
        .unwrap()
    }

    fn connect(&self, max_format_version: u32) -> Result<Repository, CairnError> {
        Repository::connect(
            Arc::clone(&self.storage),
            &self.location,
            Some(PASSPHRASE),
            self.options(max_format_version),
        )
    }

    fn step(&self) {
        self.clock.advance(Duration::from_secs(2));
    }
}

fn quick(owner: &str) -> UpgradeRequest {
    UpgradeRequest {
        io_drain_timeout: Duration::from_secs(3),
        status_poll_interval: Duration::from_secs(1),
        allow_unsafe_upgrade: true,
        ..UpgradeRequest::new(owner)
    }
}

#[test]
fn engines_open_exactly_the_formats_they_know() {
    for created in MIN_FORMAT_VERSION..=LATEST_FORMAT_VERSION {
        let h = Harness::memory();
        let _owner = h.create(created);
        for engine in MIN_FORMAT_VERSION..=LATEST_FORMAT_VERSION {
            match h.connect(engine) {
                Ok(repo) => {
                    assert!(created <= engine, "v{engine} engine opened v{created}");
                    let data = format!("v{created} repo, v{engine} engine");
                    let id = repo.put_content(data.as_bytes()).unwrap();
                    repo.flush().unwrap();
                    assert_eq!(repo.get_content(&id).unwrap(), data.as_bytes());
                }
                Err(CairnError::UnsupportedFormatVersion { found, max_supported }) => {
                    assert!(created > engine);
                    assert_eq!(found, created);
                    assert_eq!(max_supported, engine);
                }
                Err(e) => panic!("v{created} repo, v{engine} engine: {e}"),
            }
        }
    }
}

#[test]
fn content_written_by_every_version_survives_upgrades() {
    let h = Harness::memory();
    let repo = h.create(1);
    let mut written = Vec::new();
    let id = repo.put_content(b"from v1").unwrap();
    repo.flush().unwrap();
    written.push((id, b"from v1".to_vec()));

    let mut current = repo;
    for target in 2..=LATEST_FORMAT_VERSION {
        let req = UpgradeRequest {
            target_version: Some(target),
            ..quick("upgrader")
        };
        assert!(matches!(
            current.upgrade(&req).unwrap(),
            UpgradeOutcome::Committed { to, .. } if to == target
        ));
        h.step();
        current = h.connect(LATEST_FORMAT_VERSION).unwrap();
        assert_eq!(current.descriptor().format_version, target);
        let data = format!("from v{target}").into_bytes();
        let id = current.put_content(&data).unwrap();
        current.flush().unwrap();
        written.push((id, data));
    }

    let reader = h.connect(LATEST_FORMAT_VERSION).unwrap();
    for (id, data) in &written {
        assert_eq!(&reader.get_content(id).unwrap(), data);
    }
    assert_eq!(reader.live_content_count(), written.len());
}

#[test]
fn filesystem_repository_upgrades_under_live_clients() {
    let h = Harness::filesystem();
    let writer = h.create(2);
    let id = writer.put_content(b"on disk").unwrap();
    writer.flush().unwrap();

    let old_engine = h.connect(2).unwrap();
    let upgrader = h.connect(LATEST_FORMAT_VERSION).unwrap();
    let outcome = upgrader.upgrade(&quick("ops@example")).unwrap();
    assert!(matches!(outcome, UpgradeOutcome::Committed { from: 2, to: 3, .. }));
    h.step();

    for client in [&writer, &old_engine] {
        let err = client.put_content(b"stale writer").err().unwrap();
        assert!(err.requires_reconnect(), "unexpected error: {err}");
    }
    assert!(matches!(
        h.connect(2).err().unwrap(),
        CairnError::UnsupportedFormatVersion { found: 3, .. }
    ));

    let fresh = h.connect(LATEST_FORMAT_VERSION).unwrap();
    assert_eq!(fresh.get_content(&id).unwrap(), b"on disk");
    let bound = fresh.put_content(b"bound at v3").unwrap();
    fresh.flush().unwrap();
    assert_eq!(
        h.connect(LATEST_FORMAT_VERSION)
            .unwrap()
            .get_content(&bound)
            .unwrap(),
        b"bound at v3"
    );
}

#[test]
fn racing_upgraders_on_filesystem_commit_once() {
    let h = Harness::filesystem();
    let _owner = h.create(2);
    let clients: Vec<Repository> = (0..3)
        .map(|_| h.connect(LATEST_FORMAT_VERSION).unwrap())
        .collect();

    let results: Vec<_> = std::thread::scope(|s| {
        let handles: Vec<_> = clients
            .iter()
            .enumerate()
            .map(|(i, repo)| {
                let req = UpgradeRequest {
                    io_drain_timeout: Duration::from_secs(15 * 60),
                    status_poll_interval: Duration::from_secs(30),
                    max_permitted_clock_drift: Duration::from_secs(24 * 3600),
                    ..UpgradeRequest::new(format!("racer-{i}"))
                };
                s.spawn(move || repo.upgrade(&req))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let committed = results
        .iter()
        .filter(|r| matches!(r, Ok(UpgradeOutcome::Committed { .. })))
        .count();
    assert_eq!(committed, 1, "results: {results:?}");
    assert_eq!(
        h.connect(LATEST_FORMAT_VERSION)
            .unwrap()
            .descriptor()
            .format_version,
        3
    );
}
