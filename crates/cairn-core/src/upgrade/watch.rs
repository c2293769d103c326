use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use cairn_storage::StorageBackend;
use cairn_types::error::{CairnError, Result};

use crate::clock::{to_chrono, Clock};
use crate::config::ClientOptions;
use crate::repo::poison::check_not_superseded;

use super::record::{read_latest, LockRecord, UpgradeState};

#[derive(Debug, Clone)]
struct Observation {
    at: DateTime<Utc>,
    lock: Option<LockRecord>,
}

/// A non-owner client's view of upgrade activity on its format version.
///
/// Poison and lock state are re-read at most once per status poll interval
/// unless a caller asks for a fresh look. A poisoned version is never
/// cached, so once it is seen every later check fails too.
pub struct UpgradeWatch {
    storage: Arc<dyn StorageBackend>,
    clock: Arc<dyn Clock>,
    format_version: u32,
    poll_interval: Duration,
    stale_lock_multiplier: u32,
    lock_enabled: bool,
    last: Mutex<Option<Observation>>,
}

impl UpgradeWatch {
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        clock: Arc<dyn Clock>,
        format_version: u32,
        options: &ClientOptions,
    ) -> Self {
        Self {
            storage,
            clock,
            format_version,
            poll_interval: options.status_poll_interval,
            stale_lock_multiplier: options.stale_lock_multiplier,
            lock_enabled: options.lock_enabled(),
            last: Mutex::new(None),
        }
    }

    /// Forget the cached observation.
    pub fn invalidate(&self) {
        *self.last.lock().unwrap_or_else(|p| p.into_inner()) = None;
    }

    /// Fail with `RepositoryFormatSuperseded` once this client's format
    /// version has been poisoned.
    pub fn check_format_current(&self) -> Result<()> {
        self.observe(false).map(|_| ())
    }

    /// Like [`check_format_current`](Self::check_format_current), and also
    /// refuse writes while an upgrade is draining or committing.
    pub fn check_writes_allowed(&self, fresh: bool) -> Result<()> {
        let observation = self.observe(fresh)?;
        let Some(lock) = observation.lock else {
            return Ok(());
        };
        let blocking = match lock.state {
            UpgradeState::Committing => true,
            // A drain whose owner went away no longer holds writers back.
            UpgradeState::Draining => {
                !lock.is_stale(self.clock.now(), self.stale_lock_multiplier)
            }
            _ => false,
        };
        if blocking {
            return Err(CairnError::UpgradeInProgress {
                owner: lock.owner_id,
                state: lock.state.to_string(),
            });
        }
        Ok(())
    }

    fn observe(&self, fresh: bool) -> Result<Observation> {
        let now = self.clock.now();
        let mut last = self.last.lock().unwrap_or_else(|p| p.into_inner());
        if !fresh {
            if let Some(obs) = last.as_ref() {
                let age = now - obs.at;
                if age >= chrono::Duration::zero() && age < to_chrono(self.poll_interval) {
                    return Ok(obs.clone());
                }
            }
        }

        if let Err(e) = check_not_superseded(self.storage.as_ref(), self.format_version) {
            *last = None;
            return Err(e);
        }
        let lock = if self.lock_enabled {
            read_latest(self.storage.as_ref(), self.format_version)?
        } else {
            None
        };
        debug!(
            version = self.format_version,
            lock_state = lock.as_ref().map(|l| l.state.as_str()).unwrap_or("none"),
            "observed upgrade state"
        );
        let obs = Observation { at: now, lock };
        *last = Some(obs.clone());
        Ok(obs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::repo::poison::{write_poison, PoisonRecord};
    use crate::upgrade::record::try_write;
    use cairn_storage::MemoryBackend;

    fn options() -> ClientOptions {
        ClientOptions {
            status_poll_interval: Duration::from_secs(10),
            upgrade_lock_enabled: Some(true),
            ..ClientOptions::default()
        }
    }

    fn lock(state: UpgradeState, at: DateTime<Utc>) -> LockRecord {
        LockRecord {
            lock_id: "l1".into(),
            owner_id: "upgrader".into(),
            state,
            revision: 1,
            source_version: 2,
            target_version: 3,
            creation_time: at,
            updated_at: at,
            io_drain_timeout_ms: 60_000,
            status_poll_interval_ms: 1_000,
            allow_unsafe_upgrade: false,
            drain_deadline: None,
            target_max_pack_size: None,
            rewrite_blob: None,
            message: None,
        }
    }

    fn poison(storage: &MemoryBackend, version: u32) {
        write_poison(
            storage,
            &PoisonRecord {
                superseded_version: version,
                superseded_by: version + 1,
                lock_id: "l1".into(),
                owner_id: "upgrader".into(),
                written_at: Utc::now(),
            },
        )
        .unwrap();
    }

    #[test]
    fn cached_observation_expires_after_poll_interval() {
        let storage = Arc::new(MemoryBackend::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let watch = UpgradeWatch::new(storage.clone(), clock.clone(), 2, &options());

        watch.check_format_current().unwrap();
        poison(&storage, 2);
        watch.check_format_current().unwrap();

        clock.advance(Duration::from_secs(11));
        assert!(matches!(
            watch.check_format_current(),
            Err(CairnError::RepositoryFormatSuperseded { cached: 2, superseded_by: 3 })
        ));
        // Stays failed even within the interval.
        assert!(watch.check_format_current().is_err());
    }

    #[test]
    fn fresh_check_ignores_cache() {
        let storage = Arc::new(MemoryBackend::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let watch = UpgradeWatch::new(storage.clone(), clock.clone(), 2, &options());
        watch.check_writes_allowed(false).unwrap();
        poison(&storage, 2);
        assert!(watch.check_writes_allowed(true).is_err());
    }

    #[test]
    fn draining_lock_blocks_writes_until_stale() {
        let storage = Arc::new(MemoryBackend::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let watch = UpgradeWatch::new(storage.clone(), clock.clone(), 2, &options());
        try_write(storage.as_ref(), &lock(UpgradeState::Draining, clock.now())).unwrap();

        match watch.check_writes_allowed(true) {
            Err(CairnError::UpgradeInProgress { owner, state }) => {
                assert_eq!(owner, "upgrader");
                assert_eq!(state, "draining");
            }
            other => panic!("unexpected result: {other:?}"),
        }
        // Reads are unaffected.
        watch.check_format_current().unwrap();

        clock.advance(Duration::from_secs(4 * 60));
        watch.check_writes_allowed(true).unwrap();
    }

    #[test]
    fn held_lock_does_not_block_writes() {
        let storage = Arc::new(MemoryBackend::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let watch = UpgradeWatch::new(storage.clone(), clock.clone(), 2, &options());
        try_write(storage.as_ref(), &lock(UpgradeState::Held, clock.now())).unwrap();
        watch.check_writes_allowed(true).unwrap();
    }

    #[test]
    fn disabled_protocol_ignores_locks() {
        let storage = Arc::new(MemoryBackend::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let opts = ClientOptions {
            upgrade_lock_enabled: Some(false),
            ..options()
        };
        let watch = UpgradeWatch::new(storage.clone(), clock.clone(), 2, &opts);
        try_write(storage.as_ref(), &lock(UpgradeState::Committing, clock.now())).unwrap();
        watch.check_writes_allowed(true).unwrap();
    }
}
