use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use cairn_crypto::CryptoEngine;
use cairn_storage::StorageBackend;
use cairn_types::error::{CairnError, Result};

use crate::clock::{ensure_drift_within, to_chrono, Clock};
use crate::config::{
    DEFAULT_IO_DRAIN_TIMEOUT, DEFAULT_MAX_PERMITTED_CLOCK_DRIFT, DEFAULT_STALE_LOCK_MULTIPLIER,
    DEFAULT_STATUS_POLL_INTERVAL, MIN_STALE_LOCK_MULTIPLIER,
};
use crate::index::compaction::rewrite_for_format;
use crate::repo::descriptor::{FormatDescriptor, FormatDescriptorStore};
use crate::repo::poison::{check_not_superseded, list_poisoned_versions, write_poison, PoisonRecord};
use crate::repo::version::{features_for_version, negotiate, EngineCapabilities};

use super::record::{
    list_lock_sources, read_latest, remove_chain, try_write, LockRecord, UpgradeState,
};

/// Drain windows shorter than this need `allow_unsafe_upgrade`.
pub const MIN_SAFE_IO_DRAIN_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// Parameters of one `repository upgrade` run.
#[derive(Debug, Clone)]
pub struct UpgradeRequest {
    pub owner_id: String,
    pub io_drain_timeout: Duration,
    pub status_poll_interval: Duration,
    pub max_permitted_clock_drift: Duration,
    pub stale_lock_multiplier: u32,
    pub allow_unsafe_upgrade: bool,
    /// Defaults to the newest version the engine supports.
    pub target_version: Option<u32>,
    pub target_max_pack_size: Option<u32>,
    /// With the protocol disengaged the upgrade runs without a lock or drain.
    pub lock_enabled: bool,
}

impl UpgradeRequest {
    pub fn new(owner_id: impl Into<String>) -> Self {
        Self {
            owner_id: owner_id.into(),
            io_drain_timeout: DEFAULT_IO_DRAIN_TIMEOUT,
            status_poll_interval: DEFAULT_STATUS_POLL_INTERVAL,
            max_permitted_clock_drift: DEFAULT_MAX_PERMITTED_CLOCK_DRIFT,
            stale_lock_multiplier: DEFAULT_STALE_LOCK_MULTIPLIER,
            allow_unsafe_upgrade: false,
            target_version: None,
            target_max_pack_size: None,
            lock_enabled: true,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.owner_id.trim().is_empty() {
            return Err(CairnError::Config("upgrade owner id must not be empty".into()));
        }
        if self.status_poll_interval.is_zero() {
            return Err(CairnError::Config(
                "status poll interval must be greater than zero".into(),
            ));
        }
        if self.stale_lock_multiplier < MIN_STALE_LOCK_MULTIPLIER {
            return Err(CairnError::Config(format!(
                "stale lock multiplier must be at least {MIN_STALE_LOCK_MULTIPLIER}"
            )));
        }
        if self.io_drain_timeout < MIN_SAFE_IO_DRAIN_TIMEOUT && !self.allow_unsafe_upgrade {
            return Err(CairnError::Config(format!(
                "io drain timeout {:?} is below the safe minimum of {:?}; \
                 pass --allow-unsafe-upgrade to use it anyway",
                self.io_drain_timeout, MIN_SAFE_IO_DRAIN_TIMEOUT
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpgradeOutcome {
    Committed { from: u32, to: u32, lock_id: String },
    AlreadyLatest { version: u32 },
}

/// Snapshot of upgrade-related repository state for `repo status`.
#[derive(Debug, Clone)]
pub struct UpgradeStatus {
    pub format_version: u32,
    pub format_versions: Vec<u32>,
    pub poisoned: Vec<u32>,
    pub lock: Option<LockRecord>,
    pub lock_stale: bool,
}

/// Drives a format transition through the lock state machine. Every
/// coordination write is a conditional put; nothing is overwritten.
pub struct UpgradeCoordinator {
    storage: Arc<dyn StorageBackend>,
    crypto: Arc<dyn CryptoEngine>,
    formats: Arc<FormatDescriptorStore>,
    clock: Arc<dyn Clock>,
    caps: EngineCapabilities,
}

impl UpgradeCoordinator {
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        crypto: Arc<dyn CryptoEngine>,
        formats: Arc<FormatDescriptorStore>,
        clock: Arc<dyn Clock>,
        caps: EngineCapabilities,
    ) -> Self {
        Self {
            storage,
            crypto,
            formats,
            clock,
            caps,
        }
    }

    /// Upgrade the repository to the requested format version.
    pub fn run(&self, req: &UpgradeRequest) -> Result<UpgradeOutcome> {
        req.validate()?;
        let current = self.formats.read_current_format()?;
        let source = current.format_version;
        self.caps.check_supported(source)?;
        self.clear_finished_locks(source);

        if req.lock_enabled {
            // A commit that stopped half way is resumed at its own target.
            if let Some(latest) = read_latest(self.storage.as_ref(), source)? {
                if latest.state == UpgradeState::Committing {
                    return self.resume(req, &current, latest);
                }
            }
        }

        let target = req.target_version.unwrap_or(self.caps.max_format_version);
        if target < source {
            return Err(CairnError::FormatDowngrade {
                proposed: target,
                current: source,
            });
        }
        if target == source {
            info!(version = source, "repository is already at the requested format");
            return Ok(UpgradeOutcome::AlreadyLatest { version: source });
        }
        self.caps.check_supported(target)?;

        if !req.lock_enabled {
            return self.run_unlocked(req, &current, target);
        }

        self.check_clock(req)?;
        let held = self.acquire(req, &current, target)?;
        let draining = match self.drain(held.clone(), req) {
            Ok(record) => record,
            Err(e) => {
                self.abort(&held, &e);
                return Err(e);
            }
        };
        self.commit(draining, &current)
    }

    /// Abort a lock that never reached `Committing`. Without `force` only a
    /// stale lock may be rolled back.
    pub fn rollback(
        &self,
        owner_id: &str,
        force: bool,
        stale_lock_multiplier: u32,
    ) -> Result<Option<LockRecord>> {
        let current = self.formats.read_current_format()?;
        let Some(latest) = read_latest(self.storage.as_ref(), current.format_version)? else {
            return Ok(None);
        };
        if latest.is_terminal() {
            return Ok(None);
        }
        if latest.state == UpgradeState::Committing {
            return Err(CairnError::UpgradeIncomplete(format!(
                "upgrade {} by '{}' reached committing and cannot be rolled back; \
                 finish it with --allow-unsafe-upgrade",
                latest.lock_id, latest.owner_id
            )));
        }
        let now = self.clock.now();
        if !force && !latest.is_stale(now, stale_lock_multiplier) {
            return Err(CairnError::LockContention {
                holder: latest.owner_id,
            });
        }
        let mut aborted = latest.advance(UpgradeState::Aborted, now)?;
        aborted.message = Some(format!("rolled back by '{owner_id}'"));
        if !try_write(self.storage.as_ref(), &aborted)? {
            return Err(self.contention(current.format_version));
        }
        warn!(
            lock_id = %aborted.lock_id,
            holder = %latest.owner_id,
            by = %owner_id,
            "rolled back upgrade lock"
        );
        Ok(Some(aborted))
    }

    pub fn status(&self, stale_lock_multiplier: u32) -> Result<UpgradeStatus> {
        let format_versions = self.formats.list_versions()?;
        let format_version = format_versions.last().copied().ok_or_else(|| {
            CairnError::NotFound("repository has no format descriptor".into())
        })?;
        let lock = read_latest(self.storage.as_ref(), format_version)?;
        let lock_stale = lock
            .as_ref()
            .is_some_and(|l| l.is_stale(self.clock.now(), stale_lock_multiplier));
        Ok(UpgradeStatus {
            format_version,
            format_versions,
            poisoned: list_poisoned_versions(self.storage.as_ref())?,
            lock,
            lock_stale,
        })
    }

    fn check_clock(&self, req: &UpgradeRequest) -> Result<()> {
        match ensure_drift_within(
            self.storage.as_ref(),
            self.clock.as_ref(),
            &req.owner_id,
            req.max_permitted_clock_drift,
        ) {
            Ok(_) => Ok(()),
            Err(e @ CairnError::ClockDrift { .. }) if req.allow_unsafe_upgrade => {
                warn!(error = %e, "ignoring clock drift because unsafe upgrade is allowed");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn acquire(
        &self,
        req: &UpgradeRequest,
        current: &FormatDescriptor,
        target: u32,
    ) -> Result<LockRecord> {
        let source = current.format_version;
        let now = self.clock.now();
        let revision = match read_latest(self.storage.as_ref(), source)? {
            None => 1,
            Some(latest) if latest.is_terminal() => latest.revision + 1,
            Some(latest) if latest.is_stale(now, req.stale_lock_multiplier) => {
                warn!(
                    holder = %latest.owner_id,
                    state = %latest.state,
                    revision = latest.revision,
                    "taking over stale upgrade lock"
                );
                latest.revision + 1
            }
            Some(latest) if req.allow_unsafe_upgrade => {
                warn!(
                    holder = %latest.owner_id,
                    state = %latest.state,
                    revision = latest.revision,
                    "forcing takeover of active upgrade lock"
                );
                latest.revision + 1
            }
            Some(latest) => {
                return Err(CairnError::LockContention {
                    holder: latest.owner_id,
                })
            }
        };

        let record = LockRecord {
            lock_id: new_lock_id(),
            owner_id: req.owner_id.clone(),
            state: UpgradeState::Held,
            revision,
            source_version: source,
            target_version: target,
            creation_time: now,
            updated_at: now,
            io_drain_timeout_ms: duration_ms(req.io_drain_timeout),
            status_poll_interval_ms: duration_ms(req.status_poll_interval),
            allow_unsafe_upgrade: req.allow_unsafe_upgrade,
            drain_deadline: None,
            target_max_pack_size: req.target_max_pack_size,
            rewrite_blob: None,
            message: None,
        };
        if !try_write(self.storage.as_ref(), &record)? {
            return Err(self.contention(source));
        }
        self.verify_ownership(&record)?;
        info!(
            owner = %record.owner_id,
            lock_id = %record.lock_id,
            revision = record.revision,
            from = source,
            to = target,
            "acquired upgrade lock"
        );

        // Someone may have finished an upgrade between our format read and
        // the lock write.
        let latest = self.formats.read_current_format()?;
        if latest.format_version != source {
            if let Err(e) = remove_chain(self.storage.as_ref(), source) {
                warn!(error = %e, "failed to remove lock chain of superseded format");
            }
            return Err(CairnError::RepositoryFormatSuperseded {
                cached: source,
                superseded_by: latest.format_version,
            });
        }
        if !req.allow_unsafe_upgrade {
            if let Err(e) = check_not_superseded(self.storage.as_ref(), source) {
                let err = CairnError::UpgradeIncomplete(format!(
                    "format v{source} is poisoned but no newer format exists ({e}); \
                     rerun with --allow-unsafe-upgrade to finish the upgrade"
                ));
                self.abort(&record, &err);
                return Err(err);
            }
        }
        Ok(record)
    }

    fn drain(&self, held: LockRecord, req: &UpgradeRequest) -> Result<LockRecord> {
        let now = self.clock.now();
        let deadline = now + to_chrono(req.io_drain_timeout);
        let mut draining = held.advance(UpgradeState::Draining, now)?;
        draining.drain_deadline = Some(deadline);
        self.write_owned(&draining)?;
        info!(
            owner = %draining.owner_id,
            revision = draining.revision,
            deadline = %deadline,
            "waiting for in-flight writes to drain"
        );

        loop {
            let now = self.clock.now();
            if now >= deadline {
                break;
            }
            let remaining = (deadline - now).to_std().unwrap_or_default();
            self.clock.sleep(remaining.min(req.status_poll_interval));
            self.verify_ownership(&draining)?;
        }
        Ok(draining)
    }

    /// Take over a lock left in `Committing` and finish its transition.
    fn resume(
        &self,
        req: &UpgradeRequest,
        current: &FormatDescriptor,
        latest: LockRecord,
    ) -> Result<UpgradeOutcome> {
        let now = self.clock.now();
        if !req.allow_unsafe_upgrade {
            if latest.is_stale(now, req.stale_lock_multiplier) {
                return Err(CairnError::UpgradeIncomplete(format!(
                    "upgrade {} by '{}' stopped while committing v{} -> v{}; \
                     rerun with --allow-unsafe-upgrade to finish it",
                    latest.lock_id, latest.owner_id, latest.source_version, latest.target_version
                )));
            }
            return Err(CairnError::LockContention {
                holder: latest.owner_id,
            });
        }
        self.check_clock(req)?;
        let mut record = latest.advance(UpgradeState::Committing, now)?;
        record.owner_id = req.owner_id.clone();
        record.allow_unsafe_upgrade = true;
        if !try_write(self.storage.as_ref(), &record)? {
            return Err(self.contention(latest.source_version));
        }
        warn!(
            lock_id = %record.lock_id,
            previous_owner = %latest.owner_id,
            "resuming interrupted upgrade commit"
        );
        self.commit(record, current)
    }

    fn commit(&self, record: LockRecord, current: &FormatDescriptor) -> Result<UpgradeOutcome> {
        let source = record.source_version;
        let target = record.target_version;
        let prepared = self.prepare_commit(record, current);
        let (committing, next) = match prepared {
            Ok(v) => v,
            Err((record, e)) => {
                self.abort(&record, &e);
                return Err(e);
            }
        };

        // From here on the transition is published piece by piece and can
        // only be finished, never undone.
        let now = self.clock.now();
        let incomplete = |what: &str, e: CairnError| {
            CairnError::UpgradeIncomplete(format!(
                "{what} during upgrade v{source} -> v{target}: {e}; \
                 rerun with --allow-unsafe-upgrade to finish it"
            ))
        };
        write_poison(
            self.storage.as_ref(),
            &PoisonRecord {
                superseded_version: source,
                superseded_by: target,
                lock_id: committing.lock_id.clone(),
                owner_id: committing.owner_id.clone(),
                written_at: now,
            },
        )
        .map_err(|e| incomplete("poison write failed", e))?;

        match self.formats.propose_new_format(&next) {
            Ok(()) => {}
            Err(CairnError::FormatConflict(v)) if v == target => {
                let present = self
                    .formats
                    .read_format(target)
                    .map_err(|e| incomplete("reading the published format failed", e))?;
                if present.is_none() {
                    return Err(incomplete(
                        "format publish conflicted",
                        CairnError::FormatConflict(target),
                    ));
                }
                debug!(version = target, "target format already published");
            }
            Err(e) => return Err(incomplete("format publish failed", e)),
        }

        match committing.advance(UpgradeState::Committed, self.clock.now()) {
            Ok(committed) => match try_write(self.storage.as_ref(), &committed) {
                Ok(true) => {}
                Ok(false) => warn!("another client advanced the lock after commit"),
                Err(e) => warn!(error = %e, "failed to record committed upgrade"),
            },
            Err(e) => warn!(error = %e, "failed to record committed upgrade"),
        }
        match remove_chain(self.storage.as_ref(), source) {
            Ok(n) => debug!(removed = n, "removed upgrade lock chain"),
            Err(e) => warn!(error = %e, "failed to remove upgrade lock chain"),
        }
        info!(
            from = source,
            to = target,
            lock_id = %committing.lock_id,
            "repository format upgrade committed"
        );
        Ok(UpgradeOutcome::Committed {
            from: source,
            to: target,
            lock_id: committing.lock_id,
        })
    }

    /// Everything before the poison write: the `Committing` revision and the
    /// index rewrite. Failures here leave the repository on `source`.
    fn prepare_commit(
        &self,
        record: LockRecord,
        current: &FormatDescriptor,
    ) -> std::result::Result<(LockRecord, FormatDescriptor), (LockRecord, CairnError)> {
        let now = self.clock.now();
        let setup = (|| {
            let from = negotiate(current, &self.caps)?;
            self.caps.check_supported(record.target_version)?;
            let to = features_for_version(record.target_version)?;
            let next = current.upgraded_to(
                record.target_version,
                &record.lock_id,
                record.target_max_pack_size,
                now,
            )?;
            Ok::<_, CairnError>((from, to, next))
        })();
        let (from, to, next) = match setup {
            Ok(v) => v,
            Err(e) => return Err((record, e)),
        };

        let committing = if record.state == UpgradeState::Committing {
            record
        } else {
            let committing = match record.advance(UpgradeState::Committing, now) {
                Ok(c) => c,
                Err(e) => return Err((record, e)),
            };
            if let Err(e) = self.write_owned(&committing) {
                return Err((record, e));
            }
            committing
        };

        let existing = match &committing.rewrite_blob {
            Some(key) => match self.storage.exists(key) {
                Ok(true) => Some(key.clone()),
                Ok(false) => None,
                Err(e) => return Err((committing, e)),
            },
            None => None,
        };
        if existing.is_some() {
            return Ok((committing, next));
        }

        let rewrite = match rewrite_for_format(
            self.storage.as_ref(),
            self.crypto.as_ref(),
            &from,
            &to,
            now,
        ) {
            Ok(key) => key,
            Err(e) => return Err((committing, e)),
        };
        let heartbeat = match committing.advance(UpgradeState::Committing, self.clock.now()) {
            Ok(mut h) => {
                h.rewrite_blob = rewrite.clone();
                h
            }
            Err(e) => return Err((committing, e)),
        };
        if let Err(e) = self.write_owned(&heartbeat) {
            if let Some(key) = &rewrite {
                if let Err(del) = self.storage.delete(key) {
                    warn!(key = %key, error = %del, "failed to delete orphaned index rewrite");
                }
            }
            return Err((committing, e));
        }
        Ok((heartbeat, next))
    }

    fn run_unlocked(
        &self,
        req: &UpgradeRequest,
        current: &FormatDescriptor,
        target: u32,
    ) -> Result<UpgradeOutcome> {
        warn!(
            from = current.format_version,
            to = target,
            "upgrade lock protocol is disabled; upgrading without coordination"
        );
        let now = self.clock.now();
        let lock_id = new_lock_id();
        let from = negotiate(current, &self.caps)?;
        let to = features_for_version(target)?;
        let next = current.upgraded_to(target, &lock_id, req.target_max_pack_size, now)?;
        rewrite_for_format(self.storage.as_ref(), self.crypto.as_ref(), &from, &to, now)?;

        let source = current.format_version;
        write_poison(
            self.storage.as_ref(),
            &PoisonRecord {
                superseded_version: source,
                superseded_by: target,
                lock_id: lock_id.clone(),
                owner_id: req.owner_id.clone(),
                written_at: now,
            },
        )
        .map_err(|e| CairnError::UpgradeIncomplete(format!("poison write failed: {e}")))?;
        self.formats.propose_new_format(&next).map_err(|e| {
            CairnError::UpgradeIncomplete(format!(
                "poisoned v{source} but failed to publish v{target}: {e}"
            ))
        })?;
        info!(from = source, to = target, "repository format upgrade committed");
        Ok(UpgradeOutcome::Committed {
            from: source,
            to: target,
            lock_id,
        })
    }

    /// Lock chains left behind for versions the repository has already
    /// moved past describe finished transitions.
    fn clear_finished_locks(&self, current: u32) {
        let sources = match list_lock_sources(self.storage.as_ref()) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "failed to list upgrade lock chains");
                return;
            }
        };
        for source in sources.into_iter().filter(|s| *s < current) {
            match remove_chain(self.storage.as_ref(), source) {
                Ok(n) => info!(version = source, removed = n, "removed leftover upgrade lock chain"),
                Err(e) => warn!(version = source, error = %e, "failed to remove leftover upgrade lock chain"),
            }
        }
    }

    fn write_owned(&self, record: &LockRecord) -> Result<()> {
        if try_write(self.storage.as_ref(), record)? {
            Ok(())
        } else {
            warn!(
                lock_id = %record.lock_id,
                revision = record.revision,
                "lost upgrade lock ownership"
            );
            Err(self.contention(record.source_version))
        }
    }

    fn verify_ownership(&self, record: &LockRecord) -> Result<()> {
        match read_latest(self.storage.as_ref(), record.source_version)? {
            Some(latest) if latest.lock_id == record.lock_id && latest.revision == record.revision => {
                Ok(())
            }
            Some(latest) => Err(CairnError::LockContention {
                holder: latest.owner_id,
            }),
            None => Err(CairnError::LockContention {
                holder: "unknown".into(),
            }),
        }
    }

    fn contention(&self, source: u32) -> CairnError {
        let holder = read_latest(self.storage.as_ref(), source)
            .ok()
            .flatten()
            .map(|l| l.owner_id)
            .unwrap_or_else(|| "unknown".into());
        CairnError::LockContention { holder }
    }

    /// Best-effort `Aborted` revision on top of our latest one. Never
    /// overwrites a newer owner.
    fn abort(&self, record: &LockRecord, reason: &CairnError) {
        if matches!(reason, CairnError::LockContention { .. }) {
            return;
        }
        let latest = match read_latest(self.storage.as_ref(), record.source_version) {
            Ok(Some(latest)) if latest.lock_id == record.lock_id => latest,
            Ok(_) => {
                debug!(lock_id = %record.lock_id, "upgrade lock no longer ours, not aborting");
                return;
            }
            Err(e) => {
                warn!(error = %e, "failed to read upgrade lock before abort");
                return;
            }
        };
        let mut aborted = match latest.advance(UpgradeState::Aborted, self.clock.now()) {
            Ok(a) => a,
            Err(e) => {
                warn!(error = %e, "cannot abort upgrade lock");
                return;
            }
        };
        aborted.message = Some(reason.to_string());
        match try_write(self.storage.as_ref(), &aborted) {
            Ok(true) => warn!(
                lock_id = %aborted.lock_id,
                reason = %reason,
                "upgrade aborted"
            ),
            Ok(false) => warn!(lock_id = %aborted.lock_id, "upgrade lock moved on before abort"),
            Err(e) => warn!(error = %e, "failed to record aborted upgrade"),
        }
    }
}

fn new_lock_id() -> String {
    format!("{:032x}", rand::random::<u128>())
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
