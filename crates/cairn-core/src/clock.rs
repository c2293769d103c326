use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use cairn_storage::StorageBackend;
use cairn_types::error::{CairnError, Result};

const CLOCK_SAMPLE_PREFIX: &str = "clock-sample/";

/// Source of wall-clock time. Injected so protocol timing can be driven
/// deterministically.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
    fn sleep(&self, duration: Duration);
}

/// The operating system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// A clock that only moves when told to. `sleep` advances it instantly.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|p| p.into_inner());
        *now += to_chrono(by);
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|p| p.into_inner()) = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }
}

/// Convert a std duration, saturating instead of overflowing.
pub fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

/// Offset of the storage clock relative to the local clock, measured by
/// writing a sample blob and reading back its storage-assigned mtime.
/// Positive means storage is ahead.
pub fn measure_drift(
    storage: &dyn StorageBackend,
    clock: &dyn Clock,
    owner: &str,
) -> Result<chrono::Duration> {
    let key = format!(
        "{CLOCK_SAMPLE_PREFIX}{}-{:016x}",
        sanitize(owner),
        rand::random::<u64>()
    );
    let before = clock.now();
    storage.put(&key, before.to_rfc3339().as_bytes())?;
    let after = clock.now();
    let meta = storage.stat(&key);
    if let Err(e) = storage.delete(&key) {
        warn!(key = %key, error = %e, "failed to remove clock sample");
    }
    let meta = meta?.ok_or_else(|| CairnError::NotFound(key.clone()))?;

    let local_midpoint = before + (after - before) / 2;
    let drift = meta.modified - local_midpoint;
    debug!(drift_ms = drift.num_milliseconds(), "measured storage clock drift");
    Ok(drift)
}

/// Fail with `ClockDrift` if the storage clock is further than `max` from
/// the local clock.
pub fn ensure_drift_within(
    storage: &dyn StorageBackend,
    clock: &dyn Clock,
    owner: &str,
    max: Duration,
) -> Result<chrono::Duration> {
    let drift = measure_drift(storage, clock, owner)?;
    let drift_ms = drift.num_milliseconds();
    let max_ms = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);
    if drift_ms.unsigned_abs() > max_ms {
        return Err(CairnError::ClockDrift { drift_ms, max_ms });
    }
    Ok(drift)
}

/// Keep owner ids usable inside a storage key.
fn sanitize(owner: &str) -> String {
    owner
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::TimeZone;

    use super::*;
    use cairn_storage::MemoryBackend;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn paired() -> (Arc<ManualClock>, MemoryBackend) {
        let clock = Arc::new(ManualClock::new(start()));
        let source = Arc::clone(&clock);
        (clock, MemoryBackend::with_time_source(move || source.now()))
    }

    #[test]
    fn manual_clock_sleep_advances() {
        let clock = ManualClock::new(start());
        clock.sleep(Duration::from_secs(90));
        assert_eq!(clock.now(), start() + chrono::Duration::seconds(90));
    }

    #[test]
    fn drift_is_zero_for_shared_time_source() {
        let (clock, storage) = paired();
        let drift = measure_drift(&storage, clock.as_ref(), "owner").unwrap();
        assert_eq!(drift, chrono::Duration::zero());
        assert!(storage.list(CLOCK_SAMPLE_PREFIX).unwrap().is_empty());
    }

    #[test]
    fn drift_beyond_limit_is_rejected() {
        let (clock, storage) = paired();
        storage.set_clock_skew(chrono::Duration::seconds(-30));
        let err = ensure_drift_within(&storage, clock.as_ref(), "o", Duration::from_secs(5))
            .unwrap_err();
        match err {
            CairnError::ClockDrift { drift_ms, max_ms } => {
                assert_eq!(drift_ms, -30_000);
                assert_eq!(max_ms, 5_000);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn drift_within_limit_passes() {
        let (clock, storage) = paired();
        storage.set_clock_skew(chrono::Duration::seconds(2));
        let drift =
            ensure_drift_within(&storage, clock.as_ref(), "o", Duration::from_secs(5)).unwrap();
        assert_eq!(drift.num_seconds(), 2);
    }

    #[test]
    fn sanitize_replaces_separators() {
        assert_eq!(sanitize("alice@host/1"), "alice_host_1");
    }
}
