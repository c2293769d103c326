//! Live format upgrades.
//!
//! An upgrade away from format `vN` is coordinated entirely through blobs:
//! a chain of lock revisions under `upgrade-lock/vN/`, each written with a
//! conditional put, a poison marker for `vN`, and finally the `vN+1` format
//! descriptor. Other clients watch the lock and poison state through
//! [`UpgradeWatch`].

pub mod coordinator;
pub mod record;
pub mod watch;

pub use coordinator::{
    UpgradeCoordinator, UpgradeOutcome, UpgradeRequest, UpgradeStatus, MIN_SAFE_IO_DRAIN_TIMEOUT,
};
pub use record::{LockRecord, UpgradeState};
pub use watch::UpgradeWatch;
