use cairn_core::config::format_human_duration;
use cairn_core::upgrade::{UpgradeOutcome, UpgradeRequest};

use crate::cli::UpgradeArgs;
use crate::format::parse_pack_size;
use crate::session::{owner_id, Session};
use crate::CliResult;

pub(crate) fn run_upgrade(session: &Session, args: &UpgradeArgs) -> CliResult<()> {
    // Unsafe upgrades may finish a commit that left the current format
    // poisoned.
    let (repo, cfg) = if args.allow_unsafe_upgrade {
        session.open_for_recovery()?
    } else {
        session.open()?
    };
    let defaults = UpgradeRequest::new(owner_id(args.upgrade_owner_id.as_deref(), &cfg));
    let req = UpgradeRequest {
        io_drain_timeout: args.io_drain_timeout,
        status_poll_interval: args
            .status_poll_interval
            .unwrap_or(cfg.options.status_poll_interval),
        max_permitted_clock_drift: args
            .max_permitted_clock_drift
            .unwrap_or(defaults.max_permitted_clock_drift),
        stale_lock_multiplier: args
            .stale_lock_multiplier
            .unwrap_or(cfg.options.stale_lock_multiplier),
        allow_unsafe_upgrade: args.allow_unsafe_upgrade,
        target_version: args.target_version,
        target_max_pack_size: args
            .max_pack_size
            .as_deref()
            .map(parse_pack_size)
            .transpose()?,
        lock_enabled: cfg.options.lock_enabled(),
        ..defaults
    };
    req.validate()?;

    if req.lock_enabled {
        eprintln!(
            "Upgrading as '{}'; other clients have {} to drain in-flight writes",
            req.owner_id,
            format_human_duration(req.io_drain_timeout)
        );
    } else {
        eprintln!("Warning: upgrade lock protocol is disabled; upgrading without a drain");
    }

    match repo.upgrade(&req)? {
        UpgradeOutcome::AlreadyLatest { version } => {
            println!("Repository is already at format v{version}.");
        }
        UpgradeOutcome::Committed { from, to, lock_id } => {
            drop(repo);
            // This handle is superseded now; remember the new format.
            let (_, upgraded) = session.connect(&cfg.storage, cfg.options.clone())?;
            session.save(cfg.storage.clone(), &upgraded, cfg.owner_id.clone())?;
            println!("Upgraded repository from format v{from} to v{to} (lock {lock_id}).");
        }
    }
    Ok(())
}

pub(crate) fn run_rollback(session: &Session, force: bool) -> CliResult<()> {
    let (repo, cfg) = session.open()?;
    let me = owner_id(None, &cfg);
    match repo.rollback_upgrade(&me, force)? {
        Some(aborted) => println!(
            "Rolled back upgrade {} (v{} -> v{}) held by '{}'.",
            aborted.lock_id, aborted.source_version, aborted.target_version, aborted.owner_id
        ),
        None => println!("No upgrade in progress."),
    }
    Ok(())
}
