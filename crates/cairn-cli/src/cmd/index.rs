use std::time::Duration;

use crate::format::format_time;
use crate::session::Session;
use crate::CliResult;

pub(crate) fn run_ls(session: &Session) -> CliResult<()> {
    let (repo, _) = session.open()?;
    let listing = repo.index_blobs()?;

    for key in &listing.live_blobs {
        println!("live        {key}");
    }
    for (key, since) in &listing.superseded {
        println!("superseded  {key}  (since {})", format_time(*since));
    }
    for key in &listing.rejected {
        println!("rejected    {key}");
    }
    for key in &listing.future {
        println!("future      {key}");
    }
    eprintln!(
        "{} live, {} superseded, {} rejected, {} from newer formats; {} live entries",
        listing.live_blobs.len(),
        listing.superseded.len(),
        listing.rejected.len(),
        listing.future.len(),
        listing.index.live_count(),
    );
    Ok(())
}

pub(crate) fn run_compact(session: &Session, min_blobs: usize) -> CliResult<()> {
    let (repo, _) = session.open()?;
    let stats = repo.compact_indexes(min_blobs)?;
    match stats.new_blob {
        Some(key) => println!(
            "Merged {} index blob(s) into {key} ({} entries).",
            stats.blobs_merged, stats.entries_written
        ),
        None => println!("Nothing to compact."),
    }
    Ok(())
}

pub(crate) fn run_cleanup(session: &Session, min_age: Duration) -> CliResult<()> {
    let min_age = chrono::Duration::from_std(min_age)?;
    let (repo, _) = session.open()?;
    let removed = repo.cleanup_indexes(min_age)?;
    if removed == 0 {
        println!("No superseded index blobs old enough to delete.");
    } else {
        println!("Deleted {removed} superseded index blob(s).");
    }
    Ok(())
}

pub(crate) fn run_check(session: &Session) -> CliResult<()> {
    let (repo, _) = session.open()?;
    let report = repo.check_packs()?;

    if !report.errors.is_empty() {
        println!("Errors found:");
        for err in &report.errors {
            println!("  [{}] {}", err.context, err.message);
        }
        println!();
    }
    for pack_id in &report.unreferenced_packs {
        println!("unreferenced  {}", pack_id.to_hex());
    }

    println!(
        "Check complete: {} packs, {} entries, {} unreferenced packs, {} errors",
        report.packs_checked,
        report.entries_checked,
        report.unreferenced_packs.len(),
        report.errors.len()
    );
    if !report.errors.is_empty() {
        return Err(format!("check found {} error(s)", report.errors.len()).into());
    }
    Ok(())
}
