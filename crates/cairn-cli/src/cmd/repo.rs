use std::sync::Arc;

use cairn_core::compress::Compression;
use cairn_core::config::{format_human_duration, remove_connection, ClientOptions};
use cairn_core::repo::descriptor::DEFAULT_MAX_PACK_SIZE;
use cairn_core::repo::{CreateOptions, Repository};
use cairn_crypto::{EncryptionAlgorithm, HashAlgorithm};
use cairn_storage::{backend_from_config, BackendKind, StorageConfig};

use crate::cli::LocationArgs;
use crate::format::{format_bytes, format_time, format_versions, parse_pack_size};
use crate::passphrase::get_init_passphrase;
use crate::session::Session;
use crate::CliResult;

fn storage_config(location: &LocationArgs) -> CliResult<StorageConfig> {
    let backend: BackendKind = location.backend.parse()?;
    Ok(StorageConfig {
        backend,
        path: location.path.clone(),
    })
}

pub(crate) fn run_create(
    session: &Session,
    location: &LocationArgs,
    format_version: Option<u32>,
    encryption: &str,
    hash: &str,
    compression: &str,
    max_pack_size: Option<&str>,
) -> CliResult<()> {
    let storage_cfg = storage_config(location)?;
    let encryption: EncryptionAlgorithm = encryption.parse()?;
    let create = CreateOptions {
        format_version,
        encryption,
        hash_algorithm: hash.parse::<HashAlgorithm>()?,
        compression: compression.parse::<Compression>()?,
        max_pack_size: max_pack_size
            .map(parse_pack_size)
            .transpose()?
            .unwrap_or(DEFAULT_MAX_PACK_SIZE),
        ..CreateOptions::default()
    };

    if let Some(parent) = std::path::Path::new(&storage_cfg.path).parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            return Err(format!("parent directory {} does not exist", parent.display()).into());
        }
    }
    std::fs::create_dir_all(&storage_cfg.path)?;
    let storage = backend_from_config(&storage_cfg)?;
    let pass = get_init_passphrase(session.password.as_deref(), encryption, &storage_cfg.path)?;
    let repo = Repository::create(
        Arc::clone(&storage),
        &storage_cfg.path,
        pass.as_deref().map(String::as_str),
        &create,
        session.open_options(ClientOptions::default()),
    )?;
    session.save(storage_cfg.clone(), &repo, None)?;

    println!(
        "Created repository at {} (format v{}, encryption {})",
        storage_cfg.path,
        repo.descriptor().format_version,
        repo.descriptor().encryption,
    );
    Ok(())
}

pub(crate) fn run_connect(
    session: &Session,
    location: &LocationArgs,
    owner_id: Option<String>,
) -> CliResult<()> {
    let storage_cfg = storage_config(location)?;
    let (_, repo) = session.connect(&storage_cfg, ClientOptions::default())?;
    session.save(storage_cfg.clone(), &repo, owner_id)?;
    println!(
        "Connected to repository at {} (format v{})",
        storage_cfg.path,
        repo.descriptor().format_version
    );
    Ok(())
}

pub(crate) fn run_disconnect(session: &Session) -> CliResult<()> {
    if remove_connection(session.config.path())? {
        println!("Disconnected.");
    } else {
        println!("Not connected.");
    }
    Ok(())
}

pub(crate) fn run_status(session: &Session) -> CliResult<()> {
    let (repo, cfg) = session.open()?;
    let desc = repo.descriptor();
    let features = repo.features();
    let status = repo.upgrade_status()?;

    println!("Repository:       {} ({})", cfg.storage.path, cfg.storage.backend);
    println!("Config:           {}", session.config);
    println!("Unique ID:        {}", desc.unique_id);
    println!("Format version:   {}", desc.format_version);
    println!("Index version:    {}", desc.index_version);
    println!("Encryption:       {}", desc.encryption);
    println!("Content hash:     {}", desc.hash_algorithm);
    println!(
        "Compression:      {}",
        if features.compression {
            desc.compression.to_string()
        } else {
            "unsupported by this format".to_string()
        }
    );
    println!("Content-bound AAD: {}", features.content_bound_aad);
    println!(
        "Max pack size:    {}",
        format_bytes(u64::from(desc.max_pack_size))
    );
    println!("Live content:     {}", repo.live_content_count());
    println!("Format blobs:     {}", format_versions(&status.format_versions));
    println!("Poisoned:         {}", format_versions(&status.poisoned));
    println!(
        "Upgrade lock:     {}",
        if cfg.options.lock_enabled() {
            "enabled"
        } else {
            "disabled"
        }
    );

    match &status.lock {
        None => println!("Upgrade:          none"),
        Some(lock) => {
            println!(
                "Upgrade:          {} (v{} -> v{}, owner '{}', revision {}{})",
                lock.state,
                lock.source_version,
                lock.target_version,
                lock.owner_id,
                lock.revision,
                if status.lock_stale { ", stale" } else { "" },
            );
            println!("  Lock ID:        {}", lock.lock_id);
            println!("  Updated:        {}", format_time(lock.updated_at));
            println!(
                "  Drain timeout:  {}",
                format_human_duration(lock.io_drain_timeout())
            );
            if let Some(deadline) = lock.drain_deadline {
                println!("  Drain deadline: {}", format_time(deadline));
            }
            if let Some(message) = &lock.message {
                println!("  Message:        {message}");
            }
        }
    }
    Ok(())
}
