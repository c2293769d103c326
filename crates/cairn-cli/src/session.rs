use std::sync::Arc;

use chrono::Utc;

use cairn_core::config::{
    load_connection, resolve_config_path, save_connection, ClientOptions, ConfigSource,
    ConnectionConfig,
};
use cairn_core::platform;
use cairn_core::repo::version::EngineCapabilities;
use cairn_core::repo::{OpenOptions, Repository};
use cairn_core::CairnError;
use cairn_storage::{backend_from_config, StorageBackend, StorageConfig};

use crate::cli::Cli;
use crate::passphrase::get_passphrase;
use crate::CliResult;

/// Per-invocation state shared by every command.
pub(crate) struct Session {
    pub config: ConfigSource,
    pub password: Option<String>,
    pub capabilities: EngineCapabilities,
}

impl Session {
    pub fn from_cli(cli: &Cli) -> CliResult<Self> {
        let config = resolve_config_path(cli.config.as_deref())?;
        let capabilities = match cli.max_format_version {
            Some(v) => EngineCapabilities::pinned(v)?,
            None => EngineCapabilities::current(),
        };
        tracing::debug!(config = %config, max_format = capabilities.max_format_version, "session");
        Ok(Self {
            config,
            password: cli.password.clone(),
            capabilities,
        })
    }

    pub fn open_options(&self, client: ClientOptions) -> OpenOptions {
        OpenOptions {
            capabilities: self.capabilities,
            client,
            ..OpenOptions::default()
        }
    }

    pub fn load(&self) -> CliResult<ConnectionConfig> {
        Ok(load_connection(self.config.path())?)
    }

    /// Open the connected repository at the format version recorded when
    /// the connection was made.
    pub fn open(&self) -> CliResult<(Repository, ConnectionConfig)> {
        let cfg = self.load()?;
        let storage = backend_from_config(&cfg.storage)?;
        let pass = get_passphrase(
            self.password.as_deref(),
            cfg.format.encryption,
            &cfg.storage.path,
        )?;
        let repo = Repository::open_cached(
            storage,
            &cfg.storage.path,
            pass.as_deref().map(String::as_str),
            &cfg.format,
            self.open_options(cfg.options.clone()),
        )
        .map_err(|e| with_reconnect_hint(e, &cfg.storage))?;
        Ok((repo, cfg))
    }

    /// Open the connected repository at whatever format is current, even
    /// one left poisoned by an interrupted upgrade. Only upgrade, rollback
    /// and status work on the result.
    pub fn open_for_recovery(&self) -> CliResult<(Repository, ConnectionConfig)> {
        let cfg = self.load()?;
        let storage = backend_from_config(&cfg.storage)?;
        let pass = get_passphrase(
            self.password.as_deref(),
            cfg.format.encryption,
            &cfg.storage.path,
        )?;
        let repo = Repository::connect_for_recovery(
            storage,
            &cfg.storage.path,
            pass.as_deref().map(String::as_str),
            self.open_options(cfg.options.clone()),
        )?;
        Ok((repo, cfg))
    }

    /// Connect by reading the current format from storage.
    pub fn connect(
        &self,
        storage_cfg: &StorageConfig,
        client: ClientOptions,
    ) -> CliResult<(Arc<dyn StorageBackend>, Repository)> {
        let storage = backend_from_config(storage_cfg)?;
        let bootstrap =
            cairn_core::repo::bootstrap::BootstrapBlob::read(storage.as_ref(), &storage_cfg.path)?;
        let pass = get_passphrase(
            self.password.as_deref(),
            bootstrap.encryption,
            &storage_cfg.path,
        )?;
        let repo = Repository::connect(
            Arc::clone(&storage),
            &storage_cfg.path,
            pass.as_deref().map(String::as_str),
            self.open_options(client),
        )?;
        Ok((storage, repo))
    }

    /// Persist the connection, remembering the format `repo` operates at.
    pub fn save(
        &self,
        storage: StorageConfig,
        repo: &Repository,
        owner_id: Option<String>,
    ) -> CliResult<()> {
        let cfg = ConnectionConfig {
            storage,
            format: repo.descriptor().clone(),
            connected_at: Utc::now(),
            owner_id,
            options: repo.client_options().clone(),
        };
        save_connection(self.config.path(), &cfg)?;
        tracing::info!(config = %self.config, version = cfg.format.format_version, "saved connection");
        Ok(())
    }
}

/// Owner id for upgrades: explicit flag, then the connection's, then user@host.
pub(crate) fn owner_id(flag: Option<&str>, cfg: &ConnectionConfig) -> String {
    flag.map(str::to_string)
        .or_else(|| cfg.owner_id.clone())
        .unwrap_or_else(platform::default_owner_id)
}

fn with_reconnect_hint(err: CairnError, storage: &StorageConfig) -> Box<dyn std::error::Error> {
    if err.requires_reconnect() {
        format!(
            "{err}\nrun `cairn repo connect {} --path {}` to reconnect",
            storage.backend, storage.path
        )
        .into()
    } else {
        err.into()
    }
}
