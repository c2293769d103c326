use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use cairn_core::config::parse_human_duration;

#[derive(Parser)]
#[command(
    name = "cairn",
    version,
    about = "Deduplicating, encrypted content repository with live format upgrades",
    after_help = "\
Connection config lookup order:
  1. --config <path>             (explicit flag)
  2. $CAIRN_CONFIG               (environment variable)
  3. Platform user config dir + /cairn/repository.yaml

Environment variables:
  CAIRN_CONFIG                  Path to the connection config
  CAIRN_PASSWORD                Repository passphrase (skips interactive prompt)
  CAIRN_UPGRADE_LOCK_ENABLED    Set to 0 or false to disengage the upgrade lock protocol
                                (KOPIA_UPGRADE_LOCK_ENABLED is accepted as an alias)"
)]
pub(crate) struct Cli {
    /// Path to the connection config (overrides CAIRN_CONFIG)
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Repository passphrase (overrides CAIRN_PASSWORD)
    #[arg(long, global = true)]
    pub password: Option<String>,

    /// Behave like an engine that understands formats up to this version
    #[arg(long, global = true, hide = true)]
    pub max_format_version: Option<u32>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Create, connect to and upgrade repositories
    #[command(alias = "repository")]
    Repo {
        #[command(subcommand)]
        command: RepoCommand,
    },

    /// Store and retrieve content by ID
    Content {
        #[command(subcommand)]
        command: ContentCommand,
    },

    /// Inspect and maintain index blobs
    Index {
        #[command(subcommand)]
        command: IndexCommand,
    },
}

#[derive(Subcommand)]
pub(crate) enum RepoCommand {
    /// Initialize a new repository and connect to it
    Create {
        #[command(flatten)]
        location: LocationArgs,

        /// Format version to create (defaults to the engine's default)
        #[arg(long)]
        format_version: Option<u32>,

        /// Encryption algorithm (aes256gcm, chacha20poly1305, none)
        #[arg(long, default_value = "aes256gcm")]
        encryption: String,

        /// Content ID hash (blake2b-256-keyed, blake2s-256-keyed)
        #[arg(long, default_value = "blake2b-256-keyed")]
        hash: String,

        /// Compression algorithm (lz4, zstd, zstd:<level>, none)
        #[arg(long, default_value = "lz4")]
        compression: String,

        /// Target pack size, e.g. 32M
        #[arg(long)]
        max_pack_size: Option<String>,
    },

    /// Connect to an existing repository
    Connect {
        #[command(flatten)]
        location: LocationArgs,

        /// Owner id recorded for upgrades started from this connection
        #[arg(long)]
        upgrade_owner_id: Option<String>,
    },

    /// Forget the current connection
    Disconnect,

    /// Show format, lock and poison state
    Status,

    /// Upgrade the repository format while other clients stay connected
    Upgrade(UpgradeArgs),

    /// Abort an upgrade that has not started committing
    UpgradeRollback {
        /// Roll back even if the lock holder is still active
        #[arg(long)]
        force: bool,
    },
}

#[derive(Args)]
pub(crate) struct LocationArgs {
    /// Storage backend (filesystem)
    pub backend: String,

    /// Repository path
    #[arg(long)]
    pub path: String,
}

#[derive(Args)]
pub(crate) struct UpgradeArgs {
    /// Identifies this client in the upgrade lock (defaults to user@host)
    #[arg(long)]
    pub upgrade_owner_id: Option<String>,

    /// How long other clients get to finish in-flight writes
    #[arg(long, default_value = "15m", value_parser = parse_duration)]
    pub io_drain_timeout: Duration,

    /// How often lock state is re-read while draining
    #[arg(long, value_parser = parse_duration)]
    pub status_poll_interval: Option<Duration>,

    /// Largest tolerated difference between local and storage clocks
    #[arg(long, value_parser = parse_duration)]
    pub max_permitted_clock_drift: Option<Duration>,

    /// A lock idle for this many drain windows is considered abandoned
    #[arg(long)]
    pub stale_lock_multiplier: Option<u32>,

    /// Allow short drain windows, ignore clock drift and take over held locks
    #[arg(long)]
    pub allow_unsafe_upgrade: bool,

    /// Format version to upgrade to (defaults to the newest supported)
    #[arg(long)]
    pub target_version: Option<u32>,

    /// Pack size for the new format, e.g. 64M
    #[arg(long)]
    pub max_pack_size: Option<String>,
}

#[derive(Subcommand)]
pub(crate) enum ContentCommand {
    /// Store a file (or stdin) and print its content ID
    Put {
        /// File to store; omit or pass `-` to read stdin
        file: Option<PathBuf>,
    },

    /// Write content to stdout or a file
    Get {
        id: String,

        /// Write to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Delete content
    Rm { id: String },

    /// List live content IDs
    Ls,
}

#[derive(Subcommand)]
pub(crate) enum IndexCommand {
    /// List index blobs and whether they are live
    Ls,

    /// Merge live index blobs into one
    Compact {
        /// Only compact once at least this many live blobs exist
        #[arg(long, default_value_t = 2)]
        min_blobs: usize,
    },

    /// Verify that every indexed content sits where its pack header says
    Check,

    /// Delete index blobs superseded for longer than --min-age
    Cleanup {
        #[arg(long, default_value = "1h", value_parser = parse_duration)]
        min_age: Duration,
    },
}

fn parse_duration(raw: &str) -> Result<Duration, String> {
    parse_human_duration(raw).map_err(|e| e.to_string())
}
