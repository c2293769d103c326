pub(crate) mod content;
pub(crate) mod index;
pub(crate) mod repo;
pub(crate) mod upgrade;

use crate::cli::{Commands, ContentCommand, IndexCommand, RepoCommand};
use crate::session::Session;
use crate::CliResult;

pub(crate) fn dispatch(command: &Commands, session: &Session) -> CliResult<()> {
    match command {
        Commands::Repo { command } => match command {
            RepoCommand::Create {
                location,
                format_version,
                encryption,
                hash,
                compression,
                max_pack_size,
            } => repo::run_create(
                session,
                location,
                *format_version,
                encryption,
                hash,
                compression,
                max_pack_size.as_deref(),
            ),
            RepoCommand::Connect {
                location,
                upgrade_owner_id,
            } => repo::run_connect(session, location, upgrade_owner_id.clone()),
            RepoCommand::Disconnect => repo::run_disconnect(session),
            RepoCommand::Status => repo::run_status(session),
            RepoCommand::Upgrade(args) => upgrade::run_upgrade(session, args),
            RepoCommand::UpgradeRollback { force } => upgrade::run_rollback(session, *force),
        },
        Commands::Content { command } => match command {
            ContentCommand::Put { file } => content::run_put(session, file.as_deref()),
            ContentCommand::Get { id, output } => {
                content::run_get(session, id, output.as_deref())
            }
            ContentCommand::Rm { id } => content::run_rm(session, id),
            ContentCommand::Ls => content::run_ls(session),
        },
        Commands::Index { command } => match command {
            IndexCommand::Ls => index::run_ls(session),
            IndexCommand::Compact { min_blobs } => index::run_compact(session, *min_blobs),
            IndexCommand::Cleanup { min_age } => index::run_cleanup(session, *min_age),
            IndexCommand::Check => index::run_check(session),
        },
    }
}
