mod cli;
mod cmd;
mod format;
mod passphrase;
mod prompt;
mod session;

use clap::Parser;

use cairn_types::error::CairnError;

use cli::Cli;
use session::Session;

pub(crate) type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

fn main() {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let session = match Session::from_cli(&cli) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = cmd::dispatch(&cli.command, &session) {
        eprintln!("Error: {e}");
        if e.downcast_ref::<CairnError>().is_some_and(CairnError::is_retryable) {
            eprintln!("This may succeed if retried once the upgrade finishes or the lock is released.");
        }
        std::process::exit(1);
    }
}
