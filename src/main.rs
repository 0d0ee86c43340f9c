mod cli;
mod launcher;
mod layout;
mod model;
mod orchestrator;
mod snapshot;

use clap::Parser;
use std::process::ExitCode;
use time::OffsetDateTime;
use tracing::error;
use tracing_subscriber::EnvFilter;

// Single-threaded runtime: the supervisor loop and the tick driver are the
// only tasks, and the local UTC offset is only readable while the process
// has one thread.
#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = cli::Cli::parse();
    let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());

    let level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_writer(std::io::stderr)
        .init();

    match cli::run(args, now).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::from(cli::exit_code(&e))
        }
    }
}
