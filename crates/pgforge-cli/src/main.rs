#![forbid(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![doc = include_str!("../README.md")]

mod command;
mod config;
mod telemetry;

use std::io::Write;
use std::process;

use anyhow::Context;
use pgforge_core::Orchestrator;
use pgforge_postgres::{PgClient, PgConn};
use tokio_util::sync::CancellationToken;

use crate::command::{Outcome, cancel_on_signal};
use crate::config::{Cli, Command};

// Tracing target constants
pub const TRACING_TARGET_STARTUP: &str = "pgforge_cli::startup";
pub const TRACING_TARGET_SHUTDOWN: &str = "pgforge_cli::shutdown";
pub const TRACING_TARGET_CONFIG: &str = "pgforge_cli::config";

#[tokio::main]
async fn main() {
    let error = match run().await {
        Ok(true) => process::exit(0),
        Ok(false) => {
            tracing::warn!(
                target: TRACING_TARGET_SHUTDOWN,
                "command finished unsuccessfully"
            );
            process::exit(1);
        }
        Err(error) => error,
    };

    if tracing::enabled!(tracing::Level::ERROR) {
        tracing::error!(
            target: TRACING_TARGET_SHUTDOWN,
            error = %error,
            "command terminated with error"
        );
    } else {
        eprintln!("Error: {error:#}");
    }

    process::exit(1);
}

/// Runs the selected command and prints its report.
///
/// Returns whether the command succeeded.
async fn run() -> anyhow::Result<bool> {
    let cli = Cli::init();

    telemetry::init_tracing()?;
    cli.log();
    cli.validate()?;

    let cancel = CancellationToken::new();
    let orchestrator = Orchestrator::new(cli.requirements()?, cli.load_plan()?)
        .with_lock_policy(cli.executor.lock_policy())
        .with_cancellation(cancel.clone());

    tracing::info!(
        target: TRACING_TARGET_STARTUP,
        command = ?cli.command,
        steps = orchestrator.plan().len(),
        backend = %orchestrator.backend(),
        "starting pgforge"
    );

    let outcome = match &cli.command {
        Command::Plan => command::plan(&orchestrator, cli.format)?,
        Command::Migrate => {
            let mut conn = connect(&cli).await?;
            cancel_on_signal(cancel.clone());
            command::migrate(&orchestrator, conn.connection_mut(), cli.format).await?
        }
        Command::Status => {
            let mut conn = connect(&cli).await?;
            command::status(&orchestrator, conn.connection_mut(), cli.format).await?
        }
        Command::Rollback(args) => {
            let mut conn = connect(&cli).await?;
            cancel_on_signal(cancel.clone());
            command::rollback(&orchestrator, conn.connection_mut(), args.target(), cli.format)
                .await?
        }
    };

    cancel.cancel();
    print_outcome(&outcome)?;
    Ok(outcome.success)
}

/// Opens the pool and takes the connection the whole command runs on.
///
/// Step locks are session-scoped, so a single connection is held for the
/// entire command.
async fn connect(cli: &Cli) -> anyhow::Result<PgConn> {
    let client = PgClient::new_with_test(cli.postgres.clone())
        .await
        .with_context(|| {
            format!(
                "failed to connect to {}",
                cli.postgres.database_url_masked()
            )
        })?;

    client
        .get_connection()
        .await
        .context("failed to acquire a database connection")
}

fn print_outcome(outcome: &Outcome) -> anyhow::Result<()> {
    let mut stdout = std::io::stdout().lock();
    stdout
        .write_all(outcome.output.as_bytes())
        .and_then(|()| stdout.flush())
        .context("failed to write report")
}
