//! Tracing initialization.

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Initializes the tracing subscriber for structured logging.
///
/// Logs go to stderr so that reports written to stdout stay machine-readable.
/// The log level can be configured via the `RUST_LOG` environment variable
/// and defaults to `info`.
///
/// ```bash
/// RUST_LOG=debug pgforge migrate
/// RUST_LOG=pgforge_core=trace,pgforge_postgres=debug pgforge status
/// ```
///
/// # Errors
///
/// Returns an error if the tracing subscriber fails to initialize.
pub fn init_tracing() -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .map_err(|e| anyhow::anyhow!("Failed to create env filter: {e}"))?;

    let fmt_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false)
        .with_level(true)
        .with_ansi(true);

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(env_filter)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {e}"))?;

    Ok(())
}
