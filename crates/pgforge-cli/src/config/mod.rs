//! CLI configuration management.
//!
//! This module defines the complete CLI configuration hierarchy:
//!
//! ```text
//! Cli
//! ├── postgres: PgConfig          # Connection URL, pool and timeouts
//! ├── extensions: ExtensionFlags  # ENABLE_GIS, ENABLE_TIMESCALE, ENABLE_VECTOR
//! ├── executor: ExecutorConfig    # Step lock wait and retry interval
//! ├── plan / format               # Plan source and report format
//! └── command: Command            # migrate | status | rollback | plan
//! ```
//!
//! All configuration can be provided via CLI arguments or environment variables.
//! Use `--help` to see all available options.
//!
//! # Example
//!
//! ```bash
//! # Enable pgvector and migrate
//! pgforge --postgres-url "postgresql://..." --enable-vector migrate
//!
//! # Or via environment variables
//! POSTGRES_URL="postgresql://..." ENABLE_VECTOR=true pgforge migrate
//! ```

use std::path::PathBuf;
use std::process;

use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use pgforge_core::capability::{ExtensionFlags, RequirementSet};
use pgforge_core::executor::ExecutorConfig;
use pgforge_core::plan::{MigrationPlan, StepId};
use pgforge_postgres::PgConfig;
use pgforge_postgres::catalog::default_plan;
use serde::{Deserialize, Serialize};

use crate::{TRACING_TARGET_CONFIG, TRACING_TARGET_STARTUP};

/// Complete CLI configuration.
#[derive(Debug, Clone, Parser)]
#[command(name = "pgforge")]
#[command(about = "Extension-aware Postgres provisioning and migrations")]
#[command(version)]
pub struct Cli {
    /// Database connection settings.
    #[clap(flatten)]
    pub postgres: PgConfig,

    /// Optional extensions to require.
    #[clap(flatten)]
    pub extensions: ExtensionFlags,

    /// Step lock behaviour.
    #[clap(flatten)]
    pub executor: ExecutorConfig,

    /// JSON migration plan to use instead of the built-in catalog
    #[arg(long, env = "PGFORGE_PLAN", global = true)]
    pub plan: Option<PathBuf>,

    /// Report format
    #[arg(long, env = "PGFORGE_FORMAT", value_enum, default_value_t = OutputFormat::Text, global = true)]
    pub format: OutputFormat,

    #[command(subcommand)]
    pub command: Command,
}

/// Report rendering.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Human-readable summary.
    #[default]
    Text,
    /// Pretty-printed JSON.
    Json,
}

/// Available commands.
#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum Command {
    /// Activate required extensions and apply every eligible step
    Migrate,
    /// Show active extensions and per-step status without writing
    Status,
    /// Reverse applied steps above a target step
    Rollback(RollbackArgs),
    /// Print the effective migration plan
    Plan,
}

/// Arguments of the `rollback` command.
#[derive(Debug, Clone, PartialEq, Eq, Args)]
pub struct RollbackArgs {
    /// Keep this step and everything before it; 0 reverts every step
    #[arg(long = "to", value_name = "STEP_ID")]
    pub to: u32,
}

impl RollbackArgs {
    /// Returns the rollback target.
    #[inline]
    pub fn target(&self) -> StepId {
        StepId::new(self.to)
    }
}

impl Cli {
    /// Loads environment variables from .env file (if enabled) and parses CLI arguments.
    ///
    /// Loading happens before clap parses arguments, so values from .env act
    /// as environment defaults.
    pub fn init() -> Self {
        Self::load_dotenv();
        Self::parse()
    }

    /// Loads environment variables from .env file if the dotenv feature is enabled.
    #[cfg(feature = "dotenv")]
    fn load_dotenv() {
        if let Err(err) = dotenvy::dotenv()
            && !err.not_found()
        {
            eprintln!("Warning: failed to load .env file: {err}");
        }
    }

    /// No-op when dotenv feature is disabled.
    #[cfg(not(feature = "dotenv"))]
    fn load_dotenv() {}

    /// Validates all configuration values.
    ///
    /// Connection settings are only checked for commands that connect.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.command != Command::Plan {
            self.postgres
                .validate()
                .context("invalid database configuration")?;
        }

        self.executor
            .validate()
            .context("invalid executor configuration")?;
        self.requirements()?;
        Ok(())
    }

    /// Builds the requirement set from the extension flags.
    pub fn requirements(&self) -> anyhow::Result<RequirementSet> {
        self.extensions
            .requirements()
            .context("invalid extension configuration")
    }

    /// Loads the plan file, or returns the built-in catalog.
    pub fn load_plan(&self) -> anyhow::Result<MigrationPlan> {
        let Some(path) = &self.plan else {
            return default_plan().context("built-in plan is invalid");
        };

        MigrationPlan::from_path(path)
            .with_context(|| format!("failed to load plan {}", path.display()))
    }

    /// Logs configuration (no sensitive information).
    pub fn log(&self) {
        tracing::debug!(
            target: TRACING_TARGET_STARTUP,
            version = env!("CARGO_PKG_VERSION"),
            pid = process::id(),
            arch = std::env::consts::ARCH,
            os = std::env::consts::OS,
            features = ?Self::enabled_features(),
            "Build information"
        );

        tracing::info!(
            target: TRACING_TARGET_CONFIG,
            database_url = %self.postgres.database_url_masked(),
            postgres_max_connections = self.postgres.postgres_max_connections,
            postgres_connection_timeout_secs = ?self.postgres.postgres_connection_timeout_secs,
            postgres_statement_timeout_secs = ?self.postgres.postgres_statement_timeout_secs,
            "Database configuration"
        );

        tracing::info!(
            target: TRACING_TARGET_CONFIG,
            enable_gis = self.extensions.enable_gis,
            enable_timescale = self.extensions.enable_timescale,
            enable_vector = self.extensions.enable_vector,
            lock_wait_secs = self.executor.lock_wait_secs,
            plan = ?self.plan,
            "Provisioning configuration"
        );
    }

    /// Returns a list of enabled compile-time features.
    fn enabled_features() -> Vec<&'static str> {
        [cfg!(feature = "dotenv").then_some("dotenv")]
            .into_iter()
            .flatten()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use pgforge_core::capability::CapabilityName;

    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("pgforge").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn flags_become_requirements() {
        let cli = parse(&[
            "--postgres-url",
            "postgresql://app:secret@db/app",
            "--enable-gis",
            "--enable-vector",
            "--vector-min-version",
            "0.6.0",
            "migrate",
        ]);

        assert_eq!(cli.command, Command::Migrate);
        cli.validate().unwrap();

        let requirements = cli.requirements().unwrap();
        assert_eq!(requirements.len(), 2);
        assert_eq!(
            requirements.minimum(&CapabilityName::vector()),
            Some(&semver::Version::new(0, 6, 0))
        );
        assert!(!requirements.contains(&CapabilityName::time_series()));
    }

    #[test]
    fn rollback_requires_target() {
        let cli = parse(&["rollback", "--to", "4"]);
        assert_eq!(cli.command, Command::Rollback(RollbackArgs { to: 4 }));

        let missing = Cli::try_parse_from(["pgforge", "rollback"]);
        assert!(missing.is_err());
    }

    #[test]
    fn invalid_minimum_version_is_rejected() {
        let cli = parse(&["--enable-timescale", "--timescale-min-version", "two", "status"]);
        assert!(cli.validate().is_err());
    }

    #[test]
    fn format_flag_is_global() {
        let cli = parse(&["plan", "--format", "json"]);
        assert_eq!(cli.format, OutputFormat::Json);
    }

    #[test]
    fn plan_defaults_to_catalog() {
        let cli = parse(&["plan"]);
        assert_eq!(cli.load_plan().unwrap(), default_plan().unwrap());
    }

    #[test]
    fn plan_file_is_loaded() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "steps": [
                {{ "id": 1, "description": "notes", "forward": "CREATE TABLE notes (id INT)",
                   "reverse": "DROP TABLE notes",
                   "postconditions": [{{ "kind": "table_exists", "table": "notes" }}] }}
            ] }}"#
        )
        .unwrap();

        let cli = parse(&["--plan", file.path().to_str().unwrap(), "plan"]);
        let plan = cli.load_plan().unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.steps()[0].description, "notes");
    }

    #[test]
    fn unordered_plan_file_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "steps": [
                {{ "id": 2, "description": "b", "forward": "SELECT 1" }},
                {{ "id": 1, "description": "a", "forward": "SELECT 1" }}
            ] }}"#
        )
        .unwrap();

        let cli = parse(&["--plan", file.path().to_str().unwrap(), "plan"]);
        assert!(cli.load_plan().is_err());
    }
}
