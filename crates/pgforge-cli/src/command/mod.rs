//! Command handlers.
//!
//! Every handler returns the rendered report together with whether the
//! command succeeded, so the report is always printed before the process
//! exits.

mod render;
mod shutdown;

use anyhow::Context;
use pgforge_core::executor::RollbackSummary;
use pgforge_core::plan::StepId;
use pgforge_core::store::{CapabilityStore, LedgerStore};
use pgforge_core::{Failure, Orchestrator};
use serde::Serialize;
pub use shutdown::cancel_on_signal;

use crate::config::OutputFormat;

/// Rendered command output.
#[derive(Debug)]
pub struct Outcome {
    pub output: String,
    pub success: bool,
}

impl Outcome {
    fn new(output: String, success: bool) -> Self {
        Self { output, success }
    }
}

/// Runs provisioning and migration.
pub async fn migrate<C>(
    orchestrator: &Orchestrator,
    conn: &mut C,
    format: OutputFormat,
) -> anyhow::Result<Outcome>
where
    C: CapabilityStore + LedgerStore + Send,
{
    let report = orchestrator.run(conn).await;
    let output = match format {
        OutputFormat::Text => render::orchestration(&report),
        OutputFormat::Json => to_json(&report)?,
    };

    Ok(Outcome::new(output, report.is_success()))
}

/// Reports capabilities and per-step status.
pub async fn status<C>(
    orchestrator: &Orchestrator,
    conn: &mut C,
    format: OutputFormat,
) -> anyhow::Result<Outcome>
where
    C: CapabilityStore + LedgerStore + Send,
{
    let report = orchestrator
        .status(conn)
        .await
        .context("failed to read migration status")?;

    let output = match format {
        OutputFormat::Text => render::status(&report),
        OutputFormat::Json => to_json(&report)?,
    };

    Ok(Outcome::new(output, true))
}

/// Reverts applied steps above `target`.
pub async fn rollback<C>(
    orchestrator: &Orchestrator,
    conn: &mut C,
    target: StepId,
    format: OutputFormat,
) -> anyhow::Result<Outcome>
where
    C: LedgerStore + Send,
{
    let summary = orchestrator.rollback(conn, target).await;
    let success = summary.halted.is_none() && !summary.cancelled;

    let output = match format {
        OutputFormat::Text => render::rollback(&summary),
        OutputFormat::Json => to_json(&RollbackReport::from(&summary))?,
    };

    Ok(Outcome::new(output, success))
}

/// Prints the effective plan.
pub fn plan(orchestrator: &Orchestrator, format: OutputFormat) -> anyhow::Result<Outcome> {
    let output = match format {
        OutputFormat::Text => render::plan(orchestrator.plan()),
        OutputFormat::Json => to_json(orchestrator.plan())?,
    };

    Ok(Outcome::new(output, true))
}

#[derive(Serialize)]
struct RollbackReport<'a> {
    reverted: &'a [StepId],
    cancelled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    failure: Option<Failure>,
}

impl<'a> From<&'a RollbackSummary> for RollbackReport<'a> {
    fn from(summary: &'a RollbackSummary) -> Self {
        Self {
            reverted: &summary.reverted,
            cancelled: summary.cancelled,
            failure: summary.halted.as_ref().map(Failure::from),
        }
    }
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<String> {
    let mut json = serde_json::to_string_pretty(value).context("failed to serialize report")?;
    json.push('\n');
    Ok(json)
}

#[cfg(test)]
mod tests {
    use pgforge_core::capability::{CapabilityName, RequirementSet};
    use pgforge_core::mock::MemoryDatabase;
    use pgforge_core::plan::{MigrationPlan, MigrationStep, Postcondition};
    use semver::Version;

    use super::*;

    fn orchestrator() -> Orchestrator {
        let plan = MigrationPlan::new(vec![
            MigrationStep::new(1, "Create documents", "CREATE TABLE documents (id BIGINT)")
                .with_reverse("DROP TABLE documents")
                .expects(Postcondition::table("documents")),
            MigrationStep::new(2, "Add embedding", "ALTER TABLE documents ADD COLUMN embedding vector(3)")
                .with_reverse("ALTER TABLE documents DROP COLUMN embedding")
                .requires(CapabilityName::vector())
                .after(1)
                .expects(Postcondition::column("documents", "embedding")),
        ])
        .unwrap();

        Orchestrator::new(
            RequirementSet::new().with(CapabilityName::vector(), Version::new(0, 5, 0)),
            plan,
        )
    }

    #[tokio::test]
    async fn migrate_renders_json_report() {
        let db = MemoryDatabase::new().with_available("vector", Version::new(0, 7, 0));
        let outcome = migrate(&orchestrator(), &mut db.connect(), OutputFormat::Json)
            .await
            .unwrap();

        assert!(outcome.success);
        let json: serde_json::Value = serde_json::from_str(&outcome.output).unwrap();
        assert_eq!(json["applied"], 2);
        assert_eq!(json["backend"], "standard");
        assert_eq!(json["steps"][1]["state"], "applied");
    }

    #[tokio::test]
    async fn migrate_failure_is_reported_and_unsuccessful() {
        let db = MemoryDatabase::new().with_denied("vector", "permission denied to create extension");
        let outcome = migrate(&orchestrator(), &mut db.connect(), OutputFormat::Text)
            .await
            .unwrap();

        assert!(!outcome.success);
        assert!(outcome.output.contains("error [activation_denied]"));
        assert!(outcome.output.contains("for vector"));
    }

    #[tokio::test]
    async fn status_is_read_only() {
        let db = MemoryDatabase::new().with_available("vector", Version::new(0, 7, 0));
        let outcome = status(&orchestrator(), &mut db.connect(), OutputFormat::Text)
            .await
            .unwrap();

        assert!(outcome.success);
        assert!(outcome.output.contains("unmet: vector >= 0.5.0 is not installed"));
        assert!(db.ledger().is_empty());
        assert_eq!(db.activations(), 0);
    }

    #[tokio::test]
    async fn status_fails_when_offline() {
        let db = MemoryDatabase::new();
        db.set_offline(true);
        let result = status(&orchestrator(), &mut db.connect(), OutputFormat::Text).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn rollback_reverts_above_target() {
        let db = MemoryDatabase::new().with_available("vector", Version::new(0, 7, 0));
        let orchestrator = orchestrator();
        let mut conn = db.connect();
        assert!(migrate(&orchestrator, &mut conn, OutputFormat::Text).await.unwrap().success);

        let outcome = rollback(&orchestrator, &mut conn, StepId::new(1), OutputFormat::Json)
            .await
            .unwrap();

        assert!(outcome.success);
        let json: serde_json::Value = serde_json::from_str(&outcome.output).unwrap();
        assert_eq!(json["reverted"], serde_json::json!([2]));
        assert_eq!(db.ledger(), vec![StepId::new(1)]);
    }

    #[test]
    fn plan_renders_json() {
        let outcome = plan(&orchestrator(), OutputFormat::Json).unwrap();
        let json: serde_json::Value = serde_json::from_str(&outcome.output).unwrap();
        assert_eq!(json["steps"][1]["requires"], serde_json::json!(["vector"]));
    }
}
