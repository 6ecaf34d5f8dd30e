//! End-to-end provisioning run: probe, activate, select, migrate.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use serde::Serialize;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;

use crate::capability::{
    BackendSelection, CapabilityName, CapabilitySet, GapKind, RequirementGap, RequirementSet,
    select_backend,
};
use crate::executor::{LockPolicy, MigrationExecutor, RollbackSummary, StepReport};
use crate::plan::{MigrationPlan, StepId};
use crate::report::{Failure, OrchestrationReport};
use crate::store::{CapabilityStore, LedgerStore};
use crate::{Error, Result, TRACING_TARGET_ORCHESTRATOR, TRACING_TARGET_PROBE};

/// Serializes activation attempts per capability name within one process.
#[derive(Debug, Clone, Default)]
struct ActivationLocks {
    inner: Arc<Mutex<HashMap<CapabilityName, Arc<AsyncMutex<()>>>>>,
}

impl ActivationLocks {
    async fn acquire(&self, name: &CapabilityName) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            locks.entry(name.clone()).or_default().clone()
        };
        lock.lock_owned().await
    }
}

/// Read-only view of capabilities and per-step status.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    /// Capabilities currently active.
    pub capabilities: CapabilitySet,
    /// Requirements not satisfied by the active capabilities.
    pub gaps: Vec<RequirementGap>,
    /// Backend the configured requirements select.
    pub backend: BackendSelection,
    /// Per-step status in plan order.
    pub steps: Vec<StepReport>,
}

/// Drives one provisioning and migration run.
///
/// Cloning an orchestrator shares its activation locks and cancellation
/// token, so clones running on separate connections never race to enable the
/// same capability.
#[derive(Debug, Clone)]
pub struct Orchestrator {
    requirements: RequirementSet,
    plan: MigrationPlan,
    lock_policy: LockPolicy,
    cancel: CancellationToken,
    activation_locks: ActivationLocks,
}

impl Orchestrator {
    /// Creates an orchestrator for the given requirements and plan.
    pub fn new(requirements: RequirementSet, plan: MigrationPlan) -> Self {
        Self {
            requirements,
            plan,
            lock_policy: LockPolicy::default(),
            cancel: CancellationToken::new(),
            activation_locks: ActivationLocks::default(),
        }
    }

    /// Sets the bounded wait for per-step locks.
    pub fn with_lock_policy(mut self, lock_policy: LockPolicy) -> Self {
        self.lock_policy = lock_policy;
        self
    }

    /// Uses an external token to request cancellation between steps.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Returns the requirement set.
    #[inline]
    pub fn requirements(&self) -> &RequirementSet {
        &self.requirements
    }

    /// Returns the migration plan.
    #[inline]
    pub fn plan(&self) -> &MigrationPlan {
        &self.plan
    }

    /// Returns the backend the requirements select.
    pub fn backend(&self) -> BackendSelection {
        select_backend(&self.requirements)
    }

    /// Runs the full sequence and returns a report.
    ///
    /// Never fails: every error is captured in [`OrchestrationReport::failure`]
    /// together with everything known at the point it happened. A requirement
    /// that stays unmet after activation halts the run before a backend is
    /// selected or any migration is attempted.
    #[tracing::instrument(skip_all, target = TRACING_TARGET_ORCHESTRATOR)]
    pub async fn run<C>(&self, conn: &mut C) -> OrchestrationReport
    where
        C: CapabilityStore + LedgerStore + Send,
    {
        let start = Instant::now();
        let mut report = OrchestrationReport::default();

        tracing::info!(
            target: TRACING_TARGET_ORCHESTRATOR,
            requirements = self.requirements.len(),
            steps = self.plan.len(),
            "Starting orchestration run"
        );

        if let Err(err) = self.provision(conn, &mut report.capabilities).await {
            tracing::error!(
                target: TRACING_TARGET_ORCHESTRATOR,
                error = %err,
                kind = err.kind_str(),
                "Capability provisioning failed"
            );
            report.failure = Some(Failure::from(&err));
            report.duration = start.elapsed();
            return report;
        }

        let backend = select_backend(&self.requirements);
        tracing::info!(
            target: TRACING_TARGET_ORCHESTRATOR,
            backend = backend.as_str(),
            "Backend selected"
        );
        report.backend = Some(backend);

        let executor = MigrationExecutor::new(&self.plan, self.lock_policy);
        let summary = executor.run(conn, &report.capabilities, &self.cancel).await;

        report.applied = summary.applied();
        report.blocked = summary.blocked();
        report.already_applied = summary.already_applied();
        report.cancelled = summary.cancelled;
        report.failure = summary.halted.as_ref().map(Failure::from);
        report.steps = summary.steps;
        report.duration = start.elapsed();

        tracing::info!(
            target: TRACING_TARGET_ORCHESTRATOR,
            applied = report.applied,
            blocked = report.blocked,
            already_applied = report.already_applied,
            success = report.is_success(),
            duration = ?report.duration,
            "Orchestration run finished"
        );

        report
    }

    /// Probes capabilities and computes per-step status without writing.
    #[tracing::instrument(skip_all, target = TRACING_TARGET_ORCHESTRATOR)]
    pub async fn status<C>(&self, conn: &mut C) -> Result<StatusReport>
    where
        C: CapabilityStore + LedgerStore + Send,
    {
        let capabilities = conn.probe_capabilities().await?;
        let executor = MigrationExecutor::new(&self.plan, self.lock_policy);
        let steps = executor.status(conn, &capabilities).await?;

        Ok(StatusReport {
            gaps: self.requirements.diff(&capabilities),
            backend: self.backend(),
            capabilities,
            steps,
        })
    }

    /// Reverses applied steps with an id greater than `target`.
    pub async fn rollback<C>(&self, conn: &mut C, target: StepId) -> RollbackSummary
    where
        C: LedgerStore + Send,
    {
        let executor = MigrationExecutor::new(&self.plan, self.lock_policy);
        executor.rollback(conn, target, &self.cancel).await
    }

    /// Brings the capability set in line with the requirements.
    ///
    /// `capabilities` reflects the latest known state even when this fails.
    async fn provision<C>(&self, conn: &mut C, capabilities: &mut CapabilitySet) -> Result<()>
    where
        C: CapabilityStore + Send,
    {
        *capabilities = conn.probe_capabilities().await?;
        tracing::debug!(
            target: TRACING_TARGET_PROBE,
            active = capabilities.len(),
            "Probed active capabilities"
        );

        for gap in self.requirements.diff(capabilities) {
            let name = &gap.capability;
            let _guard = self.activation_locks.acquire(name).await;

            match &gap.gap {
                GapKind::Missing => {
                    tracing::info!(
                        target: TRACING_TARGET_ORCHESTRATOR,
                        capability = %name,
                        required = %gap.required,
                        "Activating capability"
                    );
                    conn.activate_capability(name).await?;
                }
                GapKind::UnderVersioned { found } => {
                    tracing::info!(
                        target: TRACING_TARGET_ORCHESTRATOR,
                        capability = %name,
                        required = %gap.required,
                        found = %found,
                        "Upgrading capability"
                    );
                    conn.upgrade_capability(name).await?;
                }
            }

            let probed = conn.probe_capability(name).await?;
            let found = probed.as_ref().map(|c| c.version.clone());
            match probed {
                Some(capability) if capability.satisfies(&gap.required) => {
                    tracing::info!(
                        target: TRACING_TARGET_PROBE,
                        capability = %capability,
                        "Capability confirmed"
                    );
                    capabilities.insert(capability);
                }
                probed => {
                    match probed {
                        Some(capability) => capabilities.insert(capability),
                        None => {
                            capabilities.remove(name);
                        }
                    }
                    return Err(Error::RequirementUnmet {
                        capability: name.clone(),
                        required: gap.required.clone(),
                        found,
                    });
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use semver::Version;

    use super::*;
    use crate::ErrorKind;
    use crate::executor::StepState;
    use crate::mock::MemoryDatabase;
    use crate::plan::{MigrationStep, Postcondition};

    fn fast_locks() -> LockPolicy {
        LockPolicy::new(Duration::from_secs(5), Duration::from_millis(1))
    }

    fn table_step(id: u32, table: &str) -> MigrationStep {
        MigrationStep::new(id, format!("create {table}"), format!("CREATE TABLE {table} (id int)"))
            .with_reverse(format!("DROP TABLE {table}"))
            .expects(Postcondition::table(table))
    }

    fn orchestrator(requirements: RequirementSet, steps: Vec<MigrationStep>) -> Orchestrator {
        Orchestrator::new(requirements, MigrationPlan::new(steps).unwrap())
            .with_lock_policy(fast_locks())
    }

    fn state_of(report: &OrchestrationReport, id: u32) -> &StepState {
        &report
            .steps
            .iter()
            .find(|s| s.id == StepId::new(id))
            .unwrap()
            .state
    }

    #[tokio::test]
    async fn activates_missing_spatial_capability() {
        let db = MemoryDatabase::new().with_available("postgis", Version::new(3, 4, 0));
        let requirements = RequirementSet::new().with("postgis", Version::new(3, 0, 0));
        let orchestrator = orchestrator(requirements, vec![
            table_step(1, "places").requires("postgis"),
        ]);

        let report = orchestrator.run(&mut db.connect()).await;

        assert!(report.is_success(), "{:?}", report.failure);
        assert_eq!(report.backend, Some(BackendSelection::SpatialAware));
        let postgis = report.capabilities.get(&CapabilityName::spatial()).unwrap();
        assert_eq!(postgis.version, Version::new(3, 4, 0));
        assert_eq!(report.applied, 1);
        assert_eq!(db.activations(), 1);
    }

    #[tokio::test]
    async fn denied_activation_halts_before_migrations() {
        let db = MemoryDatabase::new().with_denied("vector", "permission denied to create extension");
        let requirements = RequirementSet::new().with("vector", Version::new(1, 0, 0));
        let orchestrator = orchestrator(requirements, vec![table_step(1, "documents")]);

        let report = orchestrator.run(&mut db.connect()).await;

        let failure = report.failure.as_ref().unwrap();
        assert_eq!(failure.kind, ErrorKind::ActivationDenied);
        assert_eq!(failure.capability, Some(CapabilityName::vector()));
        assert!(!failure.retryable);
        assert!(report.steps.is_empty());
        assert!(report.backend.is_none());
        assert!(db.ledger().is_empty());
        assert_eq!(db.forward_runs(1), 0);
    }

    #[tokio::test]
    async fn requirement_unmet_after_activation() {
        let db = MemoryDatabase::new().with_available("postgis", Version::new(2, 5, 0));
        let requirements = RequirementSet::new().with("postgis", Version::new(3, 0, 0));
        let orchestrator = orchestrator(requirements, vec![table_step(1, "places")]);

        let report = orchestrator.run(&mut db.connect()).await;

        let failure = report.failure.unwrap();
        assert_eq!(failure.kind, ErrorKind::RequirementUnmet);
        assert!(failure.message.contains("found 2.5.0"));
        assert!(report.backend.is_none());
        assert!(report.steps.is_empty());
        assert!(report.capabilities.is_active(&CapabilityName::spatial()));
    }

    #[tokio::test]
    async fn upgrades_under_versioned_capability() {
        let db = MemoryDatabase::new()
            .with_installed("vector", Version::new(0, 4, 4))
            .with_available("vector", Version::new(0, 7, 0));
        let requirements = RequirementSet::new().with("vector", Version::new(0, 5, 0));
        let orchestrator = orchestrator(requirements, vec![]);

        let report = orchestrator.run(&mut db.connect()).await;

        assert!(report.is_success());
        assert_eq!(report.backend, Some(BackendSelection::Standard));
        let vector = report.capabilities.get(&CapabilityName::vector()).unwrap();
        assert_eq!(vector.version, Version::new(0, 7, 0));
    }

    #[tokio::test]
    async fn capability_and_predecessor_blocking() {
        let hypertable = MigrationStep::new(2, "convert readings", "SELECT create_hypertable('a', 'time')")
            .requires("timescaledb")
            .after(1)
            .expects(Postcondition::hypertable("a"));

        let independent = orchestrator(RequirementSet::new(), vec![
            table_step(1, "a"),
            hypertable.clone(),
            table_step(3, "b"),
        ]);
        let db = MemoryDatabase::new();
        let report = independent.run(&mut db.connect()).await;

        assert!(report.is_success());
        assert_eq!(state_of(&report, 1), &StepState::Applied);
        assert!(state_of(&report, 2).is_blocked());
        assert_eq!(state_of(&report, 3), &StepState::Applied);
        assert_eq!((report.applied, report.blocked), (2, 1));

        let dependent = orchestrator(RequirementSet::new(), vec![
            table_step(1, "a"),
            hypertable,
            table_step(3, "b").after(2),
        ]);
        let db = MemoryDatabase::new();
        let report = dependent.run(&mut db.connect()).await;

        match state_of(&report, 3) {
            StepState::Blocked(reason) => {
                assert!(reason.capabilities.is_empty());
                assert_eq!(reason.predecessors, vec![StepId::new(2)]);
            }
            other => panic!("step 3 should be blocked, got {other:?}"),
        }
        assert_eq!(db.ledger(), vec![StepId::new(1)]);
    }

    #[tokio::test]
    async fn concurrent_runs_apply_each_step_once() {
        let db = MemoryDatabase::new().with_apply_delay(Duration::from_millis(5));
        let steps = (1..=5).map(|id| table_step(id, &format!("t{id}"))).collect();
        let first = orchestrator(RequirementSet::new(), steps);
        let second = first.clone();

        let mut conn_a = db.connect();
        let mut conn_b = db.connect();
        let (a, b) = tokio::join!(first.run(&mut conn_a), second.run(&mut conn_b));

        assert!(a.is_success() && b.is_success());
        assert_eq!(a.applied + b.applied, 5);
        assert_eq!(a.applied + a.already_applied, 5);
        assert_eq!(b.applied + b.already_applied, 5);
        for id in 1..=5 {
            assert_eq!(db.forward_runs(id), 1, "step {id} ran more than once");
            assert!(!db.is_locked(id));
        }
    }

    #[tokio::test]
    async fn concurrent_activation_is_idempotent() {
        let db = MemoryDatabase::new().with_available("vector", Version::new(0, 7, 0));
        let requirements = RequirementSet::new().with("vector", Version::new(0, 5, 0));
        let first = orchestrator(requirements, vec![]);
        let second = first.clone();

        let mut conn_a = db.connect();
        let mut conn_b = db.connect();
        let (a, b) = tokio::join!(first.run(&mut conn_a), second.run(&mut conn_b));

        assert!(a.is_success() && b.is_success());
        assert_eq!(db.activations(), 1);
    }

    #[tokio::test]
    async fn second_run_is_idempotent() {
        let db = MemoryDatabase::new().with_available("vector", Version::new(0, 7, 0));
        let requirements = RequirementSet::new().with("vector", Version::new(0, 5, 0));
        let orchestrator = orchestrator(requirements, vec![
            table_step(1, "documents"),
            MigrationStep::new(2, "embedding", "ALTER TABLE documents ADD embedding vector(3)")
                .requires("vector")
                .after(1)
                .expects(Postcondition::column("documents", "embedding")),
        ]);

        let first = orchestrator.run(&mut db.connect()).await;
        let second = orchestrator.run(&mut db.connect()).await;

        assert_eq!(first.applied, 2);
        assert_eq!(second.applied, 0);
        assert_eq!(second.already_applied, 2);
        assert_eq!(first.capabilities, second.capabilities);
        assert_eq!(first.backend, second.backend);
        assert_eq!(db.forward_runs(2), 1);
    }

    #[tokio::test]
    async fn ledger_grows_and_dependents_follow_their_capability() {
        let db = MemoryDatabase::new().with_available("vector", Version::new(0, 7, 0));
        let steps = vec![
            table_step(1, "documents"),
            MigrationStep::new(2, "embedding", "ALTER TABLE documents ADD embedding vector(3)")
                .requires("vector")
                .after(1)
                .expects(Postcondition::column("documents", "embedding")),
            MigrationStep::new(3, "embedding index", "CREATE INDEX documents_embedding_idx ON documents USING hnsw (embedding vector_cosine_ops)")
                .after(2)
                .expects(Postcondition::index("documents_embedding_idx")),
        ];

        let without = orchestrator(RequirementSet::new(), steps.clone());
        let report = without.run(&mut db.connect()).await;
        assert_eq!(report.applied, 1);
        assert!(state_of(&report, 3).is_blocked());
        let before = db.ledger();

        let with = orchestrator(RequirementSet::new().with("vector", Version::new(0, 5, 0)), steps);
        let report = with.run(&mut db.connect()).await;
        assert_eq!(report.applied_steps(), vec![StepId::new(2), StepId::new(3)]);

        let after = db.ledger();
        assert!(after.len() >= before.len());
        assert!(before.iter().all(|id| after.contains(id)));
    }

    #[tokio::test]
    async fn never_activated_capability_stays_blocked() {
        let db = MemoryDatabase::new();
        let orchestrator = orchestrator(RequirementSet::new(), vec![
            table_step(1, "metric_data"),
            MigrationStep::new(2, "convert metrics", "SELECT create_hypertable('metric_data', 'timestamp')")
                .requires("timescaledb")
                .after(1)
                .expects(Postcondition::hypertable("metric_data")),
        ]);

        for _ in 0..3 {
            let report = orchestrator.run(&mut db.connect()).await;
            assert!(state_of(&report, 2).is_blocked());
        }
        assert_eq!(db.forward_runs(2), 0);
        assert_eq!(db.ledger(), vec![StepId::new(1)]);
    }

    #[tokio::test]
    async fn connectivity_failure_is_retryable() {
        let db = MemoryDatabase::new();
        db.set_offline(true);
        let orchestrator = orchestrator(RequirementSet::new(), vec![table_step(1, "a")]);

        let report = orchestrator.run(&mut db.connect()).await;

        assert!(report.is_retryable());
        assert_eq!(report.failure.unwrap().kind, ErrorKind::Connectivity);
        assert!(report.backend.is_none());
    }

    #[tokio::test]
    async fn probe_parse_failure_is_fatal() {
        let db = MemoryDatabase::new();
        db.set_corrupt_probe(true);
        let orchestrator = orchestrator(RequirementSet::new(), vec![table_step(1, "a")]);

        let report = orchestrator.run(&mut db.connect()).await;

        assert!(!report.is_success());
        assert!(!report.is_retryable());
        assert_eq!(report.failure.unwrap().kind, ErrorKind::ProbeParse);
    }

    #[tokio::test]
    async fn cancelled_run_attempts_no_steps() {
        let db = MemoryDatabase::new();
        let cancel = CancellationToken::new();
        let orchestrator =
            orchestrator(RequirementSet::new(), vec![table_step(1, "a"), table_step(2, "b")])
                .with_cancellation(cancel.clone());

        cancel.cancel();
        let report = orchestrator.run(&mut db.connect()).await;

        assert!(report.cancelled);
        assert!(!report.is_success());
        assert!(report.steps.iter().all(|s| s.state == StepState::Pending));
        assert!(db.ledger().is_empty());
    }

    #[tokio::test]
    async fn status_and_rollback() {
        let db = MemoryDatabase::new();
        let orchestrator = orchestrator(RequirementSet::new(), vec![
            table_step(1, "a"),
            table_step(2, "b"),
            table_step(3, "c").requires("vector"),
        ]);

        let mut conn = db.connect();
        let status = orchestrator.status(&mut conn).await.unwrap();
        assert_eq!(status.steps[0].state, StepState::Eligible);
        assert!(status.steps[2].state.is_blocked());
        assert!(db.ledger().is_empty());

        orchestrator.run(&mut conn).await;
        let status = orchestrator.status(&mut conn).await.unwrap();
        assert_eq!(status.steps[1].state, StepState::AlreadyApplied);

        let summary = orchestrator.rollback(&mut conn, StepId::new(0)).await;
        assert!(summary.halted.is_none());
        assert_eq!(summary.reverted, vec![StepId::new(2), StepId::new(1)]);
        assert!(conn.ledger_entries().await.unwrap().is_empty());
        assert!(!db.holds(&Postcondition::table("a")));
    }
}
