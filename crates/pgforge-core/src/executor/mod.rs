//! Capability-gated migration execution.
//!
//! The [`MigrationExecutor`] walks a [`MigrationPlan`] strictly in declared
//! order. For every step it decides between skipping (already applied),
//! blocking (missing capability or unapplied predecessor) and applying, and it
//! holds the step's advisory lock only around "check ledger → apply → record".
//!
//! ## Ledger policy
//!
//! The ledger is authoritative, but never trusted blindly:
//!
//! - steps recorded as applied have their postconditions re-validated,
//! - steps not recorded whose postconditions already hold are reported as
//!   [`Error::LedgerDivergence`] instead of being re-applied.

mod lock;
mod state;

use std::collections::BTreeSet;
use std::time::Instant;

use lock::acquire_step_lock;
pub use lock::{ExecutorConfig, LockPolicy};
use serde::Serialize;
pub use state::{BlockReason, StepReport, StepState};
use tokio_util::sync::CancellationToken;

use crate::capability::CapabilitySet;
use crate::plan::{MigrationPlan, MigrationStep, StepId};
use crate::store::LedgerStore;
use crate::{Error, Result, TRACING_TARGET_EXECUTOR};

/// Result of walking the plan once.
#[derive(Debug, Default)]
pub struct ExecutionSummary {
    /// One report per plan step, in plan order.
    pub steps: Vec<StepReport>,
    /// The error that halted the run, if any.
    pub halted: Option<Error>,
    /// Whether cancellation stopped the run between two steps.
    pub cancelled: bool,
}

impl ExecutionSummary {
    /// Number of steps applied in this run.
    pub fn applied(&self) -> usize {
        self.count(|state| matches!(state, StepState::Applied))
    }

    /// Number of steps found already applied.
    pub fn already_applied(&self) -> usize {
        self.count(|state| matches!(state, StepState::AlreadyApplied))
    }

    /// Number of blocked steps.
    pub fn blocked(&self) -> usize {
        self.count(StepState::is_blocked)
    }

    /// Returns whether every step ended applied or already applied.
    pub fn is_complete(&self) -> bool {
        self.halted.is_none() && !self.cancelled && self.steps.iter().all(|s| s.state.is_done())
    }

    fn count(&self, predicate: impl Fn(&StepState) -> bool) -> usize {
        self.steps.iter().filter(|s| predicate(&s.state)).count()
    }
}

/// Result of an explicit rollback.
#[derive(Debug, Default, Serialize)]
pub struct RollbackSummary {
    /// Steps reversed and removed from the ledger, newest first.
    pub reverted: Vec<StepId>,
    /// The error that stopped the rollback, if any.
    #[serde(skip)]
    pub halted: Option<Error>,
    /// Whether cancellation stopped the rollback between two steps.
    pub cancelled: bool,
}

/// A halting error, with the step's report when the step itself completed.
struct StepHalt {
    report: Option<StepReport>,
    error: Error,
}

impl From<Error> for StepHalt {
    fn from(error: Error) -> Self {
        Self {
            report: None,
            error,
        }
    }
}

/// Applies a migration plan against a ledger-backed connection.
#[derive(Debug, Clone)]
pub struct MigrationExecutor<'a> {
    plan: &'a MigrationPlan,
    lock_policy: LockPolicy,
}

impl<'a> MigrationExecutor<'a> {
    /// Creates an executor for the given plan.
    pub fn new(plan: &'a MigrationPlan, lock_policy: LockPolicy) -> Self {
        Self { plan, lock_policy }
    }

    /// Walks the plan once, applying every eligible step.
    ///
    /// Never returns early with an error: a halting error is stored in
    /// [`ExecutionSummary::halted`] together with the reports of the steps
    /// processed before it. Remaining steps are reported as
    /// [`StepState::Pending`].
    #[tracing::instrument(skip_all, target = TRACING_TARGET_EXECUTOR, fields(steps = self.plan.len()))]
    pub async fn run<C>(
        &self,
        conn: &mut C,
        capabilities: &CapabilitySet,
        cancel: &CancellationToken,
    ) -> ExecutionSummary
    where
        C: LedgerStore + Send,
    {
        let mut summary = ExecutionSummary::default();

        let recorded = match self.recorded_steps(conn).await {
            Ok(recorded) => recorded,
            Err(err) => {
                summary.halted = Some(err);
                summary.steps = self.pending_from(0);
                return summary;
            }
        };

        let mut done = BTreeSet::new();
        for (index, step) in self.plan.steps().iter().enumerate() {
            if cancel.is_cancelled() {
                tracing::info!(
                    target: TRACING_TARGET_EXECUTOR,
                    step = %step.id,
                    "Cancellation requested, stopping before step"
                );
                summary.cancelled = true;
                summary.steps.extend(self.pending_from(index));
                break;
            }

            match self.run_step(conn, step, &recorded, &done, capabilities).await {
                Ok(report) => {
                    if report.state.is_done() {
                        done.insert(step.id);
                    }
                    summary.steps.push(report);
                }
                Err(StepHalt { report, error: err }) => {
                    let report = report.unwrap_or_else(|| {
                        let state = match &err {
                            Error::StepFailed { message, .. } => StepState::Failed {
                                message: message.clone(),
                            },
                            _ => StepState::Pending,
                        };
                        StepReport::new(step, state)
                    });
                    tracing::error!(
                        target: TRACING_TARGET_EXECUTOR,
                        step = %step.id,
                        error = %err,
                        "Migration run halted"
                    );

                    summary.steps.push(report);
                    summary.steps.extend(self.pending_from(index + 1));
                    summary.halted = Some(err);
                    break;
                }
            }
        }

        tracing::info!(
            target: TRACING_TARGET_EXECUTOR,
            applied = summary.applied(),
            already_applied = summary.already_applied(),
            blocked = summary.blocked(),
            halted = summary.halted.is_some(),
            cancelled = summary.cancelled,
            "Migration run finished"
        );

        summary
    }

    /// Computes the state of every step without taking locks or writing.
    ///
    /// Recorded steps are reported as applied without postcondition checks,
    /// steps that a run would apply are reported as [`StepState::Eligible`].
    #[tracing::instrument(skip_all, target = TRACING_TARGET_EXECUTOR)]
    pub async fn status<C>(&self, conn: &mut C, capabilities: &CapabilitySet) -> Result<Vec<StepReport>>
    where
        C: LedgerStore + Send,
    {
        let recorded: BTreeSet<StepId> = conn
            .ledger_entries()
            .await?
            .into_iter()
            .map(|entry| entry.step_id)
            .collect();

        let mut reachable = BTreeSet::new();
        let reports = self
            .plan
            .steps()
            .iter()
            .map(|step| {
                let state = if recorded.contains(&step.id) {
                    StepState::AlreadyApplied
                } else {
                    let reason = block_reason(step, &reachable, capabilities);
                    if reason.is_empty() {
                        StepState::Eligible
                    } else {
                        StepState::Blocked(reason)
                    }
                };

                if matches!(state, StepState::AlreadyApplied | StepState::Eligible) {
                    reachable.insert(step.id);
                }
                StepReport::new(step, state)
            })
            .collect();

        Ok(reports)
    }

    /// Reverses every applied step with an id greater than `target`.
    ///
    /// Steps are reversed newest first, each under its advisory lock, and
    /// removed from the ledger. Every step to reverse must declare a reverse
    /// action; this is checked before anything is changed.
    #[tracing::instrument(skip_all, target = TRACING_TARGET_EXECUTOR, fields(rollback_to = %target))]
    pub async fn rollback<C>(
        &self,
        conn: &mut C,
        target: StepId,
        cancel: &CancellationToken,
    ) -> RollbackSummary
    where
        C: LedgerStore + Send,
    {
        let mut summary = RollbackSummary::default();

        let to_revert = match self.rollback_targets(conn, target).await {
            Ok(steps) => steps,
            Err(err) => {
                summary.halted = Some(err);
                return summary;
            }
        };

        tracing::info!(
            target: TRACING_TARGET_EXECUTOR,
            count = to_revert.len(),
            "Rolling back applied steps"
        );

        for step in to_revert {
            if cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }

            match self.revert_locked(conn, step).await {
                Ok(true) => summary.reverted.push(step.id),
                Ok(false) => {}
                Err(err) => {
                    tracing::error!(
                        target: TRACING_TARGET_EXECUTOR,
                        step = %step.id,
                        error = %err,
                        "Rollback halted"
                    );
                    summary.halted = Some(err);
                    break;
                }
            }
        }

        summary
    }

    async fn recorded_steps<C>(&self, conn: &mut C) -> Result<BTreeSet<StepId>>
    where
        C: LedgerStore + Send,
    {
        conn.ensure_ledger().await?;
        let entries = conn.ledger_entries().await?;

        tracing::debug!(
            target: TRACING_TARGET_EXECUTOR,
            recorded = entries.len(),
            "Loaded applied-state ledger"
        );

        Ok(entries.into_iter().map(|entry| entry.step_id).collect())
    }

    async fn run_step<C>(
        &self,
        conn: &mut C,
        step: &MigrationStep,
        recorded: &BTreeSet<StepId>,
        done: &BTreeSet<StepId>,
        capabilities: &CapabilitySet,
    ) -> Result<StepReport, StepHalt>
    where
        C: LedgerStore + Send,
    {
        if recorded.contains(&step.id) {
            validate_applied(conn, step).await?;
            return Ok(StepReport::new(step, StepState::AlreadyApplied));
        }

        let reason = block_reason(step, done, capabilities);
        if !reason.is_empty() {
            tracing::info!(
                target: TRACING_TARGET_EXECUTOR,
                step = %step.id,
                capabilities = ?reason.capabilities,
                predecessors = ?reason.predecessors,
                "Step blocked"
            );
            return Ok(StepReport::new(step, StepState::Blocked(reason)));
        }

        let start = Instant::now();
        acquire_step_lock(conn, step.id, &self.lock_policy).await?;
        let result = apply_locked(conn, step).await;
        let released = conn.unlock_step(step.id).await;

        let report = StepReport::new(step, result?).with_duration(start.elapsed());
        match released {
            Ok(()) => Ok(report),
            Err(error) => Err(StepHalt {
                report: Some(report),
                error,
            }),
        }
    }

    async fn rollback_targets<C>(&self, conn: &mut C, target: StepId) -> Result<Vec<&'a MigrationStep>>
    where
        C: LedgerStore + Send,
    {
        let mut recorded: Vec<StepId> = conn
            .ledger_entries()
            .await?
            .into_iter()
            .map(|entry| entry.step_id)
            .filter(|id| *id > target)
            .collect();
        recorded.sort_unstable_by(|a, b| b.cmp(a));

        let mut steps = Vec::with_capacity(recorded.len());
        for step_id in recorded {
            let step = self.plan.get(step_id).ok_or_else(|| {
                Error::InvalidPlan(format!(
                    "ledger records step {step_id} which the plan does not declare"
                ))
            })?;

            if !step.is_reversible() {
                return Err(Error::Irreversible { step: step.id });
            }
            steps.push(step);
        }

        Ok(steps)
    }

    async fn revert_locked<C>(&self, conn: &mut C, step: &MigrationStep) -> Result<bool>
    where
        C: LedgerStore + Send,
    {
        acquire_step_lock(conn, step.id, &self.lock_policy).await?;

        let result = revert_recorded(conn, step).await;
        let released = conn.unlock_step(step.id).await;

        let reverted = result?;
        released?;

        if reverted {
            tracing::info!(
                target: TRACING_TARGET_EXECUTOR,
                step = %step.id,
                description = %step.description,
                "Step reverted"
            );
        }
        Ok(reverted)
    }

    fn pending_from(&self, index: usize) -> Vec<StepReport> {
        self.plan.steps()[index..]
            .iter()
            .map(|step| StepReport::new(step, StepState::Pending))
            .collect()
    }
}

/// Collects what prevents `step` from running given the steps already done.
fn block_reason(
    step: &MigrationStep,
    done: &BTreeSet<StepId>,
    capabilities: &CapabilitySet,
) -> BlockReason {
    BlockReason {
        capabilities: capabilities.inactive_of(&step.requires),
        predecessors: step
            .after
            .iter()
            .filter(|id| !done.contains(*id))
            .copied()
            .collect(),
    }
}

/// Applies a step while its lock is held.
async fn apply_locked<C>(conn: &mut C, step: &MigrationStep) -> Result<StepState>
where
    C: LedgerStore + Send,
{
    // Another run may have applied the step while we were waiting.
    if conn.is_recorded(step.id).await? {
        validate_applied(conn, step).await?;
        tracing::debug!(
            target: TRACING_TARGET_EXECUTOR,
            step = %step.id,
            "Step applied concurrently by another run"
        );
        return Ok(StepState::AlreadyApplied);
    }

    for postcondition in &step.postconditions {
        if conn.check_postcondition(postcondition).await? {
            return Err(Error::LedgerDivergence {
                step: step.id,
                detail: format!("{postcondition} but the ledger has no record of the step"),
            });
        }
    }

    tracing::debug!(
        target: TRACING_TARGET_EXECUTOR,
        step = %step.id,
        atomic = step.atomic,
        "Applying step"
    );
    conn.apply_step(step).await?;

    tracing::info!(
        target: TRACING_TARGET_EXECUTOR,
        step = %step.id,
        description = %step.description,
        "Step applied"
    );
    Ok(StepState::Applied)
}

/// Reverts a step if the ledger still records it.
async fn revert_recorded<C>(conn: &mut C, step: &MigrationStep) -> Result<bool>
where
    C: LedgerStore + Send,
{
    if !conn.is_recorded(step.id).await? {
        return Ok(false);
    }
    conn.revert_step(step).await?;
    Ok(true)
}

/// Re-validates the postconditions of a recorded step.
async fn validate_applied<C>(conn: &mut C, step: &MigrationStep) -> Result<()>
where
    C: LedgerStore + Send,
{
    for postcondition in &step.postconditions {
        if !conn.check_postcondition(postcondition).await? {
            return Err(Error::LedgerDivergence {
                step: step.id,
                detail: format!("recorded as applied but expected {postcondition}"),
            });
        }
    }
    Ok(())
}
