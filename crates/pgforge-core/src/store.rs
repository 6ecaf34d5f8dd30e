//! Storage seams used by the orchestrator and the migration executor.
//!
//! Implementations wrap one live database connection. Advisory locks taken
//! through [`LedgerStore::try_lock_step`] belong to that connection, so a
//! single handle must be used for the whole run.

use std::future::Future;

use jiff::Timestamp;
use serde::{Deserialize, Serialize};

use crate::Result;
use crate::capability::{Capability, CapabilityName, CapabilitySet};
use crate::plan::{MigrationStep, Postcondition, StepId};

/// A row of the applied-state ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Identifier of the applied step.
    pub step_id: StepId,
    /// Step description at the time it was applied.
    pub description: String,
    /// When the forward action was committed.
    pub applied_at: Timestamp,
}

/// Discovery and activation of database capabilities.
pub trait CapabilityStore {
    /// Returns every active capability.
    ///
    /// Must not mutate database state. Fails with [`Error::Connectivity`] when
    /// the query cannot run and [`Error::ProbeParse`] when rows cannot be
    /// decoded.
    ///
    /// [`Error::Connectivity`]: crate::Error::Connectivity
    /// [`Error::ProbeParse`]: crate::Error::ProbeParse
    fn probe_capabilities(&mut self) -> impl Future<Output = Result<CapabilitySet>> + Send;

    /// Returns a single capability if it is active.
    fn probe_capability(
        &mut self,
        name: &CapabilityName,
    ) -> impl Future<Output = Result<Option<Capability>>> + Send;

    /// Enables the capability if it is not already enabled.
    ///
    /// Succeeds without effect when the capability is active. Refusals are
    /// reported as [`Error::ActivationDenied`].
    ///
    /// [`Error::ActivationDenied`]: crate::Error::ActivationDenied
    fn activate_capability(
        &mut self,
        name: &CapabilityName,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Updates an active capability to the newest version available on the server.
    fn upgrade_capability(
        &mut self,
        name: &CapabilityName,
    ) -> impl Future<Output = Result<()>> + Send;
}

/// Durable applied-state ledger, per-step locks and schema introspection.
pub trait LedgerStore {
    /// Creates the ledger if it does not exist yet.
    fn ensure_ledger(&mut self) -> impl Future<Output = Result<()>> + Send;

    /// Returns all ledger entries ordered by step id.
    ///
    /// Returns an empty list when the ledger has not been created yet.
    fn ledger_entries(&mut self) -> impl Future<Output = Result<Vec<LedgerEntry>>> + Send;

    /// Returns whether the ledger records the step.
    fn is_recorded(&mut self, step: StepId) -> impl Future<Output = Result<bool>> + Send;

    /// Attempts to take the advisory lock of a step without waiting.
    fn try_lock_step(&mut self, step: StepId) -> impl Future<Output = Result<bool>> + Send;

    /// Releases the advisory lock of a step.
    fn unlock_step(&mut self, step: StepId) -> impl Future<Output = Result<()>> + Send;

    /// Evaluates a postcondition against the actual schema.
    fn check_postcondition(
        &mut self,
        postcondition: &Postcondition,
    ) -> impl Future<Output = Result<bool>> + Send;

    /// Runs the forward action and records the step.
    ///
    /// For atomic steps both happen in one transaction. Otherwise the ledger
    /// write immediately follows the action. Action errors are reported as
    /// [`Error::StepFailed`].
    ///
    /// [`Error::StepFailed`]: crate::Error::StepFailed
    fn apply_step(&mut self, step: &MigrationStep) -> impl Future<Output = Result<()>> + Send;

    /// Runs the reverse action and removes the step from the ledger.
    fn revert_step(&mut self, step: &MigrationStep) -> impl Future<Output = Result<()>> + Send;
}
