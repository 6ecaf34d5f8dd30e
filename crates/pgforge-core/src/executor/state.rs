//! Per-step execution states.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::capability::CapabilityName;
use crate::plan::{MigrationStep, StepId};

/// Why a step was skipped for this run.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockReason {
    /// Required capabilities that are not active.
    pub capabilities: Vec<CapabilityName>,
    /// Structural predecessors that were not applied.
    pub predecessors: Vec<StepId>,
}

impl BlockReason {
    /// Returns whether nothing blocks the step.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.capabilities.is_empty() && self.predecessors.is_empty()
    }
}

/// Lifecycle of a step within one run.
///
/// `Pending → Eligible → Applied`, `Pending → Blocked`, `Eligible → Failed`.
/// Steps found in the ledger end in `AlreadyApplied` once their
/// postconditions are re-validated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum StepState {
    /// Not evaluated this run.
    Pending,
    /// Dependencies satisfied and not yet recorded.
    Eligible,
    /// Forward action ran and the ledger was updated in this run.
    Applied,
    /// Recorded in the ledger before this run, postconditions still hold.
    AlreadyApplied,
    /// Skipped this run, re-evaluated on the next one.
    Blocked(BlockReason),
    /// Forward action raised an error.
    Failed { message: String },
}

impl StepState {
    /// Returns whether the step's effect is present after this run.
    #[inline]
    pub fn is_done(&self) -> bool {
        matches!(self, Self::Applied | Self::AlreadyApplied)
    }

    /// Returns whether the step was blocked.
    #[inline]
    pub fn is_blocked(&self) -> bool {
        matches!(self, Self::Blocked(_))
    }
}

/// Outcome of one step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepReport {
    pub id: StepId,
    pub description: String,
    #[serde(flatten)]
    pub state: StepState,
    /// Time spent applying the step, when it ran.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<Duration>,
}

impl StepReport {
    pub(crate) fn new(step: &MigrationStep, state: StepState) -> Self {
        Self {
            id: step.id,
            description: step.description.clone(),
            state,
            duration: None,
        }
    }

    pub(crate) fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }
}
