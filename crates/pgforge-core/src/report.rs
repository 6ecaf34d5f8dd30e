//! Structured outcome of an orchestration run.

use std::time::Duration;

use serde::Serialize;

use crate::capability::{BackendSelection, CapabilityName, CapabilitySet};
use crate::executor::{StepReport, StepState};
use crate::plan::StepId;
use crate::{Error, ErrorKind};

/// The error that aborted a run, flattened for display and serialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Failure {
    pub kind: ErrorKind,
    /// Offending step, if the error is attributed to one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<StepId>,
    /// Offending capability, if the error is attributed to one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capability: Option<CapabilityName>,
    pub message: String,
    /// Whether retrying the whole run later may succeed.
    pub retryable: bool,
}

impl From<&Error> for Failure {
    fn from(error: &Error) -> Self {
        Self {
            kind: error.kind(),
            step: error.step(),
            capability: error.capability().cloned(),
            message: error.to_string(),
            retryable: error.is_transient(),
        }
    }
}

/// Report returned by every orchestration run, successful or not.
#[derive(Debug, Clone, Default, Serialize)]
pub struct OrchestrationReport {
    /// Capability set after activation.
    pub capabilities: CapabilitySet,
    /// Backend selection; absent when the run halted before selection.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend: Option<BackendSelection>,
    /// Per-step outcome in plan order; empty if no migration was attempted.
    pub steps: Vec<StepReport>,
    /// Steps applied in this run.
    pub applied: usize,
    /// Steps blocked in this run.
    pub blocked: usize,
    /// Steps found already applied.
    pub already_applied: usize,
    /// The error that aborted the run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<Failure>,
    /// Whether the run stopped early on request.
    pub cancelled: bool,
    /// Wall-clock time of the run.
    pub duration: Duration,
}

impl OrchestrationReport {
    /// Returns whether the run finished without failure or cancellation.
    ///
    /// Blocked steps do not make a run unsuccessful.
    pub fn is_success(&self) -> bool {
        self.failure.is_none() && !self.cancelled
    }

    /// Returns whether the failure is transient.
    pub fn is_retryable(&self) -> bool {
        self.failure.as_ref().is_some_and(|f| f.retryable)
    }

    /// Returns the first failed step, if any.
    pub fn failed_step(&self) -> Option<&StepReport> {
        self.steps
            .iter()
            .find(|s| matches!(s.state, StepState::Failed { .. }))
    }

    /// Returns the ids of steps applied in this run.
    pub fn applied_steps(&self) -> Vec<StepId> {
        self.steps
            .iter()
            .filter(|s| matches!(s.state, StepState::Applied))
            .map(|s| s.id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::Capability;

    #[test]
    fn failure_from_error() {
        let failure = Failure::from(&Error::ActivationDenied {
            capability: CapabilityName::vector(),
            reason: "permission denied to create extension".into(),
        });
        assert_eq!(failure.kind, ErrorKind::ActivationDenied);
        assert_eq!(failure.capability, Some(CapabilityName::vector()));
        assert!(!failure.retryable);
    }

    #[test]
    fn report_serializes_without_empty_fields() {
        let report = OrchestrationReport {
            capabilities: [Capability::active("postgis", semver::Version::new(3, 4, 0))]
                .into_iter()
                .collect(),
            backend: Some(BackendSelection::SpatialAware),
            ..OrchestrationReport::default()
        };

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["backend"], "spatial-aware");
        assert_eq!(json["capabilities"]["postgis"]["version"], "3.4.0");
        assert!(json.get("failure").is_none());
        assert!(report.is_success());
    }
}
