//! Error taxonomy for capability provisioning and migration execution.

use std::time::Duration;

use semver::Version;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, IntoStaticStr};

use crate::capability::CapabilityName;
use crate::plan::StepId;

/// Type alias for boxed dynamic errors that can be sent across threads.
pub type BoxedError = Box<dyn std::error::Error + Send + Sync>;

/// Specialized [`Result`] type for orchestration operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Categories of errors that can abort an orchestration run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[derive(Serialize, Deserialize, AsRefStr, IntoStaticStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    /// The connection could not execute a query.
    Connectivity,
    /// Introspection results could not be decoded.
    ProbeParse,
    /// The database refused to enable or update an extension.
    ActivationDenied,
    /// A required capability is still missing after activation.
    RequirementUnmet,
    /// The ledger disagrees with the actual schema.
    LedgerDivergence,
    /// A step lock could not be acquired within the bounded wait.
    LockTimeout,
    /// A forward or reverse action raised an error.
    StepFailed,
    /// Rollback reached a step without a reverse action.
    Irreversible,
    /// The migration plan is malformed.
    InvalidPlan,
    /// A configuration value is out of range or malformed.
    Configuration,
}

/// Errors raised by probes, activation, the executor and the orchestrator.
#[derive(Debug, thiserror::Error)]
#[must_use = "orchestration errors should be handled appropriately"]
pub enum Error {
    /// The connection could not execute a query.
    ///
    /// Transient: the whole run may be retried later.
    #[error("Database connectivity error: {message}")]
    Connectivity {
        message: String,
        #[source]
        source: Option<BoxedError>,
    },

    /// Capability introspection returned rows of an unexpected shape.
    ///
    /// Signals version skew of the introspection query itself and is never retried.
    #[error("Failed to decode capability probe result: {0}")]
    ProbeParse(String),

    /// The database refused to activate a capability.
    #[error("Activation of capability '{capability}' denied: {reason}")]
    ActivationDenied {
        capability: CapabilityName,
        reason: String,
    },

    /// A required capability is missing or under-versioned after activation.
    #[error(
        "Capability '{capability}' requires version >= {required}, found {}",
        found.as_ref().map_or_else(|| "none".to_owned(), Version::to_string)
    )]
    RequirementUnmet {
        capability: CapabilityName,
        required: Version,
        found: Option<Version>,
    },

    /// The ledger and the actual schema disagree about a step.
    #[error("Ledger divergence at step {step}: {detail}")]
    LedgerDivergence { step: StepId, detail: String },

    /// The advisory lock for a step could not be acquired in time.
    #[error("Timed out after {waited:?} waiting for the lock of step {step}")]
    LockTimeout { step: StepId, waited: Duration },

    /// A step action raised a database error.
    #[error("Migration step {step} failed: {message}")]
    StepFailed { step: StepId, message: String },

    /// Rollback needs a reverse action the step does not declare.
    #[error("Migration step {step} has no reverse action")]
    Irreversible { step: StepId },

    /// The migration plan violates its ordering rules.
    #[error("Invalid migration plan: {0}")]
    InvalidPlan(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Creates a connectivity error from any source error.
    pub fn connectivity(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Connectivity {
            message: source.to_string(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a connectivity error from a plain message.
    pub fn connectivity_msg(message: impl Into<String>) -> Self {
        Self::Connectivity {
            message: message.into(),
            source: None,
        }
    }

    /// Returns the error kind.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Connectivity { .. } => ErrorKind::Connectivity,
            Self::ProbeParse(_) => ErrorKind::ProbeParse,
            Self::ActivationDenied { .. } => ErrorKind::ActivationDenied,
            Self::RequirementUnmet { .. } => ErrorKind::RequirementUnmet,
            Self::LedgerDivergence { .. } => ErrorKind::LedgerDivergence,
            Self::LockTimeout { .. } => ErrorKind::LockTimeout,
            Self::StepFailed { .. } => ErrorKind::StepFailed,
            Self::Irreversible { .. } => ErrorKind::Irreversible,
            Self::InvalidPlan(_) => ErrorKind::InvalidPlan,
            Self::Config(_) => ErrorKind::Configuration,
        }
    }

    /// Returns the error kind as a string.
    pub fn kind_str(&self) -> &'static str {
        self.kind().into()
    }

    /// Returns the step this error is attributed to, if any.
    pub fn step(&self) -> Option<StepId> {
        match self {
            Self::LedgerDivergence { step, .. }
            | Self::LockTimeout { step, .. }
            | Self::StepFailed { step, .. }
            | Self::Irreversible { step } => Some(*step),
            _ => None,
        }
    }

    /// Returns the capability this error is attributed to, if any.
    pub fn capability(&self) -> Option<&CapabilityName> {
        match self {
            Self::ActivationDenied { capability, .. }
            | Self::RequirementUnmet { capability, .. } => Some(capability),
            _ => None,
        }
    }

    /// Returns whether retrying the whole run later might succeed.
    ///
    /// Only connectivity failures and lock timeouts are transient, every other
    /// error needs operator attention.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connectivity { .. } | Self::LockTimeout { .. })
    }

    /// Returns whether this error is fatal for the run.
    pub fn is_permanent(&self) -> bool {
        !self.is_transient()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        let timeout = Error::LockTimeout {
            step: StepId::new(5),
            waited: Duration::from_secs(1),
        };
        assert!(timeout.is_transient());
        assert_eq!(timeout.step(), Some(StepId::new(5)));

        let denied = Error::ActivationDenied {
            capability: CapabilityName::vector(),
            reason: "permission denied".into(),
        };
        assert!(denied.is_permanent());
        assert_eq!(denied.capability(), Some(&CapabilityName::vector()));
        assert_eq!(denied.kind_str(), "activation_denied");
    }

    #[test]
    fn requirement_unmet_message() {
        let err = Error::RequirementUnmet {
            capability: CapabilityName::spatial(),
            required: Version::new(3, 0, 0),
            found: None,
        };
        assert_eq!(
            err.to_string(),
            "Capability 'postgis' requires version >= 3.0.0, found none"
        );
    }
}
