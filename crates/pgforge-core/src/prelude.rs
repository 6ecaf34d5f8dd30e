//! Convenient re-exports for common use.

pub use crate::capability::{
    BackendSelection, Capability, CapabilityName, CapabilitySet, ExtensionFlags, RequirementSet,
    select_backend,
};
pub use crate::error::{Error, ErrorKind, Result};
pub use crate::executor::{ExecutorConfig, LockPolicy, StepReport, StepState};
pub use crate::orchestrator::{Orchestrator, StatusReport};
pub use crate::plan::{MigrationPlan, MigrationStep, Postcondition, StepId};
pub use crate::report::{Failure, OrchestrationReport};
pub use crate::store::{CapabilityStore, LedgerEntry, LedgerStore};
