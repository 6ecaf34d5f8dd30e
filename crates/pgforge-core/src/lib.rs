#![forbid(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![doc = include_str!("../README.md")]

// Tracing target constants for consistent logging.

/// Tracing target for capability probes and activation.
pub const TRACING_TARGET_PROBE: &str = "pgforge_core::probe";

/// Tracing target for migration step execution and rollback.
pub const TRACING_TARGET_EXECUTOR: &str = "pgforge_core::executor";

/// Tracing target for orchestration runs.
pub const TRACING_TARGET_ORCHESTRATOR: &str = "pgforge_core::orchestrator";

mod error;
mod orchestrator;
mod report;

pub mod capability;
pub mod executor;
pub mod plan;
pub mod prelude;
pub mod store;

#[cfg(any(test, feature = "test-utils"))]
#[cfg_attr(docsrs, doc(cfg(feature = "test-utils")))]
pub mod mock;

pub use error::{BoxedError, Error, ErrorKind, Result};
pub use orchestrator::{Orchestrator, StatusReport};
pub use report::{Failure, OrchestrationReport};
