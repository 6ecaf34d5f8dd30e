//! Client-level errors.
//!
//! Failures of individual probes, activations and migration steps are
//! reported through [`pgforge_core::Error`] directly. [`PgError`] covers the
//! pool and session plumbing around them and converts into
//! [`pgforge_core::Error`] at the boundary.

use deadpool::managed::TimeoutType;
use diesel::ConnectionError;
use diesel_async::pooled_connection::PoolError as ManagerError;
use diesel_async::pooled_connection::deadpool::PoolError;

use crate::TRACING_TARGET_CONNECTION;

/// Pool, session and configuration failures.
#[derive(Debug, thiserror::Error)]
#[must_use = "database errors should be handled appropriately"]
pub enum PgError {
    /// A setting is missing or out of range.
    #[error("invalid database configuration: {0}")]
    Config(String),

    /// The pool could not hand out a session in time.
    #[error("timed out waiting for a database session ({})", timeout_hint(*.0))]
    Timeout(TimeoutType),

    /// A session could not be opened or was lost.
    #[error("database connection failed: {0}")]
    Connection(#[from] ConnectionError),

    /// A session-level statement failed.
    #[error("database query failed: {0}")]
    Query(#[from] diesel::result::Error),

    /// The pool itself misbehaved.
    #[error("connection pool error: {0}")]
    Pool(String),
}

impl PgError {
    /// Returns whether retrying later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_) | Self::Connection(ConnectionError::BadConnection(_))
        )
    }
}

fn timeout_hint(timeout: TimeoutType) -> &'static str {
    match timeout {
        TimeoutType::Wait => "pool exhausted, another run may be holding its sessions",
        TimeoutType::Create => "server unreachable, check the URL and that the database is up",
        TimeoutType::Recycle => "an idle session could not be reset",
    }
}

impl From<PoolError> for PgError {
    fn from(error: PoolError) -> Self {
        match error {
            PoolError::Timeout(timeout) => Self::Timeout(timeout),
            PoolError::Backend(ManagerError::ConnectionError(e)) => Self::Connection(e),
            PoolError::Backend(ManagerError::QueryError(e)) => Self::Query(e),
            PoolError::Closed => Self::Pool("pool is closed".into()),
            PoolError::NoRuntimeSpecified => Self::Pool("no async runtime configured".into()),
            PoolError::PostCreateHook(e) => {
                tracing::warn!(
                    target: TRACING_TARGET_CONNECTION,
                    error = %e,
                    "Session rejected by post-create hook"
                );
                Self::Pool(e.to_string())
            }
        }
    }
}

impl From<PgError> for pgforge_core::Error {
    fn from(error: PgError) -> Self {
        match error {
            PgError::Config(message) => Self::Config(message),
            other => Self::connectivity(other),
        }
    }
}

/// Result alias for client operations.
pub type PgResult<T, E = PgError> = Result<T, E>;
