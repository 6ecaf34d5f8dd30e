#![forbid(unsafe_code)]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![doc = include_str!("../README.md")]

/// Tracing target for pool construction and the connectivity check.
pub const TRACING_TARGET_CLIENT: &str = "pgforge_postgres::client";

/// Tracing target for opening and checking out sessions.
pub const TRACING_TARGET_CONNECTION: &str = "pgforge_postgres::connection";

/// Tracing target for extension probes and activation.
pub const TRACING_TARGET_EXTENSION: &str = "pgforge_postgres::extension";

/// Tracing target for the applied-state ledger, step locks and step actions.
pub const TRACING_TARGET_LEDGER: &str = "pgforge_postgres::ledger";

pub mod catalog;
mod client;
mod error;
mod model;
mod schema;
mod store;

pub use diesel_async::AsyncPgConnection as PgConnection;

pub use crate::client::{ConnectionPool, PgClient, PgConfig, PgConn, PooledConnection};
pub use crate::error::{PgError, PgResult};
pub use crate::store::{ACTIVATION_LOCK_CLASS, LEDGER_LOCK_CLASS, LEDGER_TABLE};
