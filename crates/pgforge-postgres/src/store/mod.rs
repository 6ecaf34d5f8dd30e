//! [`CapabilityStore`] and [`LedgerStore`] implementations for [`PgConnection`].
//!
//! Extension activation and step execution are serialized across processes
//! with advisory locks. Every lock uses the two-key form, the first key being
//! one of the class constants below, so pgforge never collides with
//! application locks taken with a single 64-bit key.
//!
//! [`CapabilityStore`]: pgforge_core::store::CapabilityStore
//! [`LedgerStore`]: pgforge_core::store::LedgerStore
//! [`PgConnection`]: crate::PgConnection

mod capability;
mod ledger;

use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel::sql_types::Bool;
use pgforge_core::plan::StepId;
use pgforge_core::{Error, Result};

/// Advisory lock class for extension activation, keyed by `hashtext(name)`.
pub const ACTIVATION_LOCK_CLASS: i32 = 0x7067_6601;

/// Advisory lock class for migration steps, keyed by step id.
pub const LEDGER_LOCK_CLASS: i32 = 0x7067_6602;

/// Name of the applied-state ledger table.
pub const LEDGER_TABLE: &str = "pgforge_ledger";

/// Single boolean result of an existence check.
#[derive(diesel::QueryableByName)]
struct Holds {
    #[diesel(sql_type = Bool)]
    holds: bool,
}

/// Quotes an SQL identifier.
fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Converts a step id into the integer key used by the ledger and its locks.
fn step_key(step: StepId) -> Result<i32> {
    i32::try_from(step.get())
        .map_err(|_| Error::InvalidPlan(format!("step id {step} exceeds the ledger key range")))
}

/// Returns whether the error means the session is gone rather than the
/// statement being rejected.
fn is_connection_loss(error: &DieselError) -> bool {
    matches!(
        error,
        DieselError::DatabaseError(
            DatabaseErrorKind::ClosedConnection | DatabaseErrorKind::UnableToSendCommand,
            _
        ) | DieselError::BrokenTransactionManager
    )
}
