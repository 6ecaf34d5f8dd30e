//! Ledger row models.

use diesel::prelude::*;
use jiff_diesel::Timestamp;
use pgforge_core::plan::StepId;
use pgforge_core::store::LedgerEntry;

use crate::schema::pgforge_ledger;

/// A recorded migration step.
#[derive(Debug, Clone, PartialEq, Queryable, Selectable)]
#[diesel(table_name = pgforge_ledger)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct LedgerRow {
    pub step_id: i32,
    pub description: String,
    pub applied_at: Timestamp,
}

/// Data inserted when a step is recorded.
#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = pgforge_ledger)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct NewLedgerRow<'a> {
    pub step_id: i32,
    pub description: &'a str,
}

impl LedgerRow {
    /// Converts the row, rejecting step ids no plan can declare.
    pub fn into_entry(self) -> pgforge_core::Result<LedgerEntry> {
        let step_id = u32::try_from(self.step_id).map_err(|_| {
            pgforge_core::Error::ProbeParse(format!(
                "ledger contains invalid step id {}",
                self.step_id
            ))
        })?;

        Ok(LedgerEntry {
            step_id: StepId::new(step_id),
            description: self.description,
            applied_at: self.applied_at.into(),
        })
    }
}
