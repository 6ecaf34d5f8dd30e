use diesel::prelude::*;
use diesel::result::Error as DieselError;
use diesel::sql_types::{Integer, Text};
use diesel_async::scoped_futures::ScopedFutureExt;
use diesel_async::{AsyncConnection, RunQueryDsl, SimpleAsyncConnection};
use pgforge_core::plan::{MigrationStep, Postcondition, StepId};
use pgforge_core::store::{LedgerEntry, LedgerStore};
use pgforge_core::{Error, Result};

use super::{Holds, LEDGER_LOCK_CLASS, LEDGER_TABLE, is_connection_loss, step_key};
use crate::model::{LedgerRow, NewLedgerRow};
use crate::schema::pgforge_ledger;
use crate::{PgConnection, TRACING_TARGET_LEDGER};

const CREATE_LEDGER: &str = "CREATE TABLE IF NOT EXISTS pgforge_ledger (
    step_id     INTEGER PRIMARY KEY,
    description TEXT NOT NULL,
    applied_at  TIMESTAMPTZ NOT NULL DEFAULT now()
)";

/// Which half of a step transaction failed.
#[derive(Debug)]
enum StepError {
    /// The step's own SQL raised an error.
    Action(DieselError),
    /// Reading or writing the ledger failed.
    Ledger(DieselError),
}

impl From<DieselError> for StepError {
    fn from(error: DieselError) -> Self {
        Self::Ledger(error)
    }
}

impl StepError {
    fn into_error(self, step: StepId) -> Error {
        match self {
            Self::Action(error) if is_connection_loss(&error) => Error::connectivity(error),
            Self::Action(error) => Error::StepFailed {
                step,
                message: error.to_string(),
            },
            Self::Ledger(error) => Error::connectivity(error),
        }
    }
}

async fn run_action(conn: &mut PgConnection, sql: &str) -> Result<(), StepError> {
    conn.batch_execute(sql).await.map_err(StepError::Action)
}

async fn record(conn: &mut PgConnection, key: i32, description: &str) -> Result<(), StepError> {
    diesel::insert_into(pgforge_ledger::table)
        .values(&NewLedgerRow {
            step_id: key,
            description,
        })
        .execute(conn)
        .await?;
    Ok(())
}

async fn forget(conn: &mut PgConnection, key: i32) -> Result<(), StepError> {
    diesel::delete(pgforge_ledger::table.filter(pgforge_ledger::step_id.eq(key)))
        .execute(conn)
        .await?;
    Ok(())
}

async fn exists(conn: &mut PgConnection, query: &str, binds: &[&str]) -> Result<bool> {
    let result = match binds {
        [] => diesel::sql_query(query).get_result::<Holds>(conn).await,
        [a] => {
            diesel::sql_query(query)
                .bind::<Text, _>(*a)
                .get_result::<Holds>(conn)
                .await
        }
        [a, b, ..] => {
            diesel::sql_query(query)
                .bind::<Text, _>(*a)
                .bind::<Text, _>(*b)
                .get_result::<Holds>(conn)
                .await
        }
    };

    result.map(|row| row.holds).map_err(Error::connectivity)
}

impl LedgerStore for PgConnection {
    async fn ensure_ledger(&mut self) -> Result<()> {
        self.transaction::<_, DieselError, _>(|conn| {
            async move {
                diesel::sql_query("SELECT pg_advisory_xact_lock($1, 0)")
                    .bind::<Integer, _>(LEDGER_LOCK_CLASS)
                    .execute(conn)
                    .await?;
                conn.batch_execute(CREATE_LEDGER).await
            }
            .scope_boxed()
        })
        .await
        .map_err(Error::connectivity)?;

        tracing::debug!(target: TRACING_TARGET_LEDGER, table = LEDGER_TABLE, "Ledger ready");
        Ok(())
    }

    async fn ledger_entries(&mut self) -> Result<Vec<LedgerEntry>> {
        let created = exists(
            self,
            "SELECT to_regclass($1) IS NOT NULL AS holds",
            &[LEDGER_TABLE],
        )
        .await?;
        if !created {
            return Ok(Vec::new());
        }

        let rows: Vec<LedgerRow> = pgforge_ledger::table
            .select(LedgerRow::as_select())
            .order(pgforge_ledger::step_id.asc())
            .load(self)
            .await
            .map_err(Error::connectivity)?;

        rows.into_iter().map(LedgerRow::into_entry).collect()
    }

    async fn is_recorded(&mut self, step: StepId) -> Result<bool> {
        let key = step_key(step)?;
        diesel::select(diesel::dsl::exists(
            pgforge_ledger::table.filter(pgforge_ledger::step_id.eq(key)),
        ))
        .get_result::<bool>(self)
        .await
        .map_err(Error::connectivity)
    }

    async fn try_lock_step(&mut self, step: StepId) -> Result<bool> {
        let key = step_key(step)?;
        let row: Holds = diesel::sql_query("SELECT pg_try_advisory_lock($1, $2) AS holds")
            .bind::<Integer, _>(LEDGER_LOCK_CLASS)
            .bind::<Integer, _>(key)
            .get_result(self)
            .await
            .map_err(Error::connectivity)?;

        Ok(row.holds)
    }

    async fn unlock_step(&mut self, step: StepId) -> Result<()> {
        let key = step_key(step)?;
        let row: Holds = diesel::sql_query("SELECT pg_advisory_unlock($1, $2) AS holds")
            .bind::<Integer, _>(LEDGER_LOCK_CLASS)
            .bind::<Integer, _>(key)
            .get_result(self)
            .await
            .map_err(Error::connectivity)?;

        if !row.holds {
            tracing::warn!(
                target: TRACING_TARGET_LEDGER,
                step = %step,
                "Step lock was not held by this session"
            );
        }
        Ok(())
    }

    async fn check_postcondition(&mut self, postcondition: &Postcondition) -> Result<bool> {
        let holds = match postcondition {
            Postcondition::TableExists { table } => {
                exists(self, "SELECT to_regclass($1) IS NOT NULL AS holds", &[table.as_str()]).await?
            }
            Postcondition::ColumnExists { table, column } => {
                exists(
                    self,
                    "SELECT EXISTS (
                        SELECT 1 FROM information_schema.columns
                        WHERE table_schema = ANY (current_schemas(false))
                          AND table_name = $1 AND column_name = $2
                    ) AS holds",
                    &[table.as_str(), column.as_str()],
                )
                .await?
            }
            Postcondition::IndexExists { index } => {
                exists(
                    self,
                    "SELECT EXISTS (
                        SELECT 1 FROM pg_indexes
                        WHERE schemaname = ANY (current_schemas(false)) AND indexname = $1
                    ) AS holds",
                    &[index.as_str()],
                )
                .await?
            }
            Postcondition::Hypertable { table } => {
                let installed = exists(
                    self,
                    "SELECT EXISTS (SELECT 1 FROM pg_extension WHERE extname = 'timescaledb') AS holds",
                    &[],
                )
                .await?;

                installed
                    && exists(
                        self,
                        "SELECT EXISTS (
                            SELECT 1 FROM timescaledb_information.hypertables
                            WHERE hypertable_name = $1
                        ) AS holds",
                        &[table.as_str()],
                    )
                    .await?
            }
            Postcondition::ExtensionActive { name } => {
                exists(
                    self,
                    "SELECT EXISTS (SELECT 1 FROM pg_extension WHERE extname = $1) AS holds",
                    &[name.as_str()],
                )
                .await?
            }
        };

        tracing::trace!(
            target: TRACING_TARGET_LEDGER,
            postcondition = %postcondition,
            holds,
            "Checked postcondition"
        );
        Ok(holds)
    }

    #[tracing::instrument(skip_all, target = TRACING_TARGET_LEDGER, fields(step = %step.id))]
    async fn apply_step(&mut self, step: &MigrationStep) -> Result<()> {
        let key = step_key(step.id)?;
        let forward = step.forward.as_str();
        let description = step.description.as_str();

        let result = if step.atomic {
            self.transaction::<_, StepError, _>(|conn| {
                async move {
                    run_action(conn, forward).await?;
                    record(conn, key, description).await
                }
                .scope_boxed()
            })
            .await
        } else {
            match run_action(self, forward).await {
                Ok(()) => record(self, key, description).await,
                Err(error) => Err(error),
            }
        };

        result.map_err(|error| error.into_error(step.id))
    }

    #[tracing::instrument(skip_all, target = TRACING_TARGET_LEDGER, fields(step = %step.id))]
    async fn revert_step(&mut self, step: &MigrationStep) -> Result<()> {
        let Some(reverse) = step.reverse.as_deref() else {
            return Err(Error::Irreversible { step: step.id });
        };
        let key = step_key(step.id)?;

        let result = if step.atomic {
            self.transaction::<_, StepError, _>(|conn| {
                async move {
                    run_action(conn, reverse).await?;
                    forget(conn, key).await
                }
                .scope_boxed()
            })
            .await
        } else {
            match run_action(self, reverse).await {
                Ok(()) => forget(self, key).await,
                Err(error) => Err(error),
            }
        };

        result.map_err(|error| error.into_error(step.id))
    }
}
