use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel::sql_types::{Integer, Text};
use diesel_async::scoped_futures::ScopedFutureExt;
use diesel_async::{AsyncConnection, RunQueryDsl, SimpleAsyncConnection};
use pgforge_core::capability::{Capability, CapabilityName, CapabilitySet, parse_version};
use pgforge_core::store::CapabilityStore;
use pgforge_core::{Error, Result};

use super::{ACTIVATION_LOCK_CLASS, is_connection_loss, quote_ident};
use crate::{PgConnection, TRACING_TARGET_EXTENSION};

/// A row of `pg_extension`.
#[derive(diesel::QueryableByName)]
struct ExtensionRow {
    #[diesel(sql_type = Text)]
    extname: String,
    #[diesel(sql_type = Text)]
    extversion: String,
}

impl ExtensionRow {
    fn into_capability(self) -> Result<Capability> {
        let version = parse_version(&self.extversion)?;
        Ok(Capability::active(self.extname, version))
    }
}

/// Maps a failed probe query.
fn probe_error(error: DieselError) -> Error {
    match error {
        DieselError::DeserializationError(e) => {
            Error::ProbeParse(format!("unexpected pg_extension row: {e}"))
        }
        other => Error::connectivity(other),
    }
}

/// Maps a failed activation, treating lost races as success.
fn activation_error(name: &CapabilityName, error: DieselError) -> Option<Error> {
    if is_connection_loss(&error) {
        return Some(Error::connectivity(error));
    }

    match error {
        DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _) => None,
        DieselError::DatabaseError(_, info) if info.message().contains("already exists") => None,
        DieselError::DatabaseError(_, info) => Some(Error::ActivationDenied {
            capability: name.clone(),
            reason: info.message().to_owned(),
        }),
        other => Some(Error::connectivity(other)),
    }
}

/// Runs an extension statement under the activation lock of `name`.
async fn locked_extension_ddl(
    conn: &mut PgConnection,
    name: &CapabilityName,
    statement: String,
) -> Result<()> {
    let result = conn
        .transaction::<_, DieselError, _>(|conn| {
            async move {
                diesel::sql_query("SELECT pg_advisory_xact_lock($1, hashtext($2))")
                    .bind::<Integer, _>(ACTIVATION_LOCK_CLASS)
                    .bind::<Text, _>(name.as_str())
                    .execute(conn)
                    .await?;
                conn.batch_execute(&statement).await?;
                Ok(())
            }
            .scope_boxed()
        })
        .await;

    match result {
        Ok(()) => Ok(()),
        Err(error) => match activation_error(name, error) {
            None => {
                tracing::debug!(
                    target: TRACING_TARGET_EXTENSION,
                    capability = %name,
                    "Extension activated concurrently by another session"
                );
                Ok(())
            }
            Some(error) => Err(error),
        },
    }
}

impl CapabilityStore for PgConnection {
    async fn probe_capabilities(&mut self) -> Result<CapabilitySet> {
        let rows: Vec<ExtensionRow> = diesel::sql_query(
            "SELECT extname::text AS extname, extversion FROM pg_extension ORDER BY extname",
        )
        .load(self)
        .await
        .map_err(probe_error)?;

        let capabilities = rows
            .into_iter()
            .map(ExtensionRow::into_capability)
            .collect::<Result<CapabilitySet>>()?;

        tracing::debug!(
            target: TRACING_TARGET_EXTENSION,
            installed = capabilities.len(),
            "Probed installed extensions"
        );

        Ok(capabilities)
    }

    async fn probe_capability(&mut self, name: &CapabilityName) -> Result<Option<Capability>> {
        let rows: Vec<ExtensionRow> = diesel::sql_query(
            "SELECT extname::text AS extname, extversion FROM pg_extension WHERE extname = $1",
        )
        .bind::<Text, _>(name.as_str())
        .load(self)
        .await
        .map_err(probe_error)?;

        rows.into_iter()
            .next()
            .map(ExtensionRow::into_capability)
            .transpose()
    }

    #[tracing::instrument(skip(self), target = TRACING_TARGET_EXTENSION)]
    async fn activate_capability(&mut self, name: &CapabilityName) -> Result<()> {
        let statement = format!("CREATE EXTENSION IF NOT EXISTS {}", quote_ident(name));
        locked_extension_ddl(self, name, statement).await?;

        tracing::info!(target: TRACING_TARGET_EXTENSION, capability = %name, "Extension enabled");
        Ok(())
    }

    #[tracing::instrument(skip(self), target = TRACING_TARGET_EXTENSION)]
    async fn upgrade_capability(&mut self, name: &CapabilityName) -> Result<()> {
        let statement = format!("ALTER EXTENSION {} UPDATE", quote_ident(name));
        locked_extension_ddl(self, name, statement).await?;

        tracing::info!(target: TRACING_TARGET_EXTENSION, capability = %name, "Extension updated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use diesel::result::DatabaseErrorInformation;

    use super::*;

    #[derive(Debug)]
    struct Info(&'static str);

    impl DatabaseErrorInformation for Info {
        fn message(&self) -> &str {
            self.0
        }

        fn details(&self) -> Option<&str> {
            None
        }

        fn hint(&self) -> Option<&str> {
            None
        }

        fn table_name(&self) -> Option<&str> {
            None
        }

        fn column_name(&self) -> Option<&str> {
            None
        }

        fn constraint_name(&self) -> Option<&str> {
            None
        }

        fn statement_position(&self) -> Option<i32> {
            None
        }
    }

    fn db_error(kind: DatabaseErrorKind, message: &'static str) -> DieselError {
        DieselError::DatabaseError(kind, Box::new(Info(message)))
    }

    #[test]
    fn refusals_become_activation_denied() {
        let err = activation_error(
            &CapabilityName::vector(),
            db_error(
                DatabaseErrorKind::Unknown,
                "permission denied to create extension \"vector\"",
            ),
        )
        .unwrap();

        match err {
            Error::ActivationDenied { capability, reason } => {
                assert_eq!(capability, CapabilityName::vector());
                assert!(reason.contains("permission denied"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn duplicate_races_are_success() {
        let name = CapabilityName::spatial();
        assert!(
            activation_error(&name, db_error(DatabaseErrorKind::UniqueViolation, "duplicate key"))
                .is_none()
        );
        assert!(
            activation_error(
                &name,
                db_error(DatabaseErrorKind::Unknown, "extension \"postgis\" already exists")
            )
            .is_none()
        );
    }

    #[test]
    fn lost_connections_are_transient() {
        let err = activation_error(
            &CapabilityName::time_series(),
            db_error(DatabaseErrorKind::ClosedConnection, "server closed the connection"),
        )
        .unwrap();
        assert!(err.is_transient());
    }

    #[test]
    fn extension_rows_parse_lenient_versions() {
        let row = ExtensionRow {
            extname: "timescaledb".into(),
            extversion: "2.14.2".into(),
        };
        let capability = row.into_capability().unwrap();
        assert_eq!(capability.version, semver::Version::new(2, 14, 2));

        let row = ExtensionRow {
            extname: "weird".into(),
            extversion: "unknown".into(),
        };
        assert!(matches!(row.into_capability(), Err(Error::ProbeParse(_))));
    }
}
