//! Pooled client.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use deadpool::managed::Hook;
use derive_more::{Deref, DerefMut};
use diesel_async::RunQueryDsl;
use diesel_async::pooled_connection::ManagerConfig;

use super::{ConnectionPool, Manager, PooledConnection, hooks};
use crate::{PgConfig, PgConnection, PgError, PgResult, TRACING_TARGET_CLIENT, TRACING_TARGET_CONNECTION};

/// Acquisitions slower than this are logged as a sign of pool contention.
const SLOW_ACQUIRE: Duration = Duration::from_millis(100);

/// Pooled client for the database being provisioned.
///
/// Cloning is cheap and shares the pool.
#[derive(Clone)]
pub struct PgClient {
    pool: ConnectionPool,
    config: Arc<PgConfig>,
}

impl PgClient {
    /// Builds the pool without opening a session.
    ///
    /// # Errors
    ///
    /// Returns [`PgError::Pool`] if deadpool rejects the pool settings.
    #[tracing::instrument(
        skip(config),
        target = TRACING_TARGET_CLIENT,
        fields(database_url = %config.database_url_masked())
    )]
    pub fn new(config: PgConfig) -> PgResult<Self> {
        let mut manager_config = ManagerConfig::default();
        manager_config.custom_setup = Box::new(hooks::establish);

        let timeout = config.connection_timeout();
        let pool = ConnectionPool::builder(Manager::new_with_config(
            config.database_url(),
            manager_config,
        ))
        .max_size(config.postgres_max_connections as usize)
        .wait_timeout(timeout)
        .create_timeout(timeout)
        .runtime(deadpool::Runtime::Tokio1)
        .post_create(Hook::sync_fn(hooks::on_create))
        .build()
        .map_err(|e| PgError::Pool(format!("invalid pool settings: {e}")))?;

        Ok(Self {
            pool,
            config: Arc::new(config),
        })
    }

    /// Builds the pool and checks that the server answers.
    ///
    /// # Errors
    ///
    /// Returns an error if no session can be opened or the server does not
    /// report its version.
    pub async fn new_with_test(config: PgConfig) -> PgResult<Self> {
        let client = Self::new(config)?;
        let version = client.server_version().await?;

        tracing::info!(
            target: TRACING_TARGET_CLIENT,
            server_version = %version,
            max_connections = client.config.postgres_max_connections,
            "Connected to database"
        );

        Ok(client)
    }

    /// Returns the `server_version` setting.
    pub async fn server_version(&self) -> PgResult<String> {
        #[derive(diesel::QueryableByName)]
        struct ServerVersion {
            #[diesel(sql_type = diesel::sql_types::Text)]
            server_version: String,
        }

        let mut conn = self.get_connection().await?;
        let row: ServerVersion = diesel::sql_query("SHOW server_version")
            .get_result(conn.connection_mut())
            .await?;
        Ok(row.server_version)
    }

    /// Checks a session out of the pool.
    ///
    /// The configured statement timeout is set on the session first.
    ///
    /// # Errors
    ///
    /// Returns [`PgError::Timeout`] if the pool stays exhausted for the whole
    /// connection timeout.
    #[tracing::instrument(skip(self), target = TRACING_TARGET_CONNECTION)]
    pub async fn get_connection(&self) -> PgResult<PgConn> {
        let start = Instant::now();
        let mut conn = PgConn(self.pool.get().await?);

        let waited = start.elapsed();
        if waited > SLOW_ACQUIRE {
            tracing::warn!(
                target: TRACING_TARGET_CONNECTION,
                waited = ?waited,
                "Slow connection checkout"
            );
        }

        if let Some(timeout) = self.config.statement_timeout() {
            conn.set_statement_timeout(timeout).await?;
        }

        Ok(conn)
    }

    /// Returns the configuration the pool was built from.
    #[inline]
    pub fn config(&self) -> &PgConfig {
        &self.config
    }
}

impl fmt::Debug for PgClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = self.pool.status();
        f.debug_struct("PgClient")
            .field("database_url", &self.config.database_url_masked())
            .field("size", &status.size)
            .field("max_size", &status.max_size)
            .finish()
    }
}

/// A pooled session, returned to the pool when dropped.
///
/// The [`CapabilityStore`] and [`LedgerStore`] implementations live on the
/// underlying [`PgConnection`], reachable through [`PgConn::connection_mut`].
///
/// [`CapabilityStore`]: pgforge_core::store::CapabilityStore
/// [`LedgerStore`]: pgforge_core::store::LedgerStore
#[derive(Deref, DerefMut)]
pub struct PgConn(PooledConnection);

impl PgConn {
    /// Returns the underlying connection.
    #[inline]
    pub fn connection_mut(&mut self) -> &mut PgConnection {
        &mut self.0
    }

    async fn set_statement_timeout(&mut self, timeout: Duration) -> PgResult<()> {
        diesel::sql_query(format!("SET statement_timeout = {}", timeout.as_millis()))
            .execute(self.connection_mut())
            .await?;
        Ok(())
    }
}

impl fmt::Debug for PgConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PgConn").finish_non_exhaustive()
    }
}
