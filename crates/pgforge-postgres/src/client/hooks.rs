//! Connection establishment and pool hooks.

use std::time::Instant;

use deadpool::managed::{HookResult, Metrics};
use diesel::ConnectionResult;
use diesel_async::pooled_connection::PoolError;
use futures::FutureExt;
use futures::future::BoxFuture;

use super::mask_url;
use crate::{PgConnection, TRACING_TARGET_CONNECTION};

/// Opens a session, logging the masked URL and how long the handshake took.
pub fn establish(url: &str) -> BoxFuture<'_, ConnectionResult<PgConnection>> {
    async move {
        let start = Instant::now();
        let result = <PgConnection as diesel_async::AsyncConnection>::establish(url).await;

        if let Err(err) = &result {
            tracing::error!(
                target: TRACING_TARGET_CONNECTION,
                url = %mask_url(url),
                elapsed = ?start.elapsed(),
                error = %err,
                "Could not open database session"
            );
        } else {
            tracing::debug!(
                target: TRACING_TARGET_CONNECTION,
                url = %mask_url(url),
                elapsed = ?start.elapsed(),
                "Opened database session"
            );
        }

        result
    }
    .boxed()
}

/// Logs sessions added to the pool.
pub fn on_create(_: &mut PgConnection, metrics: &Metrics) -> HookResult<PoolError> {
    tracing::trace!(
        target: TRACING_TARGET_CONNECTION,
        created = ?metrics.created,
        "Session added to pool"
    );
    Ok(())
}
