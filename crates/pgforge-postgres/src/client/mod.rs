//! Connection pool for the database being provisioned.

mod hooks;
mod pg_client;
mod pg_config;

use deadpool::managed::{Object, Pool};
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
pub use pg_client::{PgClient, PgConn};
pub use pg_config::PgConfig;
pub(crate) use pg_config::mask_url;

use crate::PgConnection;

type Manager = AsyncDieselConnectionManager<PgConnection>;

/// Pool of [`PgConnection`]s.
pub type ConnectionPool = Pool<Manager>;

/// Connection checked out of a [`ConnectionPool`].
pub type PooledConnection = Object<Manager>;
