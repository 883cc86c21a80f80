pub mod manager;

pub use manager::TracedManager;

use std::sync::Arc;
use std::time::Instant;

use deadpool::managed::{Object, Pool};

use crate::config::ClientOptions;
use crate::error::DbError;
use crate::telemetry::DbTracer;

/// Bounded pool of traced PostgreSQL connections.
pub type PgPool = Pool<TracedManager>;

/// A connection checked out of a [`PgPool`]; returned to the pool on drop.
pub type PooledConnection = Object<TracedManager>;

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub max_size: usize,
    /// Connections currently open, idle or in use.
    pub size: usize,
    /// Idle connections ready to hand out.
    pub available: usize,
    /// Callers blocked waiting for a connection.
    pub waiting: usize,
}

impl PoolStats {
    #[must_use]
    pub fn of(pool: &PgPool) -> Self {
        let status = pool.status();
        Self {
            max_size: status.max_size,
            size: status.size,
            available: status.available,
            waiting: status.waiting,
        }
    }
}

/// Convert a configured connection count to a pool bound, refusing values
/// the driver's 32-bit connection counter cannot hold.
fn pool_bound(field: &'static str, value: i64) -> Result<usize, DbError> {
    if value > i64::from(i32::MAX) {
        return Err(DbError::PoolLimit { field, value });
    }
    usize::try_from(value).map_err(|_| DbError::PoolLimit { field, value })
}

/// Build the connection pool described by `options`.
///
/// Connections are opened lazily; when `min_conns` is positive and a tokio
/// runtime is available, a background task warms the pool up to that many.
///
/// # Errors
/// Returns `DbError::Config` for invalid options, `DbError::PoolLimit` when a
/// bound exceeds the int32 limit, and `DbError::Pool` if the pool cannot be built.
pub fn create_pool(options: &ClientOptions, tracer: &Arc<DbTracer>) -> Result<PgPool, DbError> {
    let started = Instant::now();

    let max_size = pool_bound("max_conns", options.max_conns)?;
    let min_idle = pool_bound("min_conns", options.min_conns)?;

    let observer: Arc<DbTracer> = Arc::clone(tracer);
    let manager = TracedManager::new(
        options.pg_config()?,
        observer,
        options.conn_max_lifetime,
        options.conn_max_idle_time,
    );

    let pool = Pool::builder(manager)
        .max_size(max_size)
        .build()
        .map_err(|e| DbError::Pool(format!("Failed to create Postgres pool: {e}")))?;

    tracer.record_pool_created(started.elapsed());
    tracing::info!(
        host = %options.host,
        port = options.port,
        database = %options.database,
        max_conns = max_size,
        min_conns = min_idle,
        "created database connection pool"
    );

    if min_idle > 0 {
        spawn_warm_up(&pool, min_idle);
    }
    Ok(pool)
}

fn spawn_warm_up(pool: &PgPool, count: usize) {
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        tracing::debug!("no tokio runtime, skipping connection pool warm-up");
        return;
    };
    let pool = pool.clone();
    handle.spawn(async move {
        let mut held = Vec::with_capacity(count);
        for _ in 0..count {
            match pool.get().await {
                Ok(conn) => held.push(conn),
                Err(err) => {
                    tracing::debug!(error = %err, "connection pool warm-up stopped early");
                    break;
                }
            }
        }
        tracing::debug!(opened = held.len(), "connection pool warm-up finished");
    });
}
