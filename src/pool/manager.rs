use std::sync::Arc;
use std::time::Duration;

use deadpool::managed::{self, Metrics, RecycleError, RecycleResult};
use deadpool_postgres::{ClientWrapper, ManagerConfig, RecyclingMethod};
use tokio_postgres::NoTls;

use crate::error::DbError;
use crate::telemetry::{ConnectObserver, Outcome};

/// `deadpool` manager that opens connections through `deadpool_postgres` and
/// reports every connection lifecycle step to a [`ConnectObserver`].
///
/// - before connect: [`ConnectObserver::connect_start`]
/// - after connect: debug log, then [`ConnectObserver::connect_end`] records the latency
/// - after release: [`TracedManager::recycle`] decides whether the connection is
///   healthy enough to hand out again; unhealthy ones are discarded
/// - before close: debug log in [`TracedManager::detach`]
pub struct TracedManager {
    inner: deadpool_postgres::Manager,
    observer: Arc<dyn ConnectObserver>,
    max_lifetime: Duration,
    max_idle_time: Duration,
}

impl std::fmt::Debug for TracedManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TracedManager")
            .field("max_lifetime", &self.max_lifetime)
            .field("max_idle_time", &self.max_idle_time)
            .finish_non_exhaustive()
    }
}

impl TracedManager {
    /// A zero `max_lifetime` or `max_idle_time` disables that check.
    #[must_use]
    pub fn new(
        pg_config: tokio_postgres::Config,
        observer: Arc<dyn ConnectObserver>,
        max_lifetime: Duration,
        max_idle_time: Duration,
    ) -> Self {
        let manager_config = ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        };
        Self {
            inner: deadpool_postgres::Manager::from_config(pg_config, NoTls, manager_config),
            observer,
            max_lifetime,
            max_idle_time,
        }
    }

    /// Why a released connection must not be reused, if anything.
    fn unhealthy_reason(&self, client: &ClientWrapper, metrics: &Metrics) -> Option<&'static str> {
        if client.is_closed() {
            return Some("connection closed");
        }
        if !self.max_lifetime.is_zero() && metrics.age() > self.max_lifetime {
            return Some("connection exceeded max lifetime");
        }
        if !self.max_idle_time.is_zero() && metrics.last_used() > self.max_idle_time {
            return Some("connection exceeded max idle time");
        }
        None
    }
}

impl managed::Manager for TracedManager {
    type Type = ClientWrapper;
    type Error = DbError;

    async fn create(&self) -> Result<ClientWrapper, DbError> {
        let metadata = self.observer.connect_start();
        let result = managed::Manager::create(&self.inner)
            .await
            .map_err(DbError::from);
        match &result {
            Ok(_) => tracing::debug!("opened database connection"),
            Err(err) => tracing::debug!(error = %err, "failed to open database connection"),
        }
        self.observer
            .connect_end(metadata, Outcome::of(&result, |_| None));
        result
    }

    async fn recycle(&self, client: &mut ClientWrapper, metrics: &Metrics) -> RecycleResult<DbError> {
        match self.unhealthy_reason(client, metrics) {
            Some(reason) => {
                tracing::debug!(reason, "discarding database connection");
                Err(RecycleError::Message(reason.into()))
            }
            None => managed::Manager::recycle(&self.inner, client, metrics)
                .await
                .map_err(|err| match err {
                    RecycleError::Backend(err) => RecycleError::Backend(DbError::from(err)),
                    RecycleError::Message(msg) => RecycleError::Message(msg),
                }),
        }
    }

    fn detach(&self, client: &mut ClientWrapper) {
        tracing::debug!("closing database connection");
        managed::Manager::detach(&self.inner, client);
    }
}
