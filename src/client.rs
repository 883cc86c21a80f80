use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::future::BoxFuture;
use futures_util::{TryStreamExt, pin_mut};
use tokio_postgres::Row;
use tokio_postgres::types::ToSql;

use crate::batch::Batch;
use crate::config::ClientOptions;
use crate::context::Context;
use crate::error::DbError;
use crate::pool::{self, PgPool, PoolStats, PooledConnection};
use crate::retry::{Backoff, OperationClass, RetryPolicy, retry_operation};
use crate::telemetry::{BatchObserver, DbTracer, Outcome, QueryObserver, TracerConfig};
use crate::transaction::{self, Tx, TxOptions};

struct ClientInner {
    pool: PgPool,
    options: ClientOptions,
    tracer: Arc<DbTracer>,
    backoff: Backoff,
    max_attempts: u32,
    policy: RetryPolicy,
    closed: AtomicBool,
}

/// Pooled, traced PostgreSQL client.
///
/// Cheap to clone; clones share the pool. Every call takes a [`Context`]
/// whose cancellation and deadline bound the whole call, retries included.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("options", &self.inner.options)
            .field("max_attempts", &self.inner.max_attempts)
            .field("closed", &self.inner.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Optional knobs for [`Client`] construction.
#[derive(Debug)]
pub struct ClientBuilder {
    options: ClientOptions,
    tracer_config: TracerConfig,
    tracer: Option<Arc<DbTracer>>,
    policy: RetryPolicy,
}

impl ClientBuilder {
    #[must_use]
    pub fn tracer_config(mut self, config: TracerConfig) -> Self {
        self.tracer_config = config;
        self
    }

    /// Use an existing tracer instead of one built from the global providers.
    /// Overrides [`ClientBuilder::tracer_config`].
    #[must_use]
    pub fn tracer(mut self, tracer: Arc<DbTracer>) -> Self {
        self.tracer = Some(tracer);
        self
    }

    #[must_use]
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Validate the options and create the pool. No connection is opened here.
    ///
    /// # Errors
    /// Returns `DbError::Config` for invalid options and `DbError::PoolLimit`
    /// when a pool bound exceeds the int32 limit.
    pub fn build(self) -> Result<Client, DbError> {
        let ClientBuilder {
            options,
            tracer_config,
            tracer,
            policy,
        } = self;
        options.validate()?;

        let tracer =
            tracer.unwrap_or_else(|| Arc::new(DbTracer::new(&options, tracer_config)));
        let pool = pool::create_pool(&options, &tracer)?;
        let (backoff, max_attempts) = Backoff::new(
            options.retry_initial_delay,
            options.retry_max_delay,
            options.max_retry_attempts,
        );

        Ok(Client {
            inner: Arc::new(ClientInner {
                pool,
                options,
                tracer,
                backoff,
                max_attempts,
                policy,
                closed: AtomicBool::new(false),
            }),
        })
    }
}

impl Client {
    /// Client with the default tracer configuration and retry policy.
    ///
    /// # Errors
    /// See [`ClientBuilder::build`].
    pub fn new(options: ClientOptions) -> Result<Self, DbError> {
        Self::builder(options).build()
    }

    #[must_use]
    pub fn builder(options: ClientOptions) -> ClientBuilder {
        ClientBuilder {
            options,
            tracer_config: TracerConfig::default(),
            tracer: None,
            policy: RetryPolicy::default(),
        }
    }

    /// Apply `query_timeout` unless the caller already set a deadline.
    fn call_context(&self, ctx: &Context) -> Context {
        let timeout = self.inner.options.query_timeout;
        if ctx.deadline().is_none() && !timeout.is_zero() {
            ctx.with_timeout(timeout)
        } else {
            ctx.clone()
        }
    }

    async fn acquire(&self, ctx: &Context) -> Result<PooledConnection, DbError> {
        if self.is_closed() {
            return Err(DbError::Closed);
        }
        ctx.run(async { self.inner.pool.get().await.map_err(DbError::from) })
            .await
    }

    async fn query_once(
        &self,
        ctx: &Context,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Vec<Row>, DbError> {
        let conn = self.acquire(ctx).await?;
        let in_flight = self.inner.tracer.query_start(sql);
        let result = ctx
            .run(async { conn.query(sql, params).await.map_err(DbError::from) })
            .await;
        self.inner
            .tracer
            .query_end(in_flight, Outcome::of(&result, |rows| Some(rows.len() as u64)));
        result
    }

    /// Run a read and collect every row, retrying transient failures when
    /// retry is enabled.
    ///
    /// # Errors
    /// Returns the last driver error once retries are spent, a permanent error
    /// right away, or the context's error.
    pub async fn query(
        &self,
        ctx: &Context,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Vec<Row>, DbError> {
        let ctx = self.call_context(ctx);
        if !self.inner.options.enable_retry {
            return self.query_once(&ctx, sql, params).await;
        }

        let mut attempt = 0_u32;
        retry_operation(
            &ctx,
            &self.inner.backoff,
            self.inner.max_attempts,
            OperationClass::Read,
            &self.inner.policy,
            || {
                attempt += 1;
                if attempt > 1 {
                    self.inner.tracer.record_retry(sql, OperationClass::Read);
                }
                self.query_once(&ctx, sql, params)
            },
        )
        .await
    }

    /// First row of a read; any further rows are discarded unread. Never retried.
    ///
    /// # Errors
    /// Returns `DbError::NoRows` when the result is empty.
    pub async fn query_row(
        &self,
        ctx: &Context,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Row, DbError> {
        let ctx = self.call_context(ctx);
        let conn = self.acquire(&ctx).await?;
        let in_flight = self.inner.tracer.query_start(sql);
        let result = ctx
            .run(async {
                let rows = conn
                    .query_raw(sql, params.iter().map(|p| *p as &dyn ToSql))
                    .await?;
                pin_mut!(rows);
                Ok::<_, DbError>(rows.try_next().await?)
            })
            .await;
        self.inner
            .tracer
            .query_end(in_flight, Outcome::of(&result, |row| Some(u64::from(row.is_some()))));
        result?.ok_or(DbError::NoRows)
    }

    /// Run a write and return the affected row count. Never retried.
    ///
    /// # Errors
    /// Returns driver, pool or context errors.
    pub async fn exec(
        &self,
        ctx: &Context,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<u64, DbError> {
        let ctx = self.call_context(ctx);
        let conn = self.acquire(&ctx).await?;
        let in_flight = self.inner.tracer.query_start(sql);
        let result = ctx
            .run(async { conn.execute(sql, params).await.map_err(DbError::from) })
            .await;
        self.inner
            .tracer
            .query_end(in_flight, Outcome::of(&result, |n| Some(*n)));
        result
    }

    /// Run every queued statement in one transaction, in order. Never retried.
    ///
    /// Returns the affected row count of each statement. The first failing
    /// statement aborts the batch and nothing is committed.
    ///
    /// # Errors
    /// Returns the first statement's error, `DbError::Commit`, or pool and context errors.
    pub async fn send_batch(&self, ctx: &Context, batch: &Batch) -> Result<Vec<u64>, DbError> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }
        let ctx = self.call_context(ctx);
        let mut conn = self.acquire(&ctx).await?;

        let tracer = &self.inner.tracer;
        let in_flight = tracer.batch_start(batch.len());
        let result = ctx
            .run(async {
                let tx = conn.transaction().await.map_err(DbError::Begin)?;
                let mut counts = Vec::with_capacity(batch.len());
                for statement in batch.statements() {
                    let res = tx
                        .execute(statement.sql.as_str(), &statement.param_refs())
                        .await
                        .map_err(DbError::from);
                    tracer.batch_query(&in_flight, &statement.sql, Outcome::of(&res, |n| Some(*n)));
                    counts.push(res?);
                }
                tx.commit().await.map_err(DbError::Commit)?;
                Ok(counts)
            })
            .await;
        tracer.batch_end(in_flight, Outcome::of(&result, |_| None));
        result
    }

    /// Run `f` in a transaction with server-default settings.
    ///
    /// Committed when `f` returns `Ok`, rolled back when it returns `Err`.
    /// The transaction itself is never retried.
    ///
    /// ```no_run
    /// # use pg_middleware::prelude::*;
    /// # async fn demo(client: &Client) -> Result<(), DbError> {
    /// let ctx = Context::background();
    /// let moved = client
    ///     .with_tx(&ctx, |ctx, tx| {
    ///         Box::pin(async move {
    ///             tx.exec(ctx, "UPDATE accounts SET balance = balance - 10 WHERE id = $1", &[&1_i64])
    ///                 .await
    ///         })
    ///     })
    ///     .await?;
    /// # let _ = moved;
    /// # Ok(())
    /// # }
    /// ```
    ///
    /// # Errors
    /// Returns `f`'s own error after rolling back, `DbError::Begin` or
    /// `DbError::Commit` for transaction control failures, or pool and context errors.
    pub async fn with_tx<T, E, F>(&self, ctx: &Context, f: F) -> Result<T, E>
    where
        F: for<'c> FnOnce(&'c Context, &'c Tx<'c>) -> BoxFuture<'c, Result<T, E>>,
        E: From<DbError>,
    {
        self.with_tx_options(ctx, TxOptions::default(), f).await
    }

    /// [`Client::with_tx`] with explicit isolation level and access mode.
    ///
    /// # Errors
    /// See [`Client::with_tx`].
    pub async fn with_tx_options<T, E, F>(
        &self,
        ctx: &Context,
        options: TxOptions,
        f: F,
    ) -> Result<T, E>
    where
        F: for<'c> FnOnce(&'c Context, &'c Tx<'c>) -> BoxFuture<'c, Result<T, E>>,
        E: From<DbError>,
    {
        let ctx = self.call_context(ctx);
        let mut conn = self.acquire(&ctx).await?;
        transaction::run_in_transaction(&ctx, &mut conn, options, &self.inner.tracer, f).await
    }

    /// Round-trip `SELECT 1` on a pooled connection. Never retried.
    ///
    /// # Errors
    /// Returns pool, driver or context errors.
    pub async fn ping(&self, ctx: &Context) -> Result<(), DbError> {
        const PING: &str = "SELECT 1";
        let ctx = self.call_context(ctx);
        let conn = self.acquire(&ctx).await?;
        let in_flight = self.inner.tracer.query_start(PING);
        let result = ctx
            .run(async { conn.batch_execute(PING).await.map_err(DbError::from) })
            .await;
        self.inner
            .tracer
            .query_end(in_flight, Outcome::of(&result, |_| None));
        result
    }

    /// Close the pool. Later calls fail with `DbError::Closed`; closing
    /// again does nothing.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.pool.close();
        tracing::info!(
            host = %self.inner.options.host,
            database = %self.inner.options.database,
            "closed database connection pool"
        );
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn stats(&self) -> PoolStats {
        PoolStats::of(&self.inner.pool)
    }

    #[must_use]
    pub fn options(&self) -> &ClientOptions {
        &self.inner.options
    }

    #[must_use]
    pub fn tracer(&self) -> &Arc<DbTracer> {
        &self.inner.tracer
    }

    #[must_use]
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.inner.policy
    }

    /// Effective attempt budget for reads; 1 when retry is disabled.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        if self.inner.options.enable_retry {
            self.inner.max_attempts
        } else {
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn options() -> ClientOptions {
        ClientOptions::new("127.0.0.1", "ledger", "svc", "secret").with_pool_size(2, 0)
    }

    #[tokio::test]
    async fn caller_deadline_wins_over_query_timeout() {
        let client = Client::new(options().with_query_timeout(Duration::from_secs(30))).unwrap();
        let caller = Context::background().with_timeout(Duration::from_secs(120));
        assert_eq!(client.call_context(&caller).deadline(), caller.deadline());

        let derived = client.call_context(&Context::background());
        assert!(derived.deadline().is_some());
    }

    #[tokio::test]
    async fn zero_query_timeout_adds_no_deadline() {
        let client = Client::new(options().with_query_timeout(Duration::ZERO)).unwrap();
        assert!(client.call_context(&Context::background()).deadline().is_none());
    }

    #[test]
    fn attempt_budget_reflects_retry_switch() {
        let retrying = Client::new(options().with_retry(0, Duration::from_millis(1), Duration::from_millis(2))).unwrap();
        assert_eq!(retrying.max_attempts(), 1);
        let five = Client::new(options().with_retry(5, Duration::from_millis(1), Duration::from_millis(2))).unwrap();
        assert_eq!(five.max_attempts(), 5);
        let disabled = Client::new(options().without_retry()).unwrap();
        assert_eq!(disabled.max_attempts(), 1);
    }
}
