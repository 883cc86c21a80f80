use futures_util::future::BoxFuture;
use futures_util::{TryStreamExt, pin_mut};
use deadpool_postgres::{ClientWrapper, Transaction as PgTransaction};
use tokio_postgres::types::ToSql;
use tokio_postgres::{IsolationLevel, Row, Statement};

use crate::context::Context;
use crate::error::DbError;
use crate::telemetry::{DbTracer, Outcome, PrepareObserver, QueryObserver};

/// Isolation and access-mode overrides for [`Client::with_tx_options`](crate::Client::with_tx_options).
///
/// Unset fields keep the server defaults.
#[derive(Debug, Clone, Copy, Default)]
pub struct TxOptions {
    pub isolation_level: Option<IsolationLevel>,
    pub read_only: Option<bool>,
    pub deferrable: Option<bool>,
}

impl TxOptions {
    #[must_use]
    pub fn isolation_level(mut self, level: IsolationLevel) -> Self {
        self.isolation_level = Some(level);
        self
    }

    #[must_use]
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = Some(read_only);
        self
    }

    #[must_use]
    pub fn deferrable(mut self, deferrable: bool) -> Self {
        self.deferrable = Some(deferrable);
        self
    }
}

/// Prepared statement tied to the transaction that prepared it.
#[derive(Debug, Clone)]
pub struct Prepared {
    stmt: Statement,
    sql: String,
}

impl Prepared {
    #[must_use]
    pub fn sql(&self) -> &str {
        &self.sql
    }

    #[must_use]
    pub fn statement(&self) -> &Statement {
        &self.stmt
    }
}

/// Open transaction handed to the closure passed to `with_tx`.
///
/// Every statement is traced like calls on the [`Client`](crate::Client) itself.
pub struct Tx<'a> {
    tx: PgTransaction<'a>,
    tracer: &'a DbTracer,
}

impl<'a> Tx<'a> {
    /// Run a statement and collect every row.
    ///
    /// # Errors
    /// Returns driver errors, or the context's error if it ends first.
    pub async fn query(
        &self,
        ctx: &Context,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Vec<Row>, DbError> {
        let in_flight = self.tracer.query_start(sql);
        let result = ctx
            .run(async { self.tx.query(sql, params).await.map_err(DbError::from) })
            .await;
        self.tracer
            .query_end(in_flight, Outcome::of(&result, |rows| Some(rows.len() as u64)));
        result
    }

    /// First row of the result; the rest are discarded unread.
    ///
    /// # Errors
    /// Returns `DbError::NoRows` for an empty result, otherwise as [`Tx::query`].
    pub async fn query_row(
        &self,
        ctx: &Context,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Row, DbError> {
        let in_flight = self.tracer.query_start(sql);
        let result = ctx
            .run(async {
                let rows = self
                    .tx
                    .query_raw(sql, params.iter().map(|p| *p as &dyn ToSql))
                    .await?;
                pin_mut!(rows);
                Ok::<_, DbError>(rows.try_next().await?)
            })
            .await;
        self.tracer
            .query_end(in_flight, Outcome::of(&result, |row| Some(u64::from(row.is_some()))));
        result?.ok_or(DbError::NoRows)
    }

    /// Run a statement and return the affected row count.
    ///
    /// # Errors
    /// Returns driver errors, or the context's error if it ends first.
    pub async fn exec(
        &self,
        ctx: &Context,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<u64, DbError> {
        let in_flight = self.tracer.query_start(sql);
        let result = ctx
            .run(async { self.tx.execute(sql, params).await.map_err(DbError::from) })
            .await;
        self.tracer.query_end(in_flight, Outcome::of(&result, |n| Some(*n)));
        result
    }

    /// Prepare (or reuse from the connection's cache) a statement.
    ///
    /// # Errors
    /// Returns driver errors, or the context's error if it ends first.
    pub async fn prepare(&self, ctx: &Context, sql: &str) -> Result<Prepared, DbError> {
        let in_flight = self.tracer.prepare_start(sql);
        let result = ctx
            .run(async { self.tx.prepare_cached(sql).await.map_err(DbError::from) })
            .await;
        self.tracer.prepare_end(in_flight, Outcome::of(&result, |_| None));
        Ok(Prepared {
            stmt: result?,
            sql: sql.to_string(),
        })
    }

    /// Run a prepared statement and collect every row.
    ///
    /// # Errors
    /// Returns driver errors, or the context's error if it ends first.
    pub async fn query_prepared(
        &self,
        ctx: &Context,
        prepared: &Prepared,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<Vec<Row>, DbError> {
        let in_flight = self.tracer.query_start(&prepared.sql);
        let result = ctx
            .run(async {
                self.tx
                    .query(&prepared.stmt, params)
                    .await
                    .map_err(DbError::from)
            })
            .await;
        self.tracer
            .query_end(in_flight, Outcome::of(&result, |rows| Some(rows.len() as u64)));
        result
    }

    /// Run a prepared statement and return the affected row count.
    ///
    /// # Errors
    /// Returns driver errors, or the context's error if it ends first.
    pub async fn exec_prepared(
        &self,
        ctx: &Context,
        prepared: &Prepared,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<u64, DbError> {
        let in_flight = self.tracer.query_start(&prepared.sql);
        let result = ctx
            .run(async {
                self.tx
                    .execute(&prepared.stmt, params)
                    .await
                    .map_err(DbError::from)
            })
            .await;
        self.tracer.query_end(in_flight, Outcome::of(&result, |n| Some(*n)));
        result
    }

    async fn commit(self) -> Result<(), DbError> {
        let in_flight = self.tracer.query_start("COMMIT");
        let result = self.tx.commit().await.map_err(DbError::Commit);
        self.tracer.query_end(in_flight, Outcome::of(&result, |_| Some(0)));
        result
    }

    async fn rollback(self) -> Result<(), DbError> {
        let in_flight = self.tracer.query_start("ROLLBACK");
        let result = self.tx.rollback().await.map_err(DbError::from);
        self.tracer.query_end(in_flight, Outcome::of(&result, |_| Some(0)));
        result
    }
}

/// Begin a transaction on `conn`, honoring `options`.
async fn begin<'a>(
    ctx: &Context,
    conn: &'a mut ClientWrapper,
    options: TxOptions,
    tracer: &'a DbTracer,
) -> Result<Tx<'a>, DbError> {
    let mut builder = conn.build_transaction();
    if let Some(level) = options.isolation_level {
        builder = builder.isolation_level(level);
    }
    if let Some(read_only) = options.read_only {
        builder = builder.read_only(read_only);
    }
    if let Some(deferrable) = options.deferrable {
        builder = builder.deferrable(deferrable);
    }

    let in_flight = tracer.query_start("BEGIN");
    let result = ctx
        .run(async { builder.start().await.map_err(DbError::Begin) })
        .await;
    tracer.query_end(in_flight, Outcome::of(&result, |_| Some(0)));
    Ok(Tx { tx: result?, tracer })
}

/// Run `f` inside a transaction and resolve it on every path.
///
/// - `f` returns `Err`: roll back and return that error untouched. A failing
///   rollback is logged, never returned.
/// - `f` returns `Ok`: commit. A failing commit surfaces as `DbError::Commit`.
/// - the future is dropped mid-way: the driver rolls back when the transaction
///   handle drops.
///
/// Commit and rollback are not raced against `ctx`, so an expiring deadline
/// cannot leave the transaction's fate unknown.
pub(crate) async fn run_in_transaction<T, E, F>(
    ctx: &Context,
    conn: &mut ClientWrapper,
    options: TxOptions,
    tracer: &DbTracer,
    f: F,
) -> Result<T, E>
where
    F: for<'c> FnOnce(&'c Context, &'c Tx<'c>) -> BoxFuture<'c, Result<T, E>>,
    E: From<DbError>,
{
    let tx = begin(ctx, conn, options, tracer).await?;

    match f(ctx, &tx).await {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = tx.rollback().await {
                tracing::error!(
                    error = %rollback_err,
                    "rollback failed after transaction function error"
                );
            }
            Err(err)
        }
    }
}
