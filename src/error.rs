use deadpool::managed::PoolError;
use thiserror::Error;

use crate::retry::classifier::{Failure, sqlstate};

/// Violations found while validating [`ClientOptions`](crate::config::ClientOptions).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("host is required")]
    MissingHost,

    #[error("database is required")]
    MissingDatabase,

    #[error("username is required")]
    MissingUsername,

    #[error("password is required")]
    MissingPassword,

    #[error("port must be between 1 and 65535, got {0}")]
    InvalidPort(u16),

    #[error("max_conns must be at least 1, got {0}")]
    InvalidMaxConns(i64),

    #[error("min_conns must not be negative, got {0}")]
    InvalidMinConns(i64),

    #[error("min_conns ({min}) cannot exceed max_conns ({max})")]
    MinGreaterThanMax { min: i64, max: i64 },

    #[error("invalid sslmode {0:?}: expected one of disable, allow, prefer, require, verify-ca, verify-full")]
    InvalidSslMode(String),

    #[error("cannot render connection string: {0}")]
    InvalidDsn(String),
}

#[derive(Debug, Error)]
pub enum DbError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Postgres(#[from] tokio_postgres::Error),

    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("{field} value {value} exceeds int32 limit")]
    PoolLimit { field: &'static str, value: i64 },

    #[error("failed to begin transaction: {0}")]
    Begin(#[source] tokio_postgres::Error),

    #[error("failed to commit transaction: {0}")]
    Commit(#[source] tokio_postgres::Error),

    #[error("query returned no rows")]
    NoRows,

    #[error("operation cancelled by caller")]
    Cancelled,

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("client is closed")]
    Closed,
}

impl DbError {
    /// SQLSTATE reported by the server, if this error carries one.
    #[must_use]
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            DbError::Postgres(err) | DbError::Begin(err) | DbError::Commit(err) => {
                err.code().map(tokio_postgres::error::SqlState::code)
            }
            _ => None,
        }
    }

    /// Short, stable label used as the `error.type` telemetry attribute.
    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match self {
            DbError::Config(_) => "config",
            DbError::Postgres(_) => "postgres",
            DbError::Pool(_) => "pool",
            DbError::PoolLimit { .. } => "pool_limit",
            DbError::Begin(_) => "begin",
            DbError::Commit(_) => "commit",
            DbError::NoRows => "no_rows",
            DbError::Cancelled => "cancelled",
            DbError::DeadlineExceeded => "deadline_exceeded",
            DbError::Closed => "closed",
        }
    }

    /// Reduce the error to the shape the retry classifier inspects.
    ///
    /// tokio-postgres reports a dropped socket without a SQLSTATE, so a closed
    /// connection is classified as `connection_does_not_exist`.
    #[must_use]
    pub fn failure(&self) -> Failure<'_> {
        match self {
            DbError::Cancelled => Failure::Cancelled,
            DbError::DeadlineExceeded => Failure::DeadlineExceeded,
            other => match other.sqlstate() {
                Some(code) => Failure::SqlState(code),
                None => match other {
                    DbError::Postgres(err) if err.is_closed() => {
                        Failure::SqlState(sqlstate::CONNECTION_DOES_NOT_EXIST)
                    }
                    _ => Failure::Other,
                },
            },
        }
    }
}

impl From<PoolError<DbError>> for DbError {
    fn from(err: PoolError<DbError>) -> Self {
        match err {
            PoolError::Backend(inner) => inner,
            PoolError::Closed => DbError::Closed,
            other => DbError::Pool(other.to_string()),
        }
    }
}
