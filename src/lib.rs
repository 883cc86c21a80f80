//! Resilient, instrumented PostgreSQL access.
//!
//! A [`Client`] owns a bounded `deadpool` pool of `tokio-postgres`
//! connections. Reads are retried on transient failures, writes never are,
//! transactions are always committed or rolled back, and every statement is
//! traced and measured through OpenTelemetry without any call-site code.
//!
//! ```no_run
//! use pg_middleware::prelude::*;
//!
//! # async fn demo() -> Result<(), DbError> {
//! let options = ClientOptions::new("localhost", "ledger", "app", "secret").with_ssl_mode("disable");
//! let client = Client::new(options)?;
//! let ctx = Context::background();
//!
//! client.exec(&ctx, "INSERT INTO accounts (name) VALUES ($1)", &[&"alice"]).await?;
//! let row = client.query_row(&ctx, "SELECT count(*) FROM accounts", &[]).await?;
//! let count: i64 = row.get(0);
//! # let _ = count;
//! client.close();
//! # Ok(())
//! # }
//! ```

pub mod batch;
pub mod client;
pub mod config;
pub mod context;
pub mod error;
pub mod pool;
pub mod prelude;
pub mod retry;
pub mod telemetry;
pub mod transaction;

#[cfg(feature = "test-utils")]
pub mod test_utils;

pub use batch::Batch;
pub use client::{Client, ClientBuilder};
pub use config::{ClientOptions, SslMode};
pub use context::Context;
pub use error::{ConfigError, DbError};
pub use transaction::{Prepared, Tx, TxOptions};

pub use tokio_postgres::types::ToSql;
pub use tokio_postgres::{IsolationLevel, Row};
pub use tokio_util::sync::CancellationToken;
