//! Convenient imports for common functionality.
//!
//! ```
//! use pg_middleware::prelude::*;
//! ```

pub use crate::batch::Batch;
pub use crate::client::Client;
pub use crate::config::ClientOptions;
pub use crate::context::Context;
pub use crate::error::{ConfigError, DbError};
pub use crate::retry::{OperationClass, RetryPolicy};
pub use crate::telemetry::TracerConfig;
pub use crate::transaction::{Tx, TxOptions};

pub use tokio_postgres::types::ToSql;
pub use tokio_postgres::{IsolationLevel, Row};
