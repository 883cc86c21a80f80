//! Spans and metrics around every database call.
//!
//! Instrumentation is split into four narrow observer traits so each call
//! site depends only on the hooks it fires. [`DbTracer`] implements all four.
//!
//! A start hook returns the call's own [`InFlight`] handle (metadata plus the
//! open span). The caller passes it back to the matching end hook, so nothing
//! per-call is ever shared between concurrent calls.

pub mod sql;
mod tracer;

use std::fmt;
use std::time::{Duration, SystemTime};

use opentelemetry::KeyValue;
use opentelemetry::global::BoxedSpan;

use crate::error::DbError;

pub use tracer::{DbTracer, INSTRUMENTATION_NAME, TracerConfig, attributes};

/// Immutable description of one in-progress operation.
///
/// Late attributes (a batch size, say) are added with
/// [`QueryMetadata::with_attribute`], which returns a new value.
#[derive(Debug, Clone)]
pub struct QueryMetadata {
    started_at: SystemTime,
    operation: String,
    table: String,
    span_name: String,
    attributes: Vec<KeyValue>,
}

impl QueryMetadata {
    /// Metadata for a fixed operation such as `CONNECT`, started now.
    pub fn new(operation: impl Into<String>, table: impl Into<String>) -> Self {
        let operation = operation.into();
        let table = table.into();
        Self {
            started_at: SystemTime::now(),
            span_name: sql::span_name(&operation, &table),
            operation,
            table,
            attributes: Vec::new(),
        }
    }

    /// Metadata derived from SQL text, started now.
    #[must_use]
    pub fn from_sql(sql: &str) -> Self {
        Self::new(sql::extract_operation_name(sql), sql::extract_table_name(sql))
    }

    #[must_use]
    pub fn with_attribute(self, attribute: KeyValue) -> Self {
        self.with_attributes([attribute])
    }

    #[must_use]
    pub fn with_attributes(self, extra: impl IntoIterator<Item = KeyValue>) -> Self {
        let mut attributes = self.attributes;
        attributes.extend(extra);
        Self { attributes, ..self }
    }

    #[must_use]
    pub fn started_at(&self) -> SystemTime {
        self.started_at
    }

    #[must_use]
    pub fn operation(&self) -> &str {
        &self.operation
    }

    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }

    #[must_use]
    pub fn span_name(&self) -> &str {
        &self.span_name
    }

    #[must_use]
    pub fn attributes(&self) -> &[KeyValue] {
        &self.attributes
    }

    /// Time from start to `now`; zero if the clock stepped backwards.
    #[must_use]
    pub fn elapsed_at(&self, now: SystemTime) -> Duration {
        now.duration_since(self.started_at).unwrap_or_default()
    }
}

/// Metadata and (for every family except connect) the open span of a call.
pub struct InFlight {
    metadata: QueryMetadata,
    span: Option<BoxedSpan>,
}

impl InFlight {
    #[must_use]
    pub fn new(metadata: QueryMetadata, span: Option<BoxedSpan>) -> Self {
        Self { metadata, span }
    }

    #[must_use]
    pub fn metadata(&self) -> &QueryMetadata {
        &self.metadata
    }

    #[must_use]
    pub fn has_span(&self) -> bool {
        self.span.is_some()
    }

    pub(crate) fn into_parts(self) -> (QueryMetadata, Option<BoxedSpan>) {
        (self.metadata, self.span)
    }
}

impl fmt::Debug for InFlight {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InFlight")
            .field("metadata", &self.metadata)
            .field("span", &self.span.as_ref().map(|_| "<span>"))
            .finish()
    }
}

/// How an observed operation ended.
#[derive(Debug, Clone, Copy)]
pub enum Outcome<'a> {
    /// `rows` is the returned or affected row count when the driver reports one.
    Success { rows: Option<u64> },
    Failure(&'a DbError),
}

impl<'a> Outcome<'a> {
    #[must_use]
    pub fn done() -> Self {
        Outcome::Success { rows: None }
    }

    #[must_use]
    pub fn rows(rows: u64) -> Self {
        Outcome::Success { rows: Some(rows) }
    }

    /// Describe `result`, reading the row count from the success value.
    pub fn of<T>(result: &'a Result<T, DbError>, rows: impl FnOnce(&T) -> Option<u64>) -> Self {
        match result {
            Ok(value) => Outcome::Success { rows: rows(value) },
            Err(err) => Outcome::Failure(err),
        }
    }
}

pub trait QueryObserver: Send + Sync {
    fn query_start(&self, sql: &str) -> InFlight;
    fn query_end(&self, in_flight: InFlight, outcome: Outcome<'_>);
}

pub trait BatchObserver: Send + Sync {
    fn batch_start(&self, size: usize) -> InFlight;
    /// Called once per statement; records row counts only.
    fn batch_query(&self, batch: &InFlight, sql: &str, outcome: Outcome<'_>);
    fn batch_end(&self, in_flight: InFlight, outcome: Outcome<'_>);
}

/// Connection establishment. Never opens spans.
pub trait ConnectObserver: Send + Sync {
    fn connect_start(&self) -> QueryMetadata;
    fn connect_end(&self, metadata: QueryMetadata, outcome: Outcome<'_>);
}

pub trait PrepareObserver: Send + Sync {
    fn prepare_start(&self, sql: &str) -> InFlight;
    fn prepare_end(&self, in_flight: InFlight, outcome: Outcome<'_>);
}
