use std::fmt;
use std::time::{Duration, SystemTime};

use opentelemetry::global::{self, BoxedTracer};
use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::trace::{Span, SpanKind, Status, Tracer};
use opentelemetry::KeyValue;

use super::sql;
use super::{
    BatchObserver, ConnectObserver, InFlight, Outcome, PrepareObserver, QueryMetadata,
    QueryObserver,
};
use crate::config::ClientOptions;
use crate::retry::OperationClass;

/// Name of the tracer and meter this crate registers with OpenTelemetry.
pub const INSTRUMENTATION_NAME: &str = "pg-middleware";

/// OpenTelemetry attribute keys.
pub mod attributes {
    pub const DB_SYSTEM_NAME: &str = "db.system.name";
    pub const SERVER_ADDRESS: &str = "server.address";
    pub const SERVER_PORT: &str = "server.port";
    pub const DB_NAMESPACE: &str = "db.namespace";
    pub const DB_OPERATION_NAME: &str = "db.operation.name";
    pub const DB_COLLECTION_NAME: &str = "db.collection.name";
    pub const DB_QUERY_TEXT: &str = "db.query.text";
    pub const DB_BATCH_SIZE: &str = "db.operation.batch.size";
    pub const DB_RESPONSE_STATUS_CODE: &str = "db.response.status_code";
    pub const DB_RETURNED_ROWS: &str = "db.response.returned_rows";
    pub const ERROR_TYPE: &str = "error.type";
    pub const RETRY_CLASS: &str = "db.retry.class";

    pub const DB_SYSTEM: &str = "postgresql";
    pub const STATUS_OK: &str = "OK";
}

use attributes::*;

#[derive(Debug, Clone, Default)]
pub struct TracerConfig {
    /// Attach the raw statement as `db.query.text` on spans. Off by default
    /// since statements can embed literal values.
    pub include_query_text: bool,
}

impl TracerConfig {
    #[must_use]
    pub fn with_query_text(mut self, include: bool) -> Self {
        self.include_query_text = include;
        self
    }
}

struct Instruments {
    operation_duration: Histogram<f64>,
    returned_rows: Histogram<u64>,
    connection_create_time: Histogram<f64>,
    pool_create_time: Histogram<f64>,
    retries: Counter<u64>,
}

impl Instruments {
    fn new(meter: &Meter) -> Self {
        Self {
            operation_duration: meter
                .f64_histogram("db.client.operation.duration")
                .with_unit("s")
                .with_description("Duration of database client operations")
                .build(),
            returned_rows: meter
                .u64_histogram("db.client.response.returned_rows")
                .with_unit("{row}")
                .with_description("Rows returned or affected by database operations")
                .build(),
            connection_create_time: meter
                .f64_histogram("db.client.connection.create_time")
                .with_unit("s")
                .with_description("Time taken to open a new connection")
                .build(),
            pool_create_time: meter
                .f64_histogram("db.client.pool.create_time")
                .with_unit("s")
                .with_description("Time taken to construct the connection pool")
                .build(),
            retries: meter
                .u64_counter("db.client.operation.retries")
                .with_unit("{retry}")
                .with_description("Operations re-attempted after a retryable failure")
                .build(),
        }
    }
}

/// Tracer and metrics recorder for one database.
///
/// Holds instrument handles and the static server attributes; immutable after
/// construction and shared across concurrent calls without locking.
pub struct DbTracer {
    tracer: BoxedTracer,
    instruments: Instruments,
    static_attributes: Vec<KeyValue>,
    config: TracerConfig,
}

impl fmt::Debug for DbTracer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbTracer")
            .field("static_attributes", &self.static_attributes)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Attributes and values produced when a call ends.
#[derive(Debug, Default)]
pub(crate) struct OutcomeRecord {
    pub(crate) span_attributes: Vec<KeyValue>,
    pub(crate) metric_attributes: Vec<KeyValue>,
    pub(crate) returned_rows: Option<u64>,
    pub(crate) error: Option<String>,
}

fn status_attributes(outcome: Outcome<'_>) -> Vec<KeyValue> {
    match outcome {
        Outcome::Success { .. } => vec![KeyValue::new(DB_RESPONSE_STATUS_CODE, STATUS_OK)],
        Outcome::Failure(err) => {
            let mut attrs = vec![KeyValue::new(ERROR_TYPE, err.kind_name())];
            if let Some(code) = err.sqlstate() {
                attrs.push(KeyValue::new(DB_RESPONSE_STATUS_CODE, code.to_string()));
            }
            attrs
        }
    }
}

/// Metric attributes leave out the statement text to keep cardinality bounded.
fn metric_attributes(metadata: &QueryMetadata) -> Vec<KeyValue> {
    metadata
        .attributes()
        .iter()
        .filter(|kv| kv.key.as_str() != DB_QUERY_TEXT)
        .cloned()
        .collect()
}

pub(crate) fn describe_outcome(metadata: &QueryMetadata, outcome: Outcome<'_>) -> OutcomeRecord {
    let status = status_attributes(outcome);
    let mut record = OutcomeRecord {
        span_attributes: status.clone(),
        metric_attributes: metric_attributes(metadata),
        ..OutcomeRecord::default()
    };
    record.metric_attributes.extend(status);

    match outcome {
        Outcome::Success { rows: Some(rows) } if !sql::is_row_count_denylisted(metadata.operation()) => {
            record.span_attributes.push(KeyValue::new(
                DB_RETURNED_ROWS,
                i64::from(sql::clamp_row_count(rows)),
            ));
            record.returned_rows = Some(rows);
        }
        Outcome::Success { .. } => {}
        Outcome::Failure(err) => record.error = Some(err.to_string()),
    }
    record
}

impl DbTracer {
    /// Tracer for the database described by `options`, using the globally
    /// installed OpenTelemetry providers.
    #[must_use]
    pub fn new(options: &ClientOptions, config: TracerConfig) -> Self {
        let meter = global::meter(INSTRUMENTATION_NAME);
        Self::with_providers(global::tracer(INSTRUMENTATION_NAME), &meter, options, config)
    }

    #[must_use]
    pub fn with_providers(
        tracer: BoxedTracer,
        meter: &Meter,
        options: &ClientOptions,
        config: TracerConfig,
    ) -> Self {
        let static_attributes = vec![
            KeyValue::new(DB_SYSTEM_NAME, DB_SYSTEM),
            KeyValue::new(SERVER_ADDRESS, options.host.clone()),
            KeyValue::new(SERVER_PORT, i64::from(options.port)),
            KeyValue::new(DB_NAMESPACE, options.database.clone()),
        ];
        Self {
            tracer,
            instruments: Instruments::new(meter),
            static_attributes,
            config,
        }
    }

    #[must_use]
    pub fn static_attributes(&self) -> &[KeyValue] {
        &self.static_attributes
    }

    #[must_use]
    pub fn config(&self) -> &TracerConfig {
        &self.config
    }

    /// Static, operation and (optionally) statement attributes for `metadata`.
    fn decorate(&self, metadata: QueryMetadata, sql: Option<&str>) -> QueryMetadata {
        let mut attrs = self.static_attributes.clone();
        if !metadata.operation().is_empty() {
            attrs.push(KeyValue::new(DB_OPERATION_NAME, metadata.operation().to_string()));
        }
        if !metadata.table().is_empty() {
            attrs.push(KeyValue::new(DB_COLLECTION_NAME, metadata.table().to_string()));
        }
        if let Some(sql) = sql.filter(|_| self.config.include_query_text) {
            attrs.push(KeyValue::new(DB_QUERY_TEXT, sql.to_string()));
        }
        metadata.with_attributes(attrs)
    }

    fn open(&self, metadata: QueryMetadata) -> InFlight {
        let span = self
            .tracer
            .span_builder(metadata.span_name().to_string())
            .with_kind(SpanKind::Client)
            .with_start_time(metadata.started_at())
            .with_attributes(metadata.attributes().to_vec())
            .start(&self.tracer);
        InFlight::new(metadata, Some(span))
    }

    /// End the span and record the duration from one clock reading.
    fn close(&self, in_flight: InFlight, outcome: Outcome<'_>) {
        let (metadata, span) = in_flight.into_parts();
        let record = describe_outcome(&metadata, outcome);

        let now = SystemTime::now();
        let elapsed = metadata.elapsed_at(now);
        if let Some(mut span) = span {
            for attribute in record.span_attributes {
                span.set_attribute(attribute);
            }
            if let Some(message) = record.error {
                span.set_status(Status::error(message));
            }
            span.end_with_timestamp(now);
        }

        self.instruments
            .operation_duration
            .record(elapsed.as_secs_f64(), &record.metric_attributes);
        if let Some(rows) = record.returned_rows {
            self.instruments
                .returned_rows
                .record(rows, &record.metric_attributes);
        }
    }

    /// Record how long building the pool took.
    pub fn record_pool_created(&self, elapsed: Duration) {
        self.instruments
            .pool_create_time
            .record(elapsed.as_secs_f64(), &self.static_attributes);
    }

    /// Count a re-attempt of `sql`.
    pub fn record_retry(&self, sql: &str, class: OperationClass) {
        let mut attrs = self.static_attributes.clone();
        attrs.push(KeyValue::new(DB_OPERATION_NAME, sql::extract_operation_name(sql)));
        attrs.push(KeyValue::new(RETRY_CLASS, class.to_string()));
        self.instruments.retries.add(1, &attrs);
    }
}

impl QueryObserver for DbTracer {
    fn query_start(&self, sql: &str) -> InFlight {
        self.open(self.decorate(QueryMetadata::from_sql(sql), Some(sql)))
    }

    fn query_end(&self, in_flight: InFlight, outcome: Outcome<'_>) {
        self.close(in_flight, outcome);
    }
}

impl BatchObserver for DbTracer {
    fn batch_start(&self, size: usize) -> InFlight {
        let size = i64::try_from(size).unwrap_or(i64::MAX);
        let metadata = self
            .decorate(QueryMetadata::new("BATCH", ""), None)
            .with_attribute(KeyValue::new(DB_BATCH_SIZE, size));
        self.open(metadata)
    }

    fn batch_query(&self, _batch: &InFlight, sql: &str, outcome: Outcome<'_>) {
        let metadata = self.decorate(QueryMetadata::from_sql(sql), None);
        if let Some(rows) = describe_outcome(&metadata, outcome).returned_rows {
            let mut attrs = metric_attributes(&metadata);
            attrs.extend(status_attributes(outcome));
            self.instruments.returned_rows.record(rows, &attrs);
        }
    }

    fn batch_end(&self, in_flight: InFlight, outcome: Outcome<'_>) {
        // Row counts were recorded per statement; only the duration belongs here.
        let outcome = match outcome {
            Outcome::Success { .. } => Outcome::done(),
            failure @ Outcome::Failure(_) => failure,
        };
        self.close(in_flight, outcome);
    }
}

impl ConnectObserver for DbTracer {
    fn connect_start(&self) -> QueryMetadata {
        self.decorate(QueryMetadata::new("CONNECT", ""), None)
    }

    fn connect_end(&self, metadata: QueryMetadata, outcome: Outcome<'_>) {
        let record = describe_outcome(&metadata, outcome);
        let elapsed = metadata.elapsed_at(SystemTime::now());
        self.instruments
            .connection_create_time
            .record(elapsed.as_secs_f64(), &record.metric_attributes);
    }
}

impl PrepareObserver for DbTracer {
    fn prepare_start(&self, sql: &str) -> InFlight {
        let metadata = QueryMetadata::new("PREPARE", sql::extract_table_name(sql));
        self.open(self.decorate(metadata, Some(sql)))
    }

    fn prepare_end(&self, in_flight: InFlight, outcome: Outcome<'_>) {
        self.close(in_flight, outcome);
    }
}
