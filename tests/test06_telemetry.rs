//! What the tracer actually exports, read back through in-memory providers.

use std::time::Duration;

use opentelemetry::KeyValue;
use opentelemetry::global::BoxedTracer;
use opentelemetry::metrics::MeterProvider as _;
use opentelemetry::trace::{SpanKind, TracerProvider as _};
use opentelemetry_sdk::export::trace::SpanData;
use opentelemetry_sdk::metrics::data::{Histogram, ResourceMetrics};
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use opentelemetry_sdk::runtime;
use opentelemetry_sdk::testing::metrics::InMemoryMetricExporter;
use opentelemetry_sdk::testing::trace::InMemorySpanExporter;
use opentelemetry_sdk::trace::TracerProvider;

use pg_middleware::telemetry::attributes::{
    DB_BATCH_SIZE, DB_OPERATION_NAME, DB_RETURNED_ROWS, ERROR_TYPE,
};
use pg_middleware::telemetry::{
    BatchObserver, ConnectObserver, DbTracer, INSTRUMENTATION_NAME, Outcome, PrepareObserver,
    QueryObserver, TracerConfig,
};
use pg_middleware::{ClientOptions, DbError};

const OPERATION_DURATION: &str = "db.client.operation.duration";
const RETURNED_ROWS: &str = "db.client.response.returned_rows";
const CONNECTION_CREATE_TIME: &str = "db.client.connection.create_time";

struct Recorder {
    spans: InMemorySpanExporter,
    metrics: InMemoryMetricExporter,
    meter_provider: SdkMeterProvider,
    _tracer_provider: TracerProvider,
    tracer: DbTracer,
}

impl Recorder {
    fn new() -> Self {
        let spans = InMemorySpanExporter::default();
        let tracer_provider = TracerProvider::builder()
            .with_simple_exporter(spans.clone())
            .build();

        let metrics = InMemoryMetricExporter::default();
        let reader = PeriodicReader::builder(metrics.clone(), runtime::Tokio).build();
        let meter_provider = SdkMeterProvider::builder().with_reader(reader).build();

        let options = ClientOptions::new("db.internal", "ledger", "svc", "pw");
        let tracer = DbTracer::with_providers(
            BoxedTracer::new(Box::new(tracer_provider.tracer(INSTRUMENTATION_NAME))),
            &meter_provider.meter(INSTRUMENTATION_NAME),
            &options,
            TracerConfig::default(),
        );
        Self {
            spans,
            metrics,
            meter_provider,
            _tracer_provider: tracer_provider,
            tracer,
        }
    }

    fn finished_spans(&self) -> Vec<SpanData> {
        self.spans.get_finished_spans().unwrap()
    }

    // Cumulative export: call once per test.
    fn flush_metrics(&self) -> Vec<ResourceMetrics> {
        self.meter_provider.force_flush().unwrap();
        self.metrics.get_finished_metrics().unwrap()
    }
}

struct Point<T> {
    attributes: Vec<KeyValue>,
    count: u64,
    sum: T,
}

fn points<T: Copy + 'static>(exported: &[ResourceMetrics], name: &str) -> Vec<Point<T>> {
    exported
        .iter()
        .flat_map(|rm| &rm.scope_metrics)
        .flat_map(|sm| &sm.metrics)
        .filter(|m| m.name == name)
        .filter_map(|m| m.data.as_any().downcast_ref::<Histogram<T>>())
        .flat_map(|h| &h.data_points)
        .map(|dp| Point {
            attributes: dp.attributes.clone(),
            count: dp.count,
            sum: dp.sum,
        })
        .collect()
}

fn text(attrs: &[KeyValue], key: &str) -> Option<String> {
    attrs
        .iter()
        .find(|kv| kv.key.as_str() == key)
        .map(|kv| kv.value.as_str().into_owned())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test06_span_and_duration_metric_share_one_clock() {
    let recorder = Recorder::new();
    let in_flight = recorder.tracer.query_start("SELECT * FROM accounts WHERE id = $1");
    tokio::time::sleep(Duration::from_millis(5)).await;
    recorder.tracer.query_end(in_flight, Outcome::rows(2));

    let spans = recorder.finished_spans();
    assert_eq!(spans.len(), 1);
    let span = &spans[0];
    assert_eq!(span.name, "SELECT accounts");
    assert_eq!(span.span_kind, SpanKind::Client);
    assert_eq!(text(&span.attributes, DB_RETURNED_ROWS).as_deref(), Some("2"));
    let span_secs = span
        .end_time
        .duration_since(span.start_time)
        .unwrap()
        .as_secs_f64();
    assert!(span_secs >= 0.005, "{span_secs}");

    let metrics = recorder.flush_metrics();
    let durations = points::<f64>(&metrics, OPERATION_DURATION);
    assert_eq!(durations.len(), 1);
    assert_eq!(durations[0].count, 1);
    assert_eq!(durations[0].sum, span_secs);

    let rows = points::<u64>(&metrics, RETURNED_ROWS);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].sum, 2);
    assert_eq!(text(&rows[0].attributes, DB_OPERATION_NAME).as_deref(), Some("SELECT"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test06_batch_records_duration_once_and_rows_per_statement() {
    let recorder = Recorder::new();
    let batch = recorder.tracer.batch_start(2);
    recorder
        .tracer
        .batch_query(&batch, "INSERT INTO accounts VALUES (1, 'alice')", Outcome::rows(1));
    recorder
        .tracer
        .batch_query(&batch, "UPDATE accounts SET name = upper(name)", Outcome::rows(3));
    recorder.tracer.batch_end(batch, Outcome::done());

    let spans = recorder.finished_spans();
    assert_eq!(spans.len(), 1);
    assert_eq!(spans[0].name, "BATCH");
    assert_eq!(text(&spans[0].attributes, DB_BATCH_SIZE).as_deref(), Some("2"));
    assert!(text(&spans[0].attributes, DB_RETURNED_ROWS).is_none());

    let metrics = recorder.flush_metrics();
    let durations = points::<f64>(&metrics, OPERATION_DURATION);
    assert_eq!(durations.len(), 1);
    assert_eq!(durations[0].count, 1);
    assert_eq!(text(&durations[0].attributes, DB_BATCH_SIZE).as_deref(), Some("2"));
    assert_eq!(text(&durations[0].attributes, DB_OPERATION_NAME).as_deref(), Some("BATCH"));

    let rows = points::<u64>(&metrics, RETURNED_ROWS);
    assert_eq!(rows.len(), 2);
    assert_eq!(rows.iter().map(|p| p.count).sum::<u64>(), 2);
    assert_eq!(rows.iter().map(|p| p.sum).sum::<u64>(), 4);
    assert!(rows.iter().all(|p| text(&p.attributes, DB_BATCH_SIZE).is_none()));
    let mut operations: Vec<_> = rows
        .iter()
        .filter_map(|p| text(&p.attributes, DB_OPERATION_NAME))
        .collect();
    operations.sort();
    assert_eq!(operations, ["INSERT", "UPDATE"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test06_connect_hooks_record_create_time_without_spans() {
    let recorder = Recorder::new();
    let ok = recorder.tracer.connect_start();
    recorder.tracer.connect_end(ok, Outcome::done());
    let failed = recorder.tracer.connect_start();
    recorder.tracer.connect_end(failed, Outcome::Failure(&DbError::Closed));

    assert!(recorder.finished_spans().is_empty());

    let metrics = recorder.flush_metrics();
    let created = points::<f64>(&metrics, CONNECTION_CREATE_TIME);
    assert_eq!(created.iter().map(|p| p.count).sum::<u64>(), 2);
    assert!(created
        .iter()
        .all(|p| text(&p.attributes, DB_OPERATION_NAME).as_deref() == Some("CONNECT")));
    assert!(created.iter().any(|p| text(&p.attributes, ERROR_TYPE).is_some()));
    assert!(points::<f64>(&metrics, OPERATION_DURATION).is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test06_denylisted_operations_add_no_row_points() {
    let recorder = Recorder::new();
    for sql in ["BEGIN", "COMMIT", "ROLLBACK"] {
        let in_flight = recorder.tracer.query_start(sql);
        recorder.tracer.query_end(in_flight, Outcome::rows(1));
    }
    let prepare = recorder.tracer.prepare_start("SELECT * FROM accounts WHERE id = $1");
    recorder.tracer.prepare_end(prepare, Outcome::rows(4));

    let spans = recorder.finished_spans();
    assert_eq!(spans.len(), 4);
    assert!(spans
        .iter()
        .all(|s| text(&s.attributes, DB_RETURNED_ROWS).is_none()));
    assert!(spans.iter().any(|s| s.name == "PREPARE accounts"));

    let metrics = recorder.flush_metrics();
    assert!(points::<u64>(&metrics, RETURNED_ROWS).is_empty());
    let durations = points::<f64>(&metrics, OPERATION_DURATION);
    assert_eq!(durations.iter().map(|p| p.count).sum::<u64>(), 4);
}
