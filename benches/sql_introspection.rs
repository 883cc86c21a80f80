//! Criterion measurements of the per-statement telemetry overhead: SQL
//! introspection plus a full start/end hook pair against the no-op global
//! OpenTelemetry providers.

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use pg_middleware::ClientOptions;
use pg_middleware::telemetry::sql::{extract_operation_name, extract_table_name};
use pg_middleware::telemetry::{DbTracer, Outcome, QueryObserver, TracerConfig};

const STATEMENTS: &[(&str, &str)] = &[
    ("point_select", "SELECT id, name, balance FROM accounts WHERE id = $1"),
    (
        "multiline_insert",
        "INSERT INTO ledger_entries\n  (account_id, amount, memo)\nVALUES ($1, $2, $3)\nRETURNING id",
    ),
    ("update", "UPDATE budgets SET amount = amount - $1 WHERE id = $2"),
    (
        "cte",
        "WITH recent AS (SELECT * FROM ledger_entries WHERE created_at > now() - interval '1 day') \
         SELECT account_id, sum(amount) FROM recent GROUP BY account_id",
    ),
    ("no_table", "SELECT 1"),
];

fn bench_introspection(c: &mut Criterion) {
    let mut group = c.benchmark_group("sql_introspection");
    for (name, sql) in STATEMENTS {
        group.throughput(Throughput::Bytes(sql.len() as u64));
        group.bench_with_input(BenchmarkId::new("operation_and_table", name), sql, |b, sql| {
            b.iter(|| {
                let op = extract_operation_name(black_box(sql));
                let table = extract_table_name(black_box(sql));
                black_box((op, table))
            });
        });
    }
    group.finish();
}

fn bench_query_hooks(c: &mut Criterion) {
    let options = ClientOptions::new("localhost", "bench", "bench", "bench");
    let plain = DbTracer::new(&options, TracerConfig::default());
    let with_text = DbTracer::new(&options, TracerConfig::default().with_query_text(true));

    let mut group = c.benchmark_group("query_hooks");
    for (label, tracer) in [("default", &plain), ("with_query_text", &with_text)] {
        group.bench_function(label, |b| {
            b.iter(|| {
                let in_flight = tracer.query_start(black_box(STATEMENTS[0].1));
                tracer.query_end(in_flight, Outcome::rows(1));
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_introspection, bench_query_hooks);
criterion_main!(benches);
