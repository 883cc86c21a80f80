//! Client behavior that needs no running server: construction errors,
//! context handling and shutdown.

use std::time::Duration;

use pg_middleware::prelude::*;
use pg_middleware::retry::RetryScope;
use pg_middleware::{CancellationToken, ConfigError};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// Nothing listens here; none of these tests should ever dial it.
fn offline_options() -> ClientOptions {
    ClientOptions::new("127.0.0.1", "ledger", "svc", "secret")
        .with_port(1)
        .with_ssl_mode("disable")
        .with_pool_size(2, 0)
}

#[test]
fn test04_invalid_options_fail_construction() {
    let err = Client::new(offline_options().with_pool_size(2, 3)).unwrap_err();
    assert!(matches!(
        err,
        DbError::Config(ConfigError::MinGreaterThanMax { min: 3, max: 2 })
    ));
}

#[test]
fn test04_pool_bounds_beyond_int32_are_rejected() {
    let err = Client::new(offline_options().with_pool_size(2_147_483_648, 0)).unwrap_err();
    assert!(matches!(err, DbError::PoolLimit { field: "max_conns", .. }));
    assert!(err.to_string().contains("exceeds int32 limit"), "{err}");

    let err = Client::new(offline_options().with_pool_size(4_294_967_296, 4_294_967_296)).unwrap_err();
    assert!(matches!(err, DbError::PoolLimit { .. }));
}

#[tokio::test]
async fn test04_cancelled_context_short_circuits_every_call() {
    init_tracing();
    let client = Client::new(offline_options()).unwrap();
    let token = CancellationToken::new();
    let ctx = Context::with_cancellation(token.clone());
    token.cancel();

    assert!(matches!(client.query(&ctx, "SELECT 1", &[]).await, Err(DbError::Cancelled)));
    assert!(matches!(client.query_row(&ctx, "SELECT 1", &[]).await, Err(DbError::Cancelled)));
    assert!(matches!(client.exec(&ctx, "DELETE FROM t", &[]).await, Err(DbError::Cancelled)));
    assert!(matches!(client.ping(&ctx).await, Err(DbError::Cancelled)));

    let res = client
        .with_tx(&ctx, |_ctx, _tx| Box::pin(async { Ok::<_, DbError>(()) }))
        .await;
    assert!(matches!(res, Err(DbError::Cancelled)));
    assert_eq!(client.stats().size, 0);
    assert_eq!(client.stats().max_size, 2);
}

#[tokio::test]
async fn test04_expired_deadline_is_reported() {
    let client = Client::new(offline_options()).unwrap();
    let ctx = Context::background().with_timeout(Duration::ZERO);
    assert!(matches!(
        client.query(&ctx, "SELECT 1", &[]).await,
        Err(DbError::DeadlineExceeded)
    ));
    assert!(matches!(
        client.exec(&ctx, "UPDATE t SET x = 1", &[]).await,
        Err(DbError::DeadlineExceeded)
    ));
}

#[tokio::test]
async fn test04_huge_query_timeout_is_not_a_deadline() {
    let client = Client::new(offline_options().with_query_timeout(Duration::MAX).without_retry()).unwrap();
    let ctx = Context::background();
    ctx.cancel();
    assert!(matches!(client.query(&ctx, "SELECT 1", &[]).await, Err(DbError::Cancelled)));
    assert!(matches!(client.exec(&ctx, "DELETE FROM t", &[]).await, Err(DbError::Cancelled)));

    let closed = Client::new(offline_options().with_query_timeout(Duration::MAX)).unwrap();
    closed.close();
    let res = closed.query(&Context::background(), "SELECT 1", &[]).await;
    assert!(matches!(res, Err(DbError::Closed)));
}

#[tokio::test]
async fn test04_close_is_idempotent_and_final() {
    init_tracing();
    let client = Client::new(offline_options()).unwrap();
    let clone = client.clone();
    assert!(!client.is_closed());

    client.close();
    client.close();
    assert!(clone.is_closed());

    let ctx = Context::background();
    assert!(matches!(clone.query(&ctx, "SELECT 1", &[]).await, Err(DbError::Closed)));
    assert!(matches!(clone.exec(&ctx, "SELECT 1", &[]).await, Err(DbError::Closed)));
    assert!(matches!(clone.ping(&ctx).await, Err(DbError::Closed)));
}

#[tokio::test]
async fn test04_empty_batch_needs_no_connection() {
    let client = Client::new(offline_options()).unwrap();
    client.close();
    let counts = client.send_batch(&Context::background(), &Batch::new()).await.unwrap();
    assert!(counts.is_empty());
}

#[test]
fn test04_builder_carries_policy_and_tracer_config() {
    let policy = RetryPolicy::empty().with_rule("40001", RetryScope::ReadsAndWrites);
    let client = Client::builder(offline_options())
        .retry_policy(policy.clone())
        .tracer_config(TracerConfig::default().with_query_text(true))
        .build()
        .unwrap();
    assert_eq!(client.retry_policy(), &policy);
    assert!(client.tracer().config().include_query_text);
    assert_eq!(client.options().database, "ledger");
    assert_eq!(client.max_attempts(), 3);
}
