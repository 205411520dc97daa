//! Integration tests for PgBucketStore.
//! Requires a Postgres instance. Set DATABASE_TEST_URL or these tests are skipped.

use std::time::Duration;

use chrono::Utc;
use cms_ratelimit::{BucketStore, PgBucketStore, RateLimiter};
use sqlx::PgPool;

/// Get a test database pool, or skip if no test DB is available.
async fn test_pool() -> Option<PgPool> {
    let url = std::env::var("DATABASE_TEST_URL").ok()?;
    let pool = PgPool::connect(&url).await.ok()?;

    sqlx::query(
        r#"
        CREATE UNLOGGED TABLE IF NOT EXISTS rate_limit_buckets (
            bucket_key  TEXT         PRIMARY KEY,
            count       BIGINT       NOT NULL,
            expires_at  TIMESTAMPTZ  NOT NULL
        )
        "#,
    )
    .execute(&pool)
    .await
    .ok()?;

    Some(pool)
}

/// Tests share the table, so each one works under its own key prefix.
async fn clear(pool: &PgPool, prefix: &str) {
    sqlx::query("DELETE FROM rate_limit_buckets WHERE bucket_key LIKE $1")
        .bind(format!("{prefix}%"))
        .execute(pool)
        .await
        .unwrap();
}

async fn expires_at(pool: &PgPool, key: &str) -> chrono::DateTime<Utc> {
    sqlx::query_scalar("SELECT expires_at FROM rate_limit_buckets WHERE bucket_key = $1")
        .bind(key)
        .fetch_one(pool)
        .await
        .unwrap()
}

#[tokio::test]
async fn increments_and_keeps_first_expiry() {
    let Some(pool) = test_pool().await else {
        return;
    };
    clear(&pool, "rate:pg-incr:").await;
    let store = PgBucketStore::new(pool.clone());

    assert!(store.is_ready());
    assert_eq!(store.incr_with_expiry("rate:pg-incr:1", 60).await.unwrap(), Some(1));
    let first = expires_at(&pool, "rate:pg-incr:1").await;

    assert_eq!(store.incr_with_expiry("rate:pg-incr:1", 600).await.unwrap(), Some(2));
    assert_eq!(expires_at(&pool, "rate:pg-incr:1").await, first);
}

#[tokio::test]
async fn concurrent_increments_are_not_lost() {
    let Some(pool) = test_pool().await else {
        return;
    };
    clear(&pool, "rate:pg-race:").await;
    let store = PgBucketStore::new(pool);

    let mut tasks = Vec::new();
    for _ in 0..20 {
        let store = store.clone();
        tasks.push(tokio::spawn(async move {
            store.incr_with_expiry("rate:pg-race:1", 60).await.unwrap()
        }));
    }

    let mut counts = Vec::new();
    for task in tasks {
        counts.push(task.await.unwrap().unwrap());
    }
    counts.sort();

    assert_eq!(counts, (1..=20).collect::<Vec<i64>>());
}

#[tokio::test]
async fn expired_row_restarts_and_is_swept() {
    let Some(pool) = test_pool().await else {
        return;
    };
    clear(&pool, "rate:pg-exp:").await;
    let store = PgBucketStore::new(pool.clone());

    store.incr_with_expiry("rate:pg-exp:1", 60).await.unwrap();
    store.incr_with_expiry("rate:pg-exp:1", 60).await.unwrap();
    store.incr_with_expiry("rate:pg-exp:2", 60).await.unwrap();
    sqlx::query("UPDATE rate_limit_buckets SET expires_at = now() - interval '1 second' WHERE bucket_key LIKE 'rate:pg-exp:%'")
        .execute(&pool)
        .await
        .unwrap();

    assert_eq!(store.incr_with_expiry("rate:pg-exp:1", 60).await.unwrap(), Some(1));

    // Sweeps pg-exp:2. Expired rows from other tests may go as well.
    assert!(store.sweep_expired().await.unwrap() >= 1);
    let left: Vec<String> = sqlx::query_scalar(
        "SELECT bucket_key FROM rate_limit_buckets WHERE bucket_key LIKE 'rate:pg-exp:%'",
    )
    .fetch_all(&pool)
    .await
    .unwrap();
    assert_eq!(left, vec!["rate:pg-exp:1".to_string()]);
}

#[tokio::test]
async fn limiter_over_postgres_enforces_limit() {
    let Some(pool) = test_pool().await else {
        return;
    };
    clear(&pool, "rate:pg-limit:").await;
    let limiter = RateLimiter::with_bucket_store(PgBucketStore::new(pool), Duration::from_secs(5));

    let now = Utc::now();
    let mut allowed = Vec::new();
    for _ in 0..4 {
        allowed.push(limiter.hit_at("pg-limit:user:u1", 3, 3600, now).await.allowed);
    }

    assert_eq!(allowed, vec![true, true, true, false]);
    assert!(!limiter.is_degraded());
}

#[tokio::test]
async fn closed_pool_is_not_ready() {
    let Some(pool) = test_pool().await else {
        return;
    };
    let store = PgBucketStore::new(pool.clone());
    pool.close().await;
    assert!(!store.is_ready());
}
