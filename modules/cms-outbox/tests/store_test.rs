//! Integration tests for PgOutboxStore.
//! Requires a Postgres instance. Set DATABASE_TEST_URL or these tests are skipped.

use std::collections::HashSet;

use chrono::{Duration, Utc};
use cms_outbox::{EventStatus, OutboxStore, PgOutboxStore};
use serde_json::json;
use sqlx::PgPool;

/// Get a test database pool, or skip if no test DB is available.
async fn test_pool() -> Option<PgPool> {
    let url = std::env::var("DATABASE_TEST_URL").ok()?;
    let pool = PgPool::connect(&url).await.ok()?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS outbox_events (
            id          UUID         PRIMARY KEY,
            topic       TEXT         NOT NULL,
            payload     JSONB        NOT NULL,
            status      TEXT         NOT NULL DEFAULT 'pending',
            attempts    INTEGER      NOT NULL DEFAULT 0 CHECK (attempts >= 0),
            created_at  TIMESTAMPTZ  NOT NULL DEFAULT clock_timestamp(),
            updated_at  TIMESTAMPTZ  NOT NULL DEFAULT clock_timestamp()
        )
        "#,
    )
    .execute(&pool)
    .await
    .ok()?;

    sqlx::query("ALTER TABLE outbox_events ADD COLUMN IF NOT EXISTS dedup_key TEXT")
        .execute(&pool)
        .await
        .ok()?;
    sqlx::query(
        "CREATE UNIQUE INDEX IF NOT EXISTS outbox_events_dedup_key_idx \
         ON outbox_events (dedup_key) WHERE dedup_key IS NOT NULL",
    )
    .execute(&pool)
    .await
    .ok()?;

    // Clean slate for each test
    sqlx::query("TRUNCATE outbox_events")
        .execute(&pool)
        .await
        .ok()?;

    Some(pool)
}

#[tokio::test]
async fn publish_inserts_pending_row() {
    let Some(pool) = test_pool().await else {
        return;
    };
    let store = PgOutboxStore::new(pool);

    let published = store
        .publish("post.created", json!({"id": "p1"}))
        .await
        .unwrap();

    let row = store.load(published.id).await.unwrap().unwrap();
    assert_eq!(row.topic, "post.created");
    assert_eq!(row.status, EventStatus::Pending);
    assert_eq!(row.attempts, 0);
    assert_eq!(row.payload, json!({"id": "p1"}));
}

#[tokio::test]
async fn publish_in_rolled_back_tx_leaves_nothing() {
    let Some(pool) = test_pool().await else {
        return;
    };
    let store = PgOutboxStore::new(pool.clone());

    let mut tx = pool.begin().await.unwrap();
    let published = PgOutboxStore::publish_in_tx(&mut tx, "post.created", json!({}))
        .await
        .unwrap();
    tx.rollback().await.unwrap();

    assert!(store.load(published.id).await.unwrap().is_none());
    assert!(store.claim(25).await.unwrap().is_empty());
}

#[tokio::test]
async fn claim_orders_oldest_first_and_respects_limit() {
    let Some(pool) = test_pool().await else {
        return;
    };
    let store = PgOutboxStore::new(pool);

    let mut ids = Vec::new();
    for i in 0..5 {
        ids.push(store.publish("tag.updated", json!({"i": i})).await.unwrap().id);
    }

    let claimed = store.claim(3).await.unwrap();
    assert_eq!(claimed.iter().map(|c| c.id).collect::<Vec<_>>(), ids[..3].to_vec());
    for window in claimed.windows(2) {
        assert!(window[0].created_at <= window[1].created_at);
    }

    for c in &claimed {
        let row = store.load(c.id).await.unwrap().unwrap();
        assert_eq!(row.status, EventStatus::Processing);
    }
}

#[tokio::test]
async fn concurrent_claims_are_exclusive() {
    let Some(pool) = test_pool().await else {
        return;
    };
    let store = PgOutboxStore::new(pool);

    for i in 0..60 {
        store.publish("comment.created", json!({"i": i})).await.unwrap();
    }

    let claims = (0..6).map(|_| {
        let store = store.clone();
        tokio::spawn(async move { store.claim(25).await.unwrap() })
    });
    let batches: Vec<_> = futures::future::join_all(claims)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    let total: usize = batches.iter().map(|b| b.len()).sum();
    let unique: HashSet<_> = batches.iter().flatten().map(|c| c.id).collect();
    assert!(total <= 60);
    assert_eq!(unique.len(), total, "an event was claimed twice");
}

#[tokio::test]
async fn mark_error_increments_attempts() {
    let Some(pool) = test_pool().await else {
        return;
    };
    let store = PgOutboxStore::new(pool);

    let published = store.publish("field.deleted", json!({})).await.unwrap();
    store.claim(1).await.unwrap();
    store.mark_error(published.id, 1).await.unwrap();

    let row = store.load(published.id).await.unwrap().unwrap();
    assert_eq!(row.status, EventStatus::Error);
    assert_eq!(row.attempts, 1);
    assert!(row.updated_at >= row.created_at);
}

#[tokio::test]
async fn publish_once_inserts_one_row_across_racing_replicas() {
    let Some(pool) = test_pool().await else {
        return;
    };

    let publishes = (0..4).map(|_| {
        let store = PgOutboxStore::new(pool.clone());
        tokio::spawn(async move {
            store
                .publish_once("tags.nightly.stats", "tags.nightly.stats:2026-03-10", json!({"date": "2026-03-10"}))
                .await
                .unwrap()
        })
    });
    let results: Vec<_> = futures::future::join_all(publishes)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    assert_eq!(results.iter().filter(|r| r.is_some()).count(), 1);

    let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM outbox_events WHERE topic = 'tags.nightly.stats'")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(rows, 1);

    // Plain publishes carry no key and never collide.
    let store = PgOutboxStore::new(pool);
    store.publish("tag.created", json!({})).await.unwrap();
    store.publish("tag.created", json!({})).await.unwrap();
}

#[tokio::test]
async fn mark_error_saturates_attempts() {
    let Some(pool) = test_pool().await else {
        return;
    };
    let store = PgOutboxStore::new(pool);

    let published = store.publish("field.updated", json!({})).await.unwrap();
    store.claim(1).await.unwrap();
    store.mark_error(published.id, 2).await.unwrap();
    store.mark_error(published.id, u32::MAX).await.unwrap();

    let row = store.load(published.id).await.unwrap().unwrap();
    assert_eq!(row.attempts, i32::MAX);
}

#[tokio::test]
async fn mark_done_twice_is_harmless() {
    let Some(pool) = test_pool().await else {
        return;
    };
    let store = PgOutboxStore::new(pool);

    let published = store.publish("user.created", json!({})).await.unwrap();
    store.claim(1).await.unwrap();
    store.mark_done(published.id).await.unwrap();
    store.mark_done(published.id).await.unwrap();

    let row = store.load(published.id).await.unwrap().unwrap();
    assert_eq!(row.status, EventStatus::Done);
    assert_eq!(row.attempts, 0);
}

#[tokio::test]
async fn load_nonexistent_returns_none() {
    let Some(pool) = test_pool().await else {
        return;
    };
    let store = PgOutboxStore::new(pool);

    assert!(store.load(uuid::Uuid::new_v4()).await.unwrap().is_none());
}

#[tokio::test]
async fn reclaim_stale_resets_old_processing_rows() {
    let Some(pool) = test_pool().await else {
        return;
    };
    let store = PgOutboxStore::new(pool.clone());

    let published = store.publish("form.updated", json!({})).await.unwrap();
    store.claim(1).await.unwrap();

    // Nothing is stale yet.
    let cutoff = Utc::now() - Duration::minutes(5);
    assert_eq!(store.reclaim_stale(cutoff).await.unwrap(), 0);

    sqlx::query("UPDATE outbox_events SET updated_at = now() - interval '1 hour' WHERE id = $1")
        .bind(published.id)
        .execute(&pool)
        .await
        .unwrap();

    assert_eq!(store.reclaim_stale(cutoff).await.unwrap(), 1);
    let reclaimed = store.claim(1).await.unwrap();
    assert_eq!(reclaimed[0].id, published.id);
}
