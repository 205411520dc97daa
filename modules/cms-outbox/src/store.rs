//! The outbox table backed by Postgres.
//!
//! Claiming uses `FOR UPDATE SKIP LOCKED` inside a transaction, so replicas
//! polling the same table never hand the same row to two dispatchers.

use std::collections::HashSet;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use tracing::debug;
use uuid::Uuid;

use crate::traits::OutboxStore;
use crate::types::{ClaimedEvent, EventStatus, OutboxEvent, Published};

// ---------------------------------------------------------------------------
// PgOutboxStore
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct PgOutboxStore {
    pool: PgPool,
}

impl PgOutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Publish inside a caller-owned transaction.
    ///
    /// This is the form business modules use: the event commits or rolls back
    /// together with the write it describes.
    pub async fn publish_in_tx(
        tx: &mut Transaction<'_, Postgres>,
        topic: &str,
        payload: serde_json::Value,
    ) -> Result<Published> {
        let id = Uuid::new_v4();

        sqlx::query(
            r#"
            INSERT INTO outbox_events (id, topic, payload, status, attempts)
            VALUES ($1, $2, $3, 'pending', 0)
            "#,
        )
        .bind(id)
        .bind(topic)
        .bind(&payload)
        .execute(&mut **tx)
        .await
        .with_context(|| format!("Failed to publish outbox event {topic}"))?;

        debug!(%id, topic, "Published outbox event");

        Ok(Published {
            id,
            topic: topic.to_string(),
        })
    }
}

#[async_trait]
impl OutboxStore for PgOutboxStore {
    async fn publish(&self, topic: &str, payload: serde_json::Value) -> Result<Published> {
        let mut tx = self.pool.begin().await?;
        let published = Self::publish_in_tx(&mut tx, topic, payload).await?;
        tx.commit().await?;
        Ok(published)
    }

    async fn publish_once(
        &self,
        topic: &str,
        dedup_key: &str,
        payload: serde_json::Value,
    ) -> Result<Option<Published>> {
        let id = Uuid::new_v4();

        let inserted = sqlx::query_scalar::<_, Uuid>(
            r#"
            INSERT INTO outbox_events (id, topic, payload, status, attempts, dedup_key)
            VALUES ($1, $2, $3, 'pending', 0, $4)
            ON CONFLICT (dedup_key) WHERE dedup_key IS NOT NULL DO NOTHING
            RETURNING id
            "#,
        )
        .bind(id)
        .bind(topic)
        .bind(&payload)
        .bind(dedup_key)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("Failed to publish outbox event {topic} ({dedup_key})"))?;

        match inserted {
            Some(id) => {
                debug!(%id, topic, dedup_key, "Published outbox event");
                Ok(Some(Published {
                    id,
                    topic: topic.to_string(),
                }))
            }
            None => {
                debug!(topic, dedup_key, "Outbox event already published");
                Ok(None)
            }
        }
    }

    async fn claim(&self, limit: usize) -> Result<Vec<ClaimedEvent>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut tx = self.pool.begin().await?;

        // Rows locked by another claimer are skipped, not waited on.
        let candidates = sqlx::query_as::<_, (Uuid, DateTime<Utc>)>(
            r#"
            SELECT id, created_at
            FROM outbox_events
            WHERE status = 'pending'
            ORDER BY created_at ASC, id ASC
            LIMIT $1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&mut *tx)
        .await?;

        if candidates.is_empty() {
            tx.commit().await?;
            return Ok(Vec::new());
        }

        let ids: Vec<Uuid> = candidates.iter().map(|(id, _)| *id).collect();

        let flipped: HashSet<Uuid> = sqlx::query_scalar::<_, Uuid>(
            r#"
            UPDATE outbox_events
            SET status = 'processing', updated_at = clock_timestamp()
            WHERE id = ANY($1) AND status = 'pending'
            RETURNING id
            "#,
        )
        .bind(&ids)
        .fetch_all(&mut *tx)
        .await?
        .into_iter()
        .collect();

        tx.commit().await?;

        // RETURNING order is unspecified; keep the select's oldest-first order.
        Ok(candidates
            .into_iter()
            .filter(|(id, _)| flipped.contains(id))
            .map(|(id, created_at)| ClaimedEvent { id, created_at })
            .collect())
    }

    async fn load(&self, id: Uuid) -> Result<Option<OutboxEvent>> {
        let row = sqlx::query_as::<_, OutboxEvent>(
            r#"
            SELECT id, topic, payload, status, attempts, created_at, updated_at
            FROM outbox_events
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    async fn mark_done(&self, id: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE outbox_events
            SET status = 'done', updated_at = clock_timestamp()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn mark_error(&self, id: Uuid, attempt_increment: u32) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE outbox_events
            SET status = 'error',
                attempts = LEAST(attempts::BIGINT + $2, 2147483647)::INTEGER,
                updated_at = clock_timestamp()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(i64::from(attempt_increment))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn reclaim_stale(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_events
            SET status = 'pending', updated_at = clock_timestamp()
            WHERE status = 'processing' AND updated_at < $1
            "#,
        )
        .bind(older_than)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

// ---------------------------------------------------------------------------
// sqlx::FromRow for OutboxEvent
// ---------------------------------------------------------------------------

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for OutboxEvent {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> std::result::Result<Self, sqlx::Error> {
        use sqlx::Row;

        let status: String = row.try_get("status")?;
        let status = status
            .parse::<EventStatus>()
            .map_err(|e| sqlx::Error::Decode(e.into()))?;

        Ok(OutboxEvent {
            id: row.try_get("id")?,
            topic: row.try_get("topic")?,
            payload: row.try_get("payload")?,
            status,
            attempts: row.try_get("attempts")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}
