//! Window buckets in an unlogged Postgres table.
//!
//! The upsert is a single statement, so increment and expiry land together.
//! Postgres never expires rows by itself; `sweep_expired` does that and the
//! sweeper task calls it on a timer.

use async_trait::async_trait;
use sqlx::PgPool;

use crate::shared::BucketStore;
use crate::types::CounterError;

#[derive(Clone)]
pub struct PgBucketStore {
    pool: PgPool,
}

impl PgBucketStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl BucketStore for PgBucketStore {
    fn is_ready(&self) -> bool {
        !self.pool.is_closed()
    }

    async fn incr_with_expiry(&self, bucket_key: &str, ttl_secs: u64) -> Result<Option<i64>, CounterError> {
        // A row left behind past its expiry counts as absent.
        let count = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO rate_limit_buckets (bucket_key, count, expires_at)
            VALUES ($1, 1, now() + make_interval(secs => $2))
            ON CONFLICT (bucket_key) DO UPDATE SET
                count = CASE
                    WHEN rate_limit_buckets.expires_at <= now() THEN 1
                    ELSE rate_limit_buckets.count + 1
                END,
                expires_at = CASE
                    WHEN rate_limit_buckets.expires_at <= now() THEN EXCLUDED.expires_at
                    ELSE rate_limit_buckets.expires_at
                END
            RETURNING count
            "#,
        )
        .bind(bucket_key)
        .bind(ttl_secs as f64)
        .fetch_optional(&self.pool)
        .await?;

        Ok(count)
    }

    async fn sweep_expired(&self) -> Result<u64, CounterError> {
        let result = sqlx::query("DELETE FROM rate_limit_buckets WHERE expires_at <= now()")
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}
