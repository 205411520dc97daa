//! The storage seam the dispatcher depends on.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::types::{ClaimedEvent, OutboxEvent, Published};

/// Durable outbox storage.
///
/// Implemented by `PgOutboxStore` (postgres) and `MemoryOutboxStore` (tests).
/// Also implemented for `Arc<S>` so a store can be shared for assertions.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Insert a pending row.
    async fn publish(&self, topic: &str, payload: serde_json::Value) -> Result<Published>;

    /// Insert a pending row unless one was already published under
    /// `dedup_key`, in which case `None`. Replicas racing on the same key
    /// produce exactly one row.
    async fn publish_once(
        &self,
        topic: &str,
        dedup_key: &str,
        payload: serde_json::Value,
    ) -> Result<Option<Published>>;

    /// Move up to `limit` pending rows to processing, oldest first.
    ///
    /// Select and flip happen as one atomic unit: two concurrent callers never
    /// receive the same id. Returns an empty vec when nothing is pending.
    async fn claim(&self, limit: usize) -> Result<Vec<ClaimedEvent>>;

    /// Full row, or `None` if the id does not exist.
    async fn load(&self, id: Uuid) -> Result<Option<OutboxEvent>>;

    async fn mark_done(&self, id: Uuid) -> Result<()>;

    /// Terminal failure. `attempts` grows by `attempt_increment`, saturating
    /// at `i32::MAX`.
    async fn mark_error(&self, id: Uuid, attempt_increment: u32) -> Result<()>;

    /// Put processing rows last touched before `older_than` back to pending.
    /// Returns how many rows were reset.
    async fn reclaim_stale(&self, older_than: DateTime<Utc>) -> Result<u64>;
}

#[async_trait]
impl<S: OutboxStore + ?Sized> OutboxStore for Arc<S> {
    async fn publish(&self, topic: &str, payload: serde_json::Value) -> Result<Published> {
        (**self).publish(topic, payload).await
    }

    async fn publish_once(
        &self,
        topic: &str,
        dedup_key: &str,
        payload: serde_json::Value,
    ) -> Result<Option<Published>> {
        (**self).publish_once(topic, dedup_key, payload).await
    }

    async fn claim(&self, limit: usize) -> Result<Vec<ClaimedEvent>> {
        (**self).claim(limit).await
    }

    async fn load(&self, id: Uuid) -> Result<Option<OutboxEvent>> {
        (**self).load(id).await
    }

    async fn mark_done(&self, id: Uuid) -> Result<()> {
        (**self).mark_done(id).await
    }

    async fn mark_error(&self, id: Uuid, attempt_increment: u32) -> Result<()> {
        (**self).mark_error(id, attempt_increment).await
    }

    async fn reclaim_stale(&self, older_than: DateTime<Utc>) -> Result<u64> {
        (**self).reclaim_stale(older_than).await
    }
}
