//! In-process outbox for tests. No database required.

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::traits::OutboxStore;
use crate::types::{ClaimedEvent, EventStatus, OutboxEvent, Published};

/// Thread-safe in-memory outbox.
///
/// Claims run under a single lock, which gives the same exclusivity the
/// postgres store gets from row locks. `created_at` is strictly increasing in
/// publish order so oldest-first is deterministic.
pub struct MemoryOutboxStore {
    rows: Mutex<Vec<OutboxEvent>>,
    dedup_keys: Mutex<HashSet<String>>,
}

impl Default for MemoryOutboxStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryOutboxStore {
    pub fn new() -> Self {
        Self {
            rows: Mutex::new(Vec::new()),
            dedup_keys: Mutex::new(HashSet::new()),
        }
    }

    /// Snapshot of every row, in publish order (for test assertions).
    pub fn events(&self) -> Vec<OutboxEvent> {
        self.lock().clone()
    }

    /// Remove a row outright, as an external retention job would.
    pub fn delete(&self, id: Uuid) -> bool {
        let mut rows = self.lock();
        let before = rows.len();
        rows.retain(|row| row.id != id);
        rows.len() != before
    }

    /// Backdate `updated_at` of a row (for staleness tests).
    pub fn touch(&self, id: Uuid, updated_at: DateTime<Utc>) {
        if let Some(row) = self.lock().iter_mut().find(|row| row.id == id) {
            row.updated_at = updated_at;
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<OutboxEvent>> {
        // A panicking test thread must not wedge every other assertion.
        self.rows.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn push(&self, topic: &str, payload: serde_json::Value) -> Published {
        let mut rows = self.lock();

        let mut created_at = Utc::now();
        if let Some(last) = rows.last() {
            if created_at <= last.created_at {
                created_at = last.created_at + Duration::microseconds(1);
            }
        }

        let id = Uuid::new_v4();
        rows.push(OutboxEvent {
            id,
            topic: topic.to_string(),
            payload,
            status: EventStatus::Pending,
            attempts: 0,
            created_at,
            updated_at: created_at,
        });

        Published {
            id,
            topic: topic.to_string(),
        }
    }

    fn update<F>(&self, id: Uuid, f: F)
    where
        F: FnOnce(&mut OutboxEvent),
    {
        if let Some(row) = self.lock().iter_mut().find(|row| row.id == id) {
            f(row);
            row.updated_at = Utc::now();
        }
    }
}

#[async_trait]
impl OutboxStore for MemoryOutboxStore {
    async fn publish(&self, topic: &str, payload: serde_json::Value) -> Result<Published> {
        Ok(self.push(topic, payload))
    }

    async fn publish_once(
        &self,
        topic: &str,
        dedup_key: &str,
        payload: serde_json::Value,
    ) -> Result<Option<Published>> {
        let mut keys = self.dedup_keys.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if !keys.insert(dedup_key.to_string()) {
            return Ok(None);
        }
        Ok(Some(self.push(topic, payload)))
    }

    async fn claim(&self, limit: usize) -> Result<Vec<ClaimedEvent>> {
        let mut rows = self.lock();

        let mut pending: Vec<&mut OutboxEvent> = rows
            .iter_mut()
            .filter(|row| row.status == EventStatus::Pending)
            .collect();
        pending.sort_by_key(|row| row.created_at);

        let now = Utc::now();
        Ok(pending
            .into_iter()
            .take(limit)
            .map(|row| {
                row.status = EventStatus::Processing;
                row.updated_at = now;
                ClaimedEvent {
                    id: row.id,
                    created_at: row.created_at,
                }
            })
            .collect())
    }

    async fn load(&self, id: Uuid) -> Result<Option<OutboxEvent>> {
        Ok(self.lock().iter().find(|row| row.id == id).cloned())
    }

    async fn mark_done(&self, id: Uuid) -> Result<()> {
        self.update(id, |row| row.status = EventStatus::Done);
        Ok(())
    }

    async fn mark_error(&self, id: Uuid, attempt_increment: u32) -> Result<()> {
        let increment = i32::try_from(attempt_increment).unwrap_or(i32::MAX);
        self.update(id, |row| {
            row.status = EventStatus::Error;
            row.attempts = row.attempts.saturating_add(increment);
        });
        Ok(())
    }

    async fn reclaim_stale(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let mut rows = self.lock();
        let now = Utc::now();
        let mut reset = 0;
        for row in rows
            .iter_mut()
            .filter(|row| row.status == EventStatus::Processing && row.updated_at < older_than)
        {
            row.status = EventStatus::Pending;
            row.updated_at = now;
            reset += 1;
        }
        Ok(reset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn claim_flips_pending_to_processing() {
        let store = MemoryOutboxStore::new();
        let published = store.publish("post.created", json!({"id": "p1"})).await.unwrap();

        let claimed = store.claim(10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, published.id);

        let row = store.load(published.id).await.unwrap().unwrap();
        assert_eq!(row.status, EventStatus::Processing);

        // Already processing, so a second claim sees nothing.
        assert!(store.claim(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn publish_once_ignores_repeated_key() {
        let store = MemoryOutboxStore::new();

        let first = store.publish_once("tags.nightly.stats", "k1", json!({})).await.unwrap();
        let again = store.publish_once("tags.nightly.stats", "k1", json!({})).await.unwrap();
        let other = store.publish_once("tags.nightly.stats", "k2", json!({})).await.unwrap();

        assert!(first.is_some());
        assert!(again.is_none());
        assert!(other.is_some());
        assert_eq!(store.events().len(), 2);
    }

    #[tokio::test]
    async fn delete_removes_row() {
        let store = MemoryOutboxStore::new();
        let published = store.publish("tag.deleted", json!({})).await.unwrap();

        assert!(store.delete(published.id));
        assert!(!store.delete(published.id));
        assert!(store.load(published.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reclaim_only_touches_old_processing_rows() {
        let store = MemoryOutboxStore::new();
        let old = store.publish("a", json!({})).await.unwrap();
        let fresh = store.publish("b", json!({})).await.unwrap();
        let done = store.publish("c", json!({})).await.unwrap();
        store.claim(10).await.unwrap();
        store.mark_done(done.id).await.unwrap();

        let cutoff = Utc::now() - Duration::minutes(5);
        store.touch(old.id, cutoff - Duration::minutes(1));
        store.touch(done.id, cutoff - Duration::minutes(1));

        assert_eq!(store.reclaim_stale(cutoff).await.unwrap(), 1);

        let statuses: Vec<_> = [old.id, fresh.id, done.id]
            .iter()
            .map(|id| store.events().into_iter().find(|e| e.id == *id).unwrap().status)
            .collect();
        assert_eq!(
            statuses,
            vec![EventStatus::Pending, EventStatus::Processing, EventStatus::Done]
        );
    }
}
