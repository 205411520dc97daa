//! In-process `BucketStore` for tests and single-node development.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::shared::BucketStore;
use crate::types::CounterError;

/// How a `MemoryBucketStore` answers. Anything but `Healthy` simulates an
/// outage of the shared backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BucketMode {
    #[default]
    Healthy,
    /// `is_ready()` reports false.
    NotReady,
    /// Every increment fails with a database error.
    Failing,
    /// Increments succeed but return no count.
    Empty,
    /// Increments never complete.
    Stalled,
}

#[derive(Debug, Clone, Copy)]
struct Bucket {
    count: i64,
    expires_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct MemoryBucketStore {
    buckets: Mutex<HashMap<String, Bucket>>,
    mode: Mutex<BucketMode>,
}

impl MemoryBucketStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_mode(&self, mode: BucketMode) {
        *self.mode.lock().unwrap_or_else(|p| p.into_inner()) = mode;
    }

    pub fn mode(&self) -> BucketMode {
        *self.mode.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Current count for a bucket key, ignoring expiry.
    pub fn count(&self, bucket_key: &str) -> Option<i64> {
        self.lock().get(bucket_key).map(|b| b.count)
    }

    pub fn bucket_keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Move a bucket's expiry, e.g. into the past.
    pub fn expire_at(&self, bucket_key: &str, expires_at: DateTime<Utc>) {
        if let Some(bucket) = self.lock().get_mut(bucket_key) {
            bucket.expires_at = expires_at;
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Bucket>> {
        self.buckets.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait]
impl BucketStore for MemoryBucketStore {
    fn is_ready(&self) -> bool {
        self.mode() != BucketMode::NotReady
    }

    async fn incr_with_expiry(&self, bucket_key: &str, ttl_secs: u64) -> Result<Option<i64>, CounterError> {
        match self.mode() {
            BucketMode::Failing => return Err(CounterError::Database(sqlx::Error::PoolTimedOut)),
            BucketMode::Empty => return Ok(None),
            BucketMode::Stalled => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                return Ok(None);
            }
            BucketMode::Healthy | BucketMode::NotReady => {}
        }

        let now = Utc::now();
        let ttl = chrono::Duration::seconds(ttl_secs.min(u32::MAX as u64) as i64);
        let mut buckets = self.lock();
        let bucket = buckets
            .entry(bucket_key.to_string())
            .and_modify(|b| {
                if b.expires_at <= now {
                    *b = Bucket {
                        count: 0,
                        expires_at: now + ttl,
                    };
                }
            })
            .or_insert(Bucket {
                count: 0,
                expires_at: now + ttl,
            });
        bucket.count += 1;
        Ok(Some(bucket.count))
    }

    async fn sweep_expired(&self) -> Result<u64, CounterError> {
        if self.mode() == BucketMode::Failing {
            return Err(CounterError::Database(sqlx::Error::PoolTimedOut));
        }
        let now = Utc::now();
        let mut buckets = self.lock();
        let before = buckets.len();
        buckets.retain(|_, b| b.expires_at > now);
        Ok((before - buckets.len()) as u64)
    }
}
