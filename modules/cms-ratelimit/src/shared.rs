//! Fixed-window counter over a shared bucket store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::counter::Counter;
use crate::types::{CounterError, HitResult};

/// Default upper bound on one bucket store round trip.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(250);

/// Atomic increment-with-expiry storage for window buckets.
#[async_trait]
pub trait BucketStore: Send + Sync {
    /// Whether the store can take requests right now.
    fn is_ready(&self) -> bool;

    /// Increment `bucket_key` and return the new count. A new bucket expires
    /// `ttl_secs` from now; an existing bucket keeps its expiry. The increment
    /// and the expiry are one atomic operation.
    async fn incr_with_expiry(&self, bucket_key: &str, ttl_secs: u64) -> Result<Option<i64>, CounterError>;

    /// Drop buckets past their expiry. Returns how many were removed.
    async fn sweep_expired(&self) -> Result<u64, CounterError>;
}

#[async_trait]
impl<B: BucketStore + ?Sized> BucketStore for Arc<B> {
    fn is_ready(&self) -> bool {
        (**self).is_ready()
    }

    async fn incr_with_expiry(&self, bucket_key: &str, ttl_secs: u64) -> Result<Option<i64>, CounterError> {
        (**self).incr_with_expiry(bucket_key, ttl_secs).await
    }

    async fn sweep_expired(&self) -> Result<u64, CounterError> {
        (**self).sweep_expired().await
    }
}

/// Windows are aligned to multiples of `window_secs` since the epoch, so every
/// process agrees on the bucket for a given instant.
pub struct SharedCounter<B> {
    store: B,
    timeout: Duration,
}

impl<B: BucketStore> SharedCounter<B> {
    pub fn new(store: B) -> Self {
        Self {
            store,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn store(&self) -> &B {
        &self.store
    }
}

/// `rate:<key>:<window index>`.
pub fn bucket_key(key: &str, now_secs: i64, window_secs: u64) -> String {
    format!("rate:{key}:{}", now_secs.div_euclid(window(window_secs)))
}

/// Seconds until the next aligned window boundary. Always in `1..=window_secs`.
pub fn seconds_to_boundary(now_secs: i64, window_secs: u64) -> u64 {
    let window = window(window_secs);
    window.abs_diff(now_secs.rem_euclid(window))
}

/// Window length as a positive divisor.
fn window(window_secs: u64) -> i64 {
    i64::try_from(window_secs).unwrap_or(i64::MAX).max(1)
}

#[async_trait]
impl<B: BucketStore> Counter for SharedCounter<B> {
    async fn hit(
        &self,
        key: &str,
        limit: i64,
        window_secs: u64,
        now: DateTime<Utc>,
    ) -> Result<HitResult, CounterError> {
        if !self.store.is_ready() {
            return Err(CounterError::NotReady);
        }

        let now_secs = now.timestamp();
        let bucket = bucket_key(key, now_secs, window_secs);

        let count = tokio::time::timeout(self.timeout, self.store.incr_with_expiry(&bucket, window_secs))
            .await
            .map_err(|_| CounterError::Timeout(self.timeout))??
            .ok_or(CounterError::EmptyReply)?;

        Ok(HitResult::counted(
            count,
            limit,
            seconds_to_boundary(now_secs, window_secs),
        ))
    }
}
