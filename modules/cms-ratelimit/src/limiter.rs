use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::counter::{Counter, FallbackCounter};
use crate::shared::{BucketStore, SharedCounter};
use crate::types::HitResult;

/// Longest window any counter sees: 100 years. Longer requests are clamped.
pub const MAX_WINDOW_SECS: u64 = 100 * 365 * 24 * 60 * 60;

/// Answers "is this key over quota in this window".
///
/// Never fails: a shared backend that errors, stalls, or reports not-ready is
/// replaced by the per-process counter for that hit.
pub struct RateLimiter {
    counter: FallbackCounter<Arc<dyn Counter>>,
}

impl RateLimiter {
    /// Shared counter first, local map on any failure.
    pub fn new(shared: Arc<dyn Counter>) -> Self {
        Self {
            counter: FallbackCounter::new(shared),
        }
    }

    /// Fixed windows in `store`, with each round trip bounded by `timeout`.
    pub fn with_bucket_store<B>(store: B, timeout: Duration) -> Self
    where
        B: BucketStore + 'static,
    {
        Self::new(Arc::new(SharedCounter::new(store).with_timeout(timeout)))
    }

    /// No shared backend at all.
    pub fn local_only() -> Self {
        Self {
            counter: FallbackCounter::local_only(),
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.counter.is_degraded()
    }

    pub async fn hit(&self, key: &str, limit: i64, window_secs: u64) -> HitResult {
        self.hit_at(key, limit, window_secs, Utc::now()).await
    }

    /// `hit` with an explicit clock.
    ///
    /// `limit <= 0` disables limiting and touches no counter. A zero window is
    /// treated as one second and anything past `MAX_WINDOW_SECS` as that.
    pub async fn hit_at(&self, key: &str, limit: i64, window_secs: u64, now: DateTime<Utc>) -> HitResult {
        if limit <= 0 {
            return HitResult::unlimited(limit);
        }
        let window_secs = window_secs.clamp(1, MAX_WINDOW_SECS);
        self.counter.hit_or_fallback(key, limit, window_secs, now).await
    }
}
