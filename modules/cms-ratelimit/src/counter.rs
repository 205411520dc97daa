//! The `Counter` seam, the per-process counter, and the fallback decorator.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::types::{CounterError, HitResult};

/// Local map size past which expired entries are pruned before inserting.
const PRUNE_THRESHOLD: usize = 1000;

/// Counts one hit against `key` in a fixed window of `window_secs`.
///
/// Callers guarantee `limit > 0` and `window_secs > 0`; `RateLimiter` handles
/// the degenerate cases before any counter sees them.
#[async_trait]
pub trait Counter: Send + Sync {
    async fn hit(
        &self,
        key: &str,
        limit: i64,
        window_secs: u64,
        now: DateTime<Utc>,
    ) -> Result<HitResult, CounterError>;
}

#[async_trait]
impl<C: Counter + ?Sized> Counter for Arc<C> {
    async fn hit(
        &self,
        key: &str,
        limit: i64,
        window_secs: u64,
        now: DateTime<Utc>,
    ) -> Result<HitResult, CounterError> {
        (**self).hit(key, limit, window_secs, now).await
    }
}

// ---------------------------------------------------------------------------
// LocalCounter
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct Window {
    count: i64,
    reset_at_ms: i64,
}

/// Per-process counter. Windows start at the first hit for a key, not on a
/// wall-clock boundary, and are never shared with other processes.
#[derive(Default)]
pub struct LocalCounter {
    windows: Mutex<HashMap<String, Window>>,
}

impl LocalCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keys currently tracked, expired or not.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn hit_at(&self, key: &str, limit: i64, window_secs: u64, now: DateTime<Utc>) -> HitResult {
        let now_ms = now.timestamp_millis();
        let window_ms = i64::try_from(window_secs.saturating_mul(1000)).unwrap_or(i64::MAX);
        let mut windows = self.lock();

        if let Some(window) = windows.get_mut(key) {
            if window.reset_at_ms > now_ms {
                window.count += 1;
                let left_ms = window.reset_at_ms - now_ms;
                let reset_seconds = (left_ms as u64).div_ceil(1000).max(1);
                return HitResult::counted(window.count, limit, reset_seconds);
            }
        } else if windows.len() > PRUNE_THRESHOLD {
            let before = windows.len();
            windows.retain(|_, w| w.reset_at_ms > now_ms);
            debug!(pruned = before - windows.len(), "Pruned expired local rate windows");
        }

        windows.insert(
            key.to_string(),
            Window {
                count: 1,
                reset_at_ms: now_ms.saturating_add(window_ms),
            },
        );
        HitResult {
            allowed: true,
            remaining: limit - 1,
            limit,
            reset_seconds: window_secs,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Window>> {
        self.windows.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl Counter for LocalCounter {
    async fn hit(
        &self,
        key: &str,
        limit: i64,
        window_secs: u64,
        now: DateTime<Utc>,
    ) -> Result<HitResult, CounterError> {
        Ok(self.hit_at(key, limit, window_secs, now))
    }
}

// ---------------------------------------------------------------------------
// FallbackCounter
// ---------------------------------------------------------------------------

/// Tries `primary` and answers from a `LocalCounter` on any error.
///
/// The first failure after a healthy stretch logs at `warn`, later ones at
/// `debug`; recovery logs once at `info`.
pub struct FallbackCounter<P> {
    primary: Option<P>,
    local: LocalCounter,
    degraded: AtomicBool,
}

impl<P: Counter> FallbackCounter<P> {
    pub fn new(primary: P) -> Self {
        Self {
            primary: Some(primary),
            local: LocalCounter::new(),
            degraded: AtomicBool::new(false),
        }
    }

    /// No shared backend; every hit is counted locally.
    pub fn local_only() -> Self {
        Self {
            primary: None,
            local: LocalCounter::new(),
            degraded: AtomicBool::new(false),
        }
    }

    pub fn local(&self) -> &LocalCounter {
        &self.local
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    /// Infallible form of `Counter::hit`.
    pub async fn hit_or_fallback(
        &self,
        key: &str,
        limit: i64,
        window_secs: u64,
        now: DateTime<Utc>,
    ) -> HitResult {
        let Some(primary) = &self.primary else {
            return self.local.hit_at(key, limit, window_secs, now);
        };

        match primary.hit(key, limit, window_secs, now).await {
            Ok(result) => {
                if self.degraded.swap(false, Ordering::Relaxed) {
                    info!("Shared rate limit counter recovered");
                }
                result
            }
            Err(e) => {
                if self.degraded.swap(true, Ordering::Relaxed) {
                    debug!(error = %e, key, "Shared rate limit counter unavailable, counting locally");
                } else {
                    warn!(error = %e, key, "Shared rate limit counter unavailable, falling back to local counter");
                }
                self.local.hit_at(key, limit, window_secs, now)
            }
        }
    }
}

#[async_trait]
impl<P: Counter> Counter for FallbackCounter<P> {
    async fn hit(
        &self,
        key: &str,
        limit: i64,
        window_secs: u64,
        now: DateTime<Utc>,
    ) -> Result<HitResult, CounterError> {
        Ok(self.hit_or_fallback(key, limit, window_secs, now).await)
    }
}
