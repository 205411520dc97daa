use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::shared::BucketStore;

/// Periodically delete shared buckets past their expiry.
///
/// Window keys roll over on their own; this only reclaims space.
pub fn spawn_bucket_sweeper<B>(store: B, every: Duration, cancel: CancellationToken) -> JoinHandle<()>
where
    B: BucketStore + 'static,
{
    tokio::spawn(async move {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(interval_secs = every.as_secs(), "Rate limit bucket sweeper started");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if !store.is_ready() {
                        debug!("Bucket store not ready, skipping sweep");
                        continue;
                    }
                    match store.sweep_expired().await {
                        Ok(0) => debug!("No expired rate limit buckets"),
                        Ok(removed) => info!(removed, "Swept expired rate limit buckets"),
                        Err(e) => error!(error = %e, "Rate limit bucket sweep failed"),
                    }
                }
            }
        }

        info!("Rate limit bucket sweeper stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::Utc;

    use crate::memory::MemoryBucketStore;

    #[tokio::test]
    async fn sweeps_then_stops_on_cancel() {
        let store = Arc::new(MemoryBucketStore::new());
        store.incr_with_expiry("rate:k:1", 60).await.unwrap();
        store.expire_at("rate:k:1", Utc::now() - chrono::Duration::seconds(1));

        let cancel = CancellationToken::new();
        let task = spawn_bucket_sweeper(store.clone(), Duration::from_millis(10), cancel.clone());

        for _ in 0..100 {
            if store.bucket_keys().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(store.bucket_keys().is_empty());

        cancel.cancel();
        task.await.unwrap();
    }
}
