//! One polling cycle over the outbox.

use std::fmt;
use std::panic::AssertUnwindSafe;

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use futures::FutureExt;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use cms_outbox::OutboxStore;

use crate::registry::HandlerRegistry;
use crate::topic::Topic;

/// Events claimed per tick.
pub const BATCH_SIZE: usize = 25;

/// What a single tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickStats {
    pub claimed: usize,
    pub done: usize,
    pub failed: usize,
    /// Claimed but gone by the time it was loaded.
    pub skipped: usize,
    /// Topic outside the catalog; acknowledged as done.
    pub unknown: usize,
    /// Store failed mid-event; the row stays `processing` until reclaimed.
    pub stranded: usize,
    /// Stale processing rows put back to pending before claiming.
    pub reclaimed: u64,
}

impl TickStats {
    pub fn is_idle(&self) -> bool {
        self.claimed == 0 && self.reclaimed == 0
    }
}

impl fmt::Display for TickStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "claimed={} done={} failed={} skipped={} unknown={} stranded={} reclaimed={}",
            self.claimed,
            self.done,
            self.failed,
            self.skipped,
            self.unknown,
            self.stranded,
            self.reclaimed
        )
    }
}

/// Claims batches from an `OutboxStore` and routes them through a
/// `HandlerRegistry`.
///
/// Events inside a batch run sequentially. A handler error (or panic) marks
/// that one event `error` and the batch moves on. A store error while handling
/// one event is logged with its id and the batch moves on too; that row stays
/// `processing`. Reclaim or claim failures abort the tick and surface to the
/// caller.
pub struct Dispatcher<S> {
    store: S,
    registry: HandlerRegistry,
    batch_size: usize,
    reclaim_after: Option<Duration>,
    in_flight: Mutex<()>,
}

impl<S: OutboxStore> Dispatcher<S> {
    pub fn new(store: S, registry: HandlerRegistry) -> Self {
        Self {
            store,
            registry,
            batch_size: BATCH_SIZE,
            reclaim_after: None,
            in_flight: Mutex::new(()),
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Reclaim processing rows untouched for `after` at the start of every
    /// tick. Off unless set.
    pub fn with_reclaim_after(mut self, after: Duration) -> Self {
        self.reclaim_after = Some(after);
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Run one tick, waiting for any tick already in flight to finish first.
    pub async fn tick(&self) -> Result<TickStats> {
        let _guard = self.in_flight.lock().await;
        self.run_tick().await
    }

    /// Run one tick unless another is in flight, in which case `Ok(None)`.
    pub async fn try_tick(&self) -> Result<Option<TickStats>> {
        let Ok(_guard) = self.in_flight.try_lock() else {
            debug!("Previous outbox tick still running, skipping");
            return Ok(None);
        };
        self.run_tick().await.map(Some)
    }

    async fn run_tick(&self) -> Result<TickStats> {
        let mut stats = TickStats::default();

        if let Some(after) = self.reclaim_after {
            stats.reclaimed = self
                .store
                .reclaim_stale(Utc::now() - after)
                .await
                .context("Failed to reclaim stale outbox events")?;
            if stats.reclaimed > 0 {
                warn!(reclaimed = stats.reclaimed, "Reclaimed stale processing events");
            }
        }

        let claimed = self
            .store
            .claim(self.batch_size)
            .await
            .context("Failed to claim outbox batch")?;
        stats.claimed = claimed.len();

        for event in claimed {
            if let Err(e) = self.process(event.id, &mut stats).await {
                error!(id = %event.id, error = %e, "Outbox event stranded in processing");
                stats.stranded += 1;
            }
        }

        if stats.is_idle() {
            debug!("Outbox tick idle");
        } else {
            info!(
                claimed = stats.claimed,
                done = stats.done,
                failed = stats.failed,
                skipped = stats.skipped,
                unknown = stats.unknown,
                stranded = stats.stranded,
                "Outbox tick complete"
            );
        }

        Ok(stats)
    }

    async fn process(&self, id: Uuid, stats: &mut TickStats) -> Result<()> {
        let Some(event) = self
            .store
            .load(id)
            .await
            .with_context(|| format!("Failed to load outbox event {id}"))?
        else {
            debug!(%id, "Claimed event no longer exists, skipping");
            stats.skipped += 1;
            return Ok(());
        };

        let kind = match Topic::parse(&event.topic) {
            Topic::Known(kind) => kind,
            Topic::Unknown(topic) => {
                debug!(%id, topic = %topic, "No handler for topic, acknowledging");
                self.store
                    .mark_done(id)
                    .await
                    .with_context(|| format!("Failed to acknowledge outbox event {id}"))?;
                stats.unknown += 1;
                return Ok(());
            }
        };

        let handler = self.registry.handler(kind);
        let outcome = AssertUnwindSafe(handler.handle(kind, &event.payload))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(())) => {
                self.store
                    .mark_done(id)
                    .await
                    .with_context(|| format!("Failed to mark outbox event {id} done"))?;
                stats.done += 1;
            }
            Ok(Err(e)) => {
                warn!(%id, topic = kind.as_str(), attempts = event.attempts + 1, error = %e, "Outbox handler failed");
                self.store
                    .mark_error(id, 1)
                    .await
                    .with_context(|| format!("Failed to mark outbox event {id} error"))?;
                stats.failed += 1;
            }
            Err(_) => {
                warn!(%id, topic = kind.as_str(), attempts = event.attempts + 1, "Outbox handler panicked");
                self.store
                    .mark_error(id, 1)
                    .await
                    .with_context(|| format!("Failed to mark outbox event {id} error"))?;
                stats.failed += 1;
            }
        }

        Ok(())
    }
}
