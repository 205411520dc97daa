//! Owned lifecycle for the polling loop.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use cms_outbox::OutboxStore;

use crate::dispatcher::Dispatcher;

/// Cheap, cloneable view of a running dispatcher. Safe to hand to HTTP state.
#[derive(Clone, Default)]
pub struct DispatcherStatus {
    running: Arc<AtomicBool>,
    ticks: Arc<AtomicU64>,
    failed_ticks: Arc<AtomicU64>,
}

impl DispatcherStatus {
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Ticks completed, successful or not.
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    pub fn failed_ticks(&self) -> u64 {
        self.failed_ticks.load(Ordering::Relaxed)
    }
}

/// Handle to the background dispatcher task.
///
/// Dropping the handle does not stop the loop; call `shutdown`.
pub struct DispatcherHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
    status: DispatcherStatus,
}

impl DispatcherHandle {
    pub fn is_running(&self) -> bool {
        self.status.is_running()
    }

    pub fn status(&self) -> DispatcherStatus {
        self.status.clone()
    }

    /// Stop ticking. A tick already in flight runs to completion first, so
    /// nothing it claimed is left in `processing`.
    pub async fn shutdown(self) {
        info!("Stopping outbox dispatcher");
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            error!(error = %e, "Outbox dispatcher task ended abnormally");
        }
    }
}

/// Start the polling loop. The first tick fires immediately.
pub fn spawn_dispatcher<S>(dispatcher: Arc<Dispatcher<S>>, poll_interval: Duration) -> DispatcherHandle
where
    S: OutboxStore + 'static,
{
    let cancel = CancellationToken::new();
    let status = DispatcherStatus::default();
    status.running.store(true, Ordering::SeqCst);

    let task = tokio::spawn(run_loop(
        dispatcher,
        poll_interval,
        cancel.clone(),
        status.clone(),
    ));

    DispatcherHandle {
        cancel,
        task,
        status,
    }
}

async fn run_loop<S: OutboxStore>(
    dispatcher: Arc<Dispatcher<S>>,
    poll_interval: Duration,
    cancel: CancellationToken,
    status: DispatcherStatus,
) {
    let mut ticker = interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!(
        poll_interval_ms = poll_interval.as_millis() as u64,
        "Outbox dispatcher started"
    );

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                // Storage failures end this tick only; the loop keeps going.
                if let Err(e) = dispatcher.try_tick().await {
                    status.failed_ticks.fetch_add(1, Ordering::Relaxed);
                    error!(error = ?e, "Outbox tick failed");
                }
                status.ticks.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    status.running.store(false, Ordering::SeqCst);
    info!("Outbox dispatcher stopped");
}
