//! Handler seam for outbox events.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

use crate::topic::EventKind;

/// Reacts to one outbox event.
///
/// Delivery is at-least-once: a row reclaimed after a crash is handed out
/// again, so handlers must be idempotent. An `Err` marks the event `error`.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, kind: EventKind, payload: &serde_json::Value) -> Result<()>;
}

#[async_trait]
impl<H: EventHandler + ?Sized> EventHandler for Arc<H> {
    async fn handle(&self, kind: EventKind, payload: &serde_json::Value) -> Result<()> {
        (**self).handle(kind, payload).await
    }
}

/// Default handler: records the event in the log stream and succeeds.
pub struct AuditHandler;

#[async_trait]
impl EventHandler for AuditHandler {
    async fn handle(&self, kind: EventKind, payload: &serde_json::Value) -> Result<()> {
        let subject = payload.get("id").and_then(|v| v.as_str()).unwrap_or("-");
        info!(topic = kind.as_str(), subject, "Outbox event");
        Ok(())
    }
}
