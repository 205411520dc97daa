//! Topic → handler table.

use std::sync::Arc;

use crate::handler::{AuditHandler, EventHandler};
use crate::topic::{EventKind, Topic};

/// Total mapping from every `EventKind` to a handler.
///
/// Built with a default for the whole catalog, then narrowed per kind. There
/// is no way to construct a registry with a hole in it, so a catalog topic
/// always resolves; only `Topic::Unknown` resolves to nothing.
pub struct HandlerRegistry {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl HandlerRegistry {
    /// Every kind routed to `handler`.
    pub fn uniform(handler: Arc<dyn EventHandler>) -> Self {
        Self {
            handlers: vec![handler; EventKind::COUNT],
        }
    }

    /// Production default: every kind audited to the log.
    pub fn audit() -> Self {
        Self::uniform(Arc::new(AuditHandler))
    }

    /// Route one kind to `handler`, replacing whatever it had.
    pub fn on(mut self, kind: EventKind, handler: Arc<dyn EventHandler>) -> Self {
        self.handlers[kind.index()] = handler;
        self
    }

    /// Route several kinds to the same handler.
    pub fn on_all(mut self, kinds: &[EventKind], handler: Arc<dyn EventHandler>) -> Self {
        for kind in kinds {
            self.handlers[kind.index()] = handler.clone();
        }
        self
    }

    pub fn handler(&self, kind: EventKind) -> &Arc<dyn EventHandler> {
        &self.handlers[kind.index()]
    }

    pub fn resolve(&self, topic: &Topic) -> Option<&Arc<dyn EventHandler>> {
        match topic {
            Topic::Known(kind) => Some(self.handler(*kind)),
            Topic::Unknown(_) => None,
        }
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::audit()
    }
}
