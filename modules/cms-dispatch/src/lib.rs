//! Outbox dispatcher.
//!
//! A polling loop: claim a batch of pending events → resolve a handler by
//! topic → invoke → mark done or error. One tick at a time; a failing handler
//! never takes the rest of the batch down with it.
//!
//! The topic catalog is closed (`EventKind`). Anything else parses to
//! `Topic::Unknown` and is acknowledged without running a handler.

pub mod dispatcher;
pub mod handler;
pub mod registry;
pub mod runner;
pub mod schedule;
pub mod topic;

pub use dispatcher::{Dispatcher, TickStats, BATCH_SIZE};
pub use handler::{AuditHandler, EventHandler};
pub use registry::HandlerRegistry;
pub use runner::{spawn_dispatcher, DispatcherHandle, DispatcherStatus};
pub use schedule::{publish_nightly_stats, spawn_nightly_stats, NightlySchedule};
pub use topic::{EventKind, Topic};
