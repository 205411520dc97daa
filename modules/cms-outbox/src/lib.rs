//! Transactional outbox: a durable log of outbound events.
//!
//! Business modules publish a row in the same transaction as their primary
//! write. The dispatcher later claims pending rows in batches, hands them to
//! handlers and records the outcome. Payloads are opaque JSON; the store never
//! looks inside them.

pub mod memory;
pub mod store;
pub mod traits;
pub mod types;

pub use memory::MemoryOutboxStore;
pub use store::PgOutboxStore;
pub use traits::OutboxStore;
pub use types::{ClaimedEvent, EventStatus, OutboxEvent, Published};
