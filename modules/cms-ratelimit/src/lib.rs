//! Fixed-window rate limiting.
//!
//! `RateLimiter::hit` counts against a shared bucket store when one is
//! reachable and falls back to a per-process map when it is not. The quota
//! gate applies per-scope policies to inbound HTTP requests.

pub mod counter;
pub mod gate;
pub mod limiter;
pub mod memory;
pub mod shared;
pub mod store;
pub mod sweeper;
pub mod types;

pub use counter::{Counter, FallbackCounter, LocalCounter};
pub use gate::{enforce_quota, Decision, Identity, Principal, QuotaGate, Scope, ScopePolicy};
pub use limiter::{RateLimiter, MAX_WINDOW_SECS};
pub use memory::{BucketMode, MemoryBucketStore};
pub use shared::{BucketStore, SharedCounter};
pub use store::PgBucketStore;
pub use sweeper::spawn_bucket_sweeper;
pub use types::{CounterError, HitResult, PolicyError};
