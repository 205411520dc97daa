use serde::Serialize;
use thiserror::Error;

/// Outcome of one counted hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HitResult {
    pub allowed: bool,
    /// Hits left in the window. Never negative on a counted path.
    pub remaining: i64,
    pub limit: i64,
    /// Seconds until the window this hit landed in closes.
    pub reset_seconds: u64,
}

impl HitResult {
    /// Result for a disabled limit. `remaining` echoes `limit` as given.
    pub fn unlimited(limit: i64) -> Self {
        Self {
            allowed: true,
            remaining: limit,
            limit,
            reset_seconds: 0,
        }
    }

    pub(crate) fn counted(count: i64, limit: i64, reset_seconds: u64) -> Self {
        Self {
            allowed: count <= limit,
            remaining: (limit - count).max(0),
            limit,
            reset_seconds,
        }
    }
}

/// Why the shared counter could not answer.
#[derive(Debug, Error)]
pub enum CounterError {
    #[error("bucket store is not ready")]
    NotReady,

    #[error("bucket store returned no count")]
    EmptyReply,

    #[error("bucket store did not answer within {0:?}")]
    Timeout(std::time::Duration),

    #[error("bucket store query failed: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("expected <limit>/<window_secs>, got {0:?}")]
    Malformed(String),
}
