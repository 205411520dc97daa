//! Core types for the outbox. Topic-agnostic.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of an outbox row: pending → processing → done | error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Pending,
    Processing,
    Done,
    Error,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Pending => "pending",
            EventStatus::Processing => "processing",
            EventStatus::Done => "done",
            EventStatus::Error => "error",
        }
    }

    /// Done and error rows are never touched again by the dispatcher.
    pub fn is_terminal(&self) -> bool {
        matches!(self, EventStatus::Done | EventStatus::Error)
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(EventStatus::Pending),
            "processing" => Ok(EventStatus::Processing),
            "done" => Ok(EventStatus::Done),
            "error" => Ok(EventStatus::Error),
            other => Err(anyhow::anyhow!("unknown outbox status: {other}")),
        }
    }
}

/// A full outbox row. Returned by `load`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxEvent {
    pub id: Uuid,
    pub topic: String,
    pub payload: serde_json::Value,
    pub status: EventStatus,
    pub attempts: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Reference to a row that `claim` moved from pending to processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClaimedEvent {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
}

/// What `publish` hands back to the business transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Published {
    pub id: Uuid,
    pub topic: String,
}
