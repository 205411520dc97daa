//! Publishes `tags.nightly.stats` once per UTC day.
//!
//! The scheduler only writes to the outbox; the stats work itself happens in
//! whatever handler the registry routes `TagsNightlyStats` to. Every replica
//! runs a scheduler, and the per-date dedup key keeps it to one event a day.

use anyhow::Result;
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use cms_outbox::{OutboxStore, Published};

use crate::topic::EventKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NightlySchedule {
    at: NaiveTime,
}

impl NightlySchedule {
    /// `None` unless `hour_utc` is 0..=23.
    pub fn at_hour(hour_utc: u32) -> Option<Self> {
        NaiveTime::from_hms_opt(hour_utc, 0, 0).map(|at| Self { at })
    }

    /// The first scheduled instant strictly after `now`.
    pub fn next_run_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let today = now.date_naive().and_time(self.at).and_utc();
        if today > now {
            today
        } else {
            today + Duration::days(1)
        }
    }
}

/// Publish the stats event for `date` unless some replica already has.
pub async fn publish_nightly_stats<S: OutboxStore>(store: &S, date: NaiveDate) -> Result<Option<Published>> {
    let topic = EventKind::TagsNightlyStats.as_str();
    let dedup_key = format!("{topic}:{date}");
    store
        .publish_once(topic, &dedup_key, json!({ "date": date.to_string() }))
        .await
}

/// Spawn the nightly publisher. Stops when `cancel` fires.
pub fn spawn_nightly_stats<S>(
    store: S,
    schedule: NightlySchedule,
    cancel: CancellationToken,
) -> JoinHandle<()>
where
    S: OutboxStore + 'static,
{
    tokio::spawn(async move {
        loop {
            let now = Utc::now();
            let next = schedule.next_run_after(now);
            let wait = (next - now).to_std().unwrap_or_default();

            info!(next_run = %next, "Nightly tag stats scheduled");

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }

            match publish_nightly_stats(&store, next.date_naive()).await {
                Ok(Some(published)) => info!(id = %published.id, "Published nightly tag stats event"),
                Ok(None) => debug!("Nightly tag stats already published by another replica"),
                Err(e) => error!(error = ?e, "Failed to publish nightly tag stats event"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use cms_outbox::MemoryOutboxStore;

    #[tokio::test]
    async fn replicas_publish_one_event_per_date() {
        let store = MemoryOutboxStore::new();
        let date = NaiveDate::from_ymd_opt(2026, 3, 10).unwrap();

        let first = publish_nightly_stats(&store, date).await.unwrap();
        let second = publish_nightly_stats(&store, date).await.unwrap();
        let next_day = publish_nightly_stats(&store, date.succ_opt().unwrap()).await.unwrap();

        assert!(first.is_some());
        assert!(second.is_none());
        assert!(next_day.is_some());

        let events = store.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].topic, "tags.nightly.stats");
        assert_eq!(events[0].payload, json!({ "date": "2026-03-10" }));
        assert_eq!(events[1].payload, json!({ "date": "2026-03-11" }));
    }

    #[test]
    fn rejects_out_of_range_hour() {
        assert!(NightlySchedule::at_hour(24).is_none());
        assert!(NightlySchedule::at_hour(0).is_some());
    }

    #[test]
    fn next_run_is_later_today_when_hour_not_reached() {
        let schedule = NightlySchedule::at_hour(3).unwrap();
        let now = Utc.with_ymd_and_hms(2026, 3, 10, 1, 30, 0).unwrap();
        assert_eq!(
            schedule.next_run_after(now),
            Utc.with_ymd_and_hms(2026, 3, 10, 3, 0, 0).unwrap()
        );
    }

    #[test]
    fn next_run_rolls_to_tomorrow_at_or_after_hour() {
        let schedule = NightlySchedule::at_hour(3).unwrap();

        let exactly = Utc.with_ymd_and_hms(2026, 3, 10, 3, 0, 0).unwrap();
        assert_eq!(
            schedule.next_run_after(exactly),
            Utc.with_ymd_and_hms(2026, 3, 11, 3, 0, 0).unwrap()
        );

        let later = Utc.with_ymd_and_hms(2026, 12, 31, 22, 0, 0).unwrap();
        assert_eq!(
            schedule.next_run_after(later),
            Utc.with_ymd_and_hms(2027, 1, 1, 3, 0, 0).unwrap()
        );
    }
}
