//! Scheduled Event Manager: a thin typed wrapper over the backing store's recurring-job
//! facility (§4.6).

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::instrument;

use crate::store::{BackingStore, RecurringSpec, RecurringTiming, StoreError};

/// Schedules, unschedules, and lists recurring event emissions on a queue (§4.6).
/// Carries no state of its own beyond the store handle — the backing store owns the
/// schedule table so scheduling survives a process restart.
pub struct ScheduledEventManager<S: BackingStore> {
    store: Arc<S>,
}

impl<S: BackingStore> ScheduledEventManager<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    #[instrument(skip(self, payload))]
    pub async fn schedule_cron(
        &self,
        queue: &str,
        schedule_id: &str,
        cron_expr: &str,
        payload: Value,
    ) -> Result<(), StoreError> {
        self.store
            .schedule_recurring(
                queue,
                RecurringSpec {
                    schedule_id: schedule_id.to_string(),
                    timing: RecurringTiming::Cron(cron_expr.to_string()),
                    payload,
                },
            )
            .await
    }

    #[instrument(skip(self, payload))]
    pub async fn schedule_interval(
        &self,
        queue: &str,
        schedule_id: &str,
        every: Duration,
        payload: Value,
    ) -> Result<(), StoreError> {
        self.store
            .schedule_recurring(
                queue,
                RecurringSpec {
                    schedule_id: schedule_id.to_string(),
                    timing: RecurringTiming::Interval(every),
                    payload,
                },
            )
            .await
    }

    pub async fn unschedule(&self, queue: &str, schedule_id: &str) -> Result<(), StoreError> {
        self.store.unschedule_recurring(queue, schedule_id).await
    }

    pub async fn list_schedules(&self, queue: &str) -> Result<Vec<RecurringSpec>, StoreError> {
        self.store.list_schedules(queue).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryBackingStore;

    #[tokio::test]
    async fn schedule_cron_then_list_round_trips() {
        let manager = ScheduledEventManager::new(Arc::new(InMemoryBackingStore::new()));
        manager
            .schedule_cron("event.daily_report", "daily", "0 0 * * *", Value::Null)
            .await
            .unwrap();
        let schedules = manager.list_schedules("event.daily_report").await.unwrap();
        assert_eq!(schedules.len(), 1);
        assert_eq!(schedules[0].schedule_id, "daily");
        assert!(matches!(schedules[0].timing, RecurringTiming::Cron(ref expr) if expr == "0 0 * * *"));
    }

    #[tokio::test]
    async fn unschedule_removes_the_entry() {
        let manager = ScheduledEventManager::new(Arc::new(InMemoryBackingStore::new()));
        manager
            .schedule_interval("event.heartbeat", "hb", Duration::from_secs(30), Value::Null)
            .await
            .unwrap();
        manager.unschedule("event.heartbeat", "hb").await.unwrap();
        assert!(manager.list_schedules("event.heartbeat").await.unwrap().is_empty());
    }
}
