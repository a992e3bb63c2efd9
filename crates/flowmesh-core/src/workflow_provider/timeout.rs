//! Timeout Engine (§4.8.4) and Step Timeout (§4.8.5).

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::completion_tracker::CompletionTracker;
use crate::error::EngineError;
use crate::store::{BackingStore, JobState};

/// Arms a flow's end-to-end timeout. `effective` should already include the
/// stall-interval pad (§4.8.4: "augmented to `effective = base + stall-interval`").
///
/// On fire: if the pending latch already settled (another signal beat the timer), does
/// nothing. Otherwise consults the store — a `completed` state means the timer was a
/// near-miss and the stored value is delivered instead of an error; `failed` is left
/// alone for the durable fail event to reject; anything else rejects with
/// [`EngineError::WorkflowTimeout`]. Every branch settles through
/// [`CompletionTracker::complete`]/[`CompletionTracker::fail`], the same gate the
/// durable-event listener uses, so exactly one signal ever reaches the caller.
pub fn arm<S: BackingStore>(
    store: Arc<S>,
    tracker: Arc<CompletionTracker<S>>,
    queue: String,
    root_job_id: String,
    effective: Duration,
) {
    tokio::spawn(async move {
        tokio::time::sleep(effective).await;
        if !tracker.has_pending(&queue, &root_job_id) {
            return;
        }
        match store.find_job_by_id(&queue, &root_job_id).await {
            Ok(Some(JobState::Completed)) => {
                let value = store
                    .get_return_value(&queue, &root_job_id)
                    .await
                    .ok()
                    .flatten()
                    .unwrap_or(Value::Null);
                tracker.complete(&queue, &root_job_id, value);
            }
            Ok(Some(JobState::Failed)) => {
                // The durable `failed` event will reject this latch; nothing to do here.
            }
            _ => {
                tracker.fail(&queue, &root_job_id, EngineError::WorkflowTimeout);
            }
        }
    });
}

/// Races `fut` against a one-shot timer when `step_timeout` is non-zero (§4.8.5).
/// `Duration::ZERO` disables the timeout and runs `fut` uncontested.
pub async fn with_step_timeout<F>(
    step_timeout: Duration,
    step_name: &str,
    fut: F,
) -> Result<Value, EngineError>
where
    F: Future<Output = Result<Value, EngineError>>,
{
    if step_timeout.is_zero() {
        return fut.await;
    }
    match tokio::time::timeout(step_timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(EngineError::StepTimeout(step_name.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryBackingStore, JobOptions};

    #[tokio::test]
    async fn step_timeout_of_zero_disables_the_race() {
        let result = with_step_timeout(Duration::ZERO, "slow_step", async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(Value::Null)
        })
        .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn step_timeout_fires_before_completion() {
        let result = with_step_timeout(Duration::from_millis(10), "slow_step", async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(Value::Null)
        })
        .await;
        assert!(matches!(result, Err(EngineError::StepTimeout(name)) if name == "slow_step"));
    }

    #[tokio::test]
    async fn near_miss_timeout_delivers_stored_value() {
        let store = Arc::new(InMemoryBackingStore::new());
        // No worker registered on the tracker's listener path; the job settles via a
        // direct `add_job` + manual worker loop stand-in so the timer genuinely finds
        // a `Completed` job in the store when it fires, without racing the tracker's
        // own durable-event path.
        let handler: crate::store::WorkerHandler = Arc::new(|job| Box::pin(async move { Ok(job.data) }));
        store
            .register_worker("q", 1, Duration::from_secs(5), handler)
            .await
            .unwrap();
        let job_id = store
            .add_job("q", serde_json::json!(99), JobOptions::default())
            .await
            .unwrap();
        // give the in-memory worker loop a moment to pick up and complete the job
        // before the timer (armed further below) ever fires.
        tokio::time::sleep(Duration::from_millis(20)).await;

        let tracker = Arc::new(CompletionTracker::new(Arc::clone(&store)));
        let (tx, rx) = tokio::sync::oneshot::channel();
        tracker
            .register(
                "q",
                &job_id,
                Box::new(move |v| {
                    let _ = tx.send(v);
                }),
                Box::new(|_| panic!("unexpected failure")),
                None,
            )
            .await
            .unwrap();

        arm(Arc::clone(&store), Arc::clone(&tracker), "q".to_string(), job_id, Duration::from_millis(10));

        let value = tokio::time::timeout(Duration::from_secs(1), rx).await.unwrap().unwrap();
        assert_eq!(value, serde_json::json!(99));
    }
}
