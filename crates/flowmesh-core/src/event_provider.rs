//! Event Provider: fire-and-maybe-wait event emission over the Queue Manager,
//! Completion Tracker, and Scheduled Event Manager (§4.7).

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::instrument;
use uuid::Uuid;

use crate::completion_tracker::CompletionTracker;
use crate::context::PropagationMeta;
use crate::error::EngineError;
use crate::queue_manager::{QueueManager, WorkerOptions};
use crate::scheduled_events::ScheduledEventManager;
use crate::store::{BackingStore, JobOptions, RawJob, RecurringTiming, StoreError};

/// On-wire shape of an emitted event (§4.7 "Event Message Envelope").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub version: u32,
    pub event_id: String,
    pub name: String,
    pub payload: Value,
    pub meta: Option<PropagationMeta>,
    pub correlation_id: String,
    pub causation_id: Option<String>,
    pub now: i64,
}

/// Per-emit overrides (§4.7).
#[derive(Debug, Clone, Default)]
pub struct EventOptions {
    pub delay: Option<Duration>,
    pub idempotency_key: Option<String>,
    /// `Some(Duration::ZERO)` and `None` both fall back to the provider's default
    /// timeout; pass `Some(Duration::ZERO)` is not itself meaningful — callers who want
    /// to disable the timeout outright should leave this `None` and rely on a
    /// zero-valued provider default instead, matching the "0 disables" convention used
    /// throughout §6's configuration defaults.
    pub timeout: Option<Duration>,
    pub causation_id: Option<String>,
}

pub type EventHandler =
    Arc<dyn Fn(EventEnvelope) -> BoxFuture<'static, Result<Value, EngineError>> + Send + Sync>;

/// A pending reply to one `emit` call. Resolves at most once (§4.7 settlement
/// guarantee, enforced by the Completion Tracker's settle gate, not by this type).
pub struct Subscription<T> {
    receiver: oneshot::Receiver<Result<Value, EngineError>>,
    _marker: PhantomData<T>,
}

impl<T: DeserializeOwned> Subscription<T> {
    fn new(receiver: oneshot::Receiver<Result<Value, EngineError>>) -> Self {
        Self {
            receiver,
            _marker: PhantomData,
        }
    }

    /// Awaits settlement and decodes the payload as `T`.
    pub async fn result(self) -> Result<T, EngineError> {
        match self.receiver.await {
            Ok(Ok(value)) => Ok(serde_json::from_value(value)?),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(EngineError::BackingStoreUnavailable(StoreError::ConnectionClosed)),
        }
    }
}

/// Emits and subscribes to events over a backing store (§4.7).
pub struct EventProvider<S: BackingStore> {
    queue_manager: Arc<QueueManager<S>>,
    completion_tracker: Arc<CompletionTracker<S>>,
    scheduled_events: ScheduledEventManager<S>,
    started: AtomicBool,
    default_timeout: Duration,
}

impl<S: BackingStore> EventProvider<S> {
    pub fn new(store: Arc<S>, default_retry: crate::reliability::RetryPolicy, default_timeout: Duration) -> Self {
        let queue_manager = Arc::new(QueueManager::new(Arc::clone(&store), default_retry));
        Self {
            completion_tracker: Arc::new(CompletionTracker::new(Arc::clone(&store))),
            scheduled_events: ScheduledEventManager::new(store),
            queue_manager,
            started: AtomicBool::new(false),
            default_timeout,
        }
    }

    pub fn start(&self) {
        self.started.store(true, Ordering::SeqCst);
    }

    fn require_started(&self) -> Result<(), EngineError> {
        if self.started.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(EngineError::NotStarted)
        }
    }

    /// Builds and submits an event envelope, registering the pending entry before
    /// submission so a reply racing the submission itself can never be missed (§4.7).
    #[instrument(skip(self, payload, meta))]
    pub async fn emit<T: DeserializeOwned>(
        &self,
        event_name: &str,
        payload: Value,
        meta: Option<PropagationMeta>,
        options: EventOptions,
    ) -> Result<Subscription<T>, EngineError> {
        self.require_started()?;
        let queue = QueueManager::<S>::event_queue_name(event_name);
        let correlation_id = Uuid::now_v7().to_string();

        let envelope = EventEnvelope {
            version: 1,
            event_id: Uuid::now_v7().to_string(),
            name: event_name.to_string(),
            payload,
            meta,
            correlation_id: correlation_id.clone(),
            causation_id: options.causation_id.clone(),
            now: chrono::Utc::now().timestamp_millis(),
        };
        let data = serde_json::to_value(&envelope)?;

        let job_opts = JobOptions {
            delay: options.delay,
            job_id: options.idempotency_key.clone(),
            ..Default::default()
        };
        let effective_timeout = options
            .timeout
            .or(Some(self.default_timeout))
            .filter(|d| !d.is_zero());

        let (tx, rx) = oneshot::channel();
        let tx = Arc::new(parking_lot::Mutex::new(Some(tx)));
        let tx_ok = Arc::clone(&tx);
        let tx_err = Arc::clone(&tx);
        self.completion_tracker
            .register(
                &queue,
                &correlation_id,
                Box::new(move |value| {
                    if let Some(sender) = tx_ok.lock().take() {
                        let _ = sender.send(Ok(value));
                    }
                }),
                Box::new(move |error| {
                    if let Some(sender) = tx_err.lock().take() {
                        let _ = sender.send(Err(error));
                    }
                }),
                effective_timeout,
            )
            .await?;

        match self.queue_manager.add_job(&queue, data, job_opts).await {
            Ok(job_id) => {
                self.completion_tracker.map_job_id(&queue, &job_id, &correlation_id);
            }
            Err(err) => {
                self.completion_tracker
                    .fail(&queue, &correlation_id, EngineError::BackingStoreUnavailable(err));
            }
        }

        Ok(Subscription::new(rx))
    }

    /// Registers a worker that decodes the envelope before handing it to `handler`
    /// (§4.7 "wrap the handler so it reads the envelope out of the raw job").
    pub async fn subscribe(&self, event_name: &str, handler: EventHandler) -> Result<(), EngineError> {
        self.require_started()?;
        let queue = QueueManager::<S>::event_queue_name(event_name);
        let wrapped: crate::store::WorkerHandler = Arc::new(move |job: RawJob| {
            let handler = Arc::clone(&handler);
            Box::pin(async move {
                let envelope: EventEnvelope =
                    serde_json::from_value(job.data).map_err(|e| e.to_string())?;
                handler(envelope).await.map_err(|e| e.to_string())
            })
        });
        self.queue_manager
            .register_worker(&queue, wrapped, WorkerOptions::default())
            .await
            .map_err(EngineError::BackingStoreUnavailable)
    }

    pub async fn schedule_event(
        &self,
        event_name: &str,
        schedule_id: &str,
        timing: RecurringTiming,
        payload: Value,
    ) -> Result<(), EngineError> {
        self.require_started()?;
        let queue = QueueManager::<S>::event_queue_name(event_name);
        match timing {
            RecurringTiming::Cron(expr) => {
                self.scheduled_events
                    .schedule_cron(&queue, schedule_id, &expr, payload)
                    .await
            }
            RecurringTiming::Interval(every) => {
                self.scheduled_events
                    .schedule_interval(&queue, schedule_id, every, payload)
                    .await
            }
        }
        .map_err(EngineError::BackingStoreUnavailable)
    }

    pub async fn unschedule_event(&self, event_name: &str, schedule_id: &str) -> Result<(), EngineError> {
        let queue = QueueManager::<S>::event_queue_name(event_name);
        self.scheduled_events
            .unschedule(&queue, schedule_id)
            .await
            .map_err(EngineError::BackingStoreUnavailable)
    }

    /// Shuts down in the order §4.7 requires: Queue Manager (workers drain, queues
    /// close) before the Completion Tracker's listeners, so no in-flight completion is
    /// dropped on the floor. Idempotent.
    pub async fn stop(&self) -> Result<(), EngineError> {
        if !self.started.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.queue_manager.stop().await.map_err(EngineError::BackingStoreUnavailable)?;
        self.completion_tracker.stop().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reliability::RetryPolicy;
    use crate::store::InMemoryBackingStore;

    fn provider() -> EventProvider<InMemoryBackingStore> {
        EventProvider::new(
            Arc::new(InMemoryBackingStore::new()),
            RetryPolicy::exponential(),
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn emit_before_start_is_rejected() {
        let provider = provider();
        let result = provider
            .emit::<Value>("monitor.check", Value::Null, None, EventOptions::default())
            .await;
        assert!(matches!(result, Err(EngineError::NotStarted)));
    }

    #[tokio::test]
    async fn emit_settles_once_a_subscriber_handles_it() {
        let provider = provider();
        provider.start();
        provider
            .subscribe(
                "monitor.check",
                Arc::new(|envelope: EventEnvelope| {
                    Box::pin(async move { Ok(serde_json::json!({"echo": envelope.payload})) })
                }),
            )
            .await
            .unwrap();

        let subscription = provider
            .emit::<Value>(
                "monitor.check",
                serde_json::json!({"host": "db-1"}),
                None,
                EventOptions::default(),
            )
            .await
            .unwrap();

        let value = tokio::time::timeout(Duration::from_secs(2), subscription.result())
            .await
            .expect("subscription settled")
            .unwrap();
        assert_eq!(value, serde_json::json!({"echo": {"host": "db-1"}}));
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let provider = provider();
        provider.start();
        provider.stop().await.unwrap();
        provider.stop().await.unwrap();
    }
}
