//! Completion Tracker: bridges a queue's durable completed/failed stream to the
//! in-process caller still waiting on a result (§4.5).
//!
//! Owns, per backing-store queue, a lazily-started listener task over
//! [`crate::store::BackingStore::subscribe_durable_events`]. Callers `register` a
//! correlation id before submitting the job that will eventually settle it, optionally
//! `mapJobId` once the job id is known (submission can race the listener), and the
//! listener resolves `job_id -> correlation_id` to call `complete`/`fail` when the event
//! arrives. Both the listener and a timed-out registration converge on the same
//! exactly-once settlement path: removing the `(queue, correlation_id)` entry from
//! `pending` is what decides who gets to run the callback.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, trace, warn};

use crate::error::EngineError;
use crate::store::{BackingStore, DurableEvent};

pub type SuccessCallback = Box<dyn FnOnce(Value) + Send>;
pub type ErrorCallback = Box<dyn FnOnce(EngineError) + Send>;

struct PendingEntry {
    on_success: SuccessCallback,
    on_error: ErrorCallback,
    timeout_task: Option<JoinHandle<()>>,
}

struct ListenerState {
    task: JoinHandle<()>,
}

/// Settles in-process callbacks against a backing store's durable event streams.
///
/// Shared freely via `Arc` — every operation takes `&self` and the internal maps use
/// their own concurrency control, so a clone handed to a spawned listener task and the
/// handle kept by the Event Provider / Workflow Provider observe the same state.
pub struct CompletionTracker<S: BackingStore> {
    store: Arc<S>,
    pending: DashMap<(String, String), PendingEntry>,
    job_to_correlation: DashMap<(String, String), String>,
    listeners: Mutex<std::collections::HashMap<String, ListenerState>>,
}

impl<S: BackingStore> CompletionTracker<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            pending: DashMap::new(),
            job_to_correlation: DashMap::new(),
            listeners: Mutex::new(std::collections::HashMap::new()),
        }
    }

    /// Installs a pending entry for `(queue, correlation_id)`, arming a timeout if given.
    /// Starts the queue's listener if this is the first registration for it (§4.5
    /// "lazily-constructed").
    #[instrument(skip(self, on_success, on_error))]
    pub async fn register(
        self: &Arc<Self>,
        queue: &str,
        correlation_id: &str,
        on_success: SuccessCallback,
        on_error: ErrorCallback,
        timeout: Option<Duration>,
    ) -> Result<(), crate::store::StoreError> {
        self.ensure_listener(queue).await?;

        let timeout_task = timeout.map(|duration| {
            let tracker = Arc::clone(self);
            let queue = queue.to_string();
            let correlation_id = correlation_id.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(duration).await;
                tracker.fail(&queue, &correlation_id, EngineError::Timeout(correlation_id.clone()));
            })
        });

        self.pending.insert(
            (queue.to_string(), correlation_id.to_string()),
            PendingEntry {
                on_success,
                on_error,
                timeout_task,
            },
        );
        Ok(())
    }

    /// Records that `job_id` (once known) settles the given correlation id. Submission
    /// can race the listener, so an event that arrives before this call is mapped is
    /// simply dropped — legal per §4.5, the caller only cares about its own instance's
    /// pending registrations.
    pub fn map_job_id(&self, queue: &str, job_id: &str, correlation_id: &str) {
        self.job_to_correlation.insert(
            (queue.to_string(), job_id.to_string()),
            correlation_id.to_string(),
        );
    }

    pub fn get_correlation_id(&self, queue: &str, job_id: &str) -> Option<String> {
        self.job_to_correlation
            .get(&(queue.to_string(), job_id.to_string()))
            .map(|entry| entry.value().clone())
    }

    pub fn has_pending(&self, queue: &str, correlation_id: &str) -> bool {
        self.pending
            .contains_key(&(queue.to_string(), correlation_id.to_string()))
    }

    /// Settles a pending entry with success. A no-op if it already settled (timeout beat
    /// the event, or it was never registered on this instance) — the `remove` below is
    /// the single point deciding who wins.
    pub fn complete(&self, queue: &str, correlation_id: &str, value: Value) {
        if let Some((_, entry)) = self.pending.remove(&(queue.to_string(), correlation_id.to_string())) {
            if let Some(task) = entry.timeout_task {
                task.abort();
            }
            (entry.on_success)(value);
        }
        self.forget_job_mapping_for(queue, correlation_id);
    }

    pub fn fail(&self, queue: &str, correlation_id: &str, error: EngineError) {
        if let Some((_, entry)) = self.pending.remove(&(queue.to_string(), correlation_id.to_string())) {
            if let Some(task) = entry.timeout_task {
                task.abort();
            }
            (entry.on_error)(error);
        }
        self.forget_job_mapping_for(queue, correlation_id);
    }

    fn forget_job_mapping_for(&self, queue: &str, correlation_id: &str) {
        self.job_to_correlation
            .retain(|(q, _), c| !(q.as_str() == queue && c.as_str() == correlation_id));
    }

    /// Starts the per-queue listener task if one isn't already running.
    async fn ensure_listener(self: &Arc<Self>, queue: &str) -> Result<(), crate::store::StoreError> {
        if self.listeners.lock().contains_key(queue) {
            return Ok(());
        }
        let mut receiver = self.store.subscribe_durable_events(queue).await?;
        self.store.wait_until_ready(queue).await?;

        let tracker = Arc::clone(self);
        let queue_owned = queue.to_string();
        let task = tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(DurableEvent::Completed { job_id, return_value }) => {
                        tracker.on_durable_event(&queue_owned, &job_id, Ok(return_value));
                    }
                    Ok(DurableEvent::Failed { job_id, failed_reason }) => {
                        tracker.on_durable_event(&queue_owned, &job_id, Err(failed_reason));
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(queue = %queue_owned, skipped, "completion tracker lagged behind durable event stream");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                        debug!(queue = %queue_owned, "durable event stream closed, stopping listener");
                        break;
                    }
                }
            }
        });

        self.listeners
            .lock()
            .insert(queue.to_string(), ListenerState { task });
        Ok(())
    }

    fn on_durable_event(&self, queue: &str, job_id: &str, outcome: Result<Value, String>) {
        let Some(correlation_id) = self.get_correlation_id(queue, job_id) else {
            trace!(queue, job_id, "durable event with no mapped correlation id, ignoring");
            return;
        };
        match outcome {
            Ok(value) => self.complete(queue, &correlation_id, value),
            Err(reason) => self.fail(queue, &correlation_id, EngineError::StepFailure {
                step_name: job_id.to_string(),
                source: reason.into(),
            }),
        }
    }

    /// Stops every queue's listener task. Pending entries are left untouched — callers
    /// that still care should already have applied their own shutdown timeout.
    pub async fn stop(&self) {
        let listeners = std::mem::take(&mut *self.listeners.lock());
        for (_, state) in listeners {
            state.task.abort();
        }
    }
}
