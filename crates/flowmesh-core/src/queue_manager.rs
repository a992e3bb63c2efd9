//! Queue Manager: owns per-name queues and worker registrations over the backing
//! store; hands out stable queue-name mappings (§4.4).

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{info, instrument, warn};

use crate::backpressure::{BackpressureConfig, BackpressureState};
use crate::reliability::RetryPolicy;
use crate::store::{BackingStore, JobOptions, JobSpec, StoreError, WorkerHandler};

/// `stalledInterval` may never be configured below this — avoids false stall detection
/// under normal GC pauses and network jitter (§4.4).
pub const MIN_STALL_INTERVAL: Duration = Duration::from_secs(5);

/// Per-queue worker options (§4.4 "Defaults").
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub concurrency: usize,
    pub stall_interval: Duration,
    /// When set, the handler installed on the store is wrapped with a
    /// [`BackpressureState`] gate sized to `concurrency`: a job arriving while the
    /// worker is over its high watermark is rejected immediately (and so retried
    /// through the job's normal backoff) rather than queued up behind an already
    /// saturated pool.
    pub backpressure: Option<BackpressureConfig>,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            concurrency: 1,
            stall_interval: MIN_STALL_INTERVAL,
            backpressure: None,
        }
    }
}

impl WorkerOptions {
    /// Clamps `stall_interval` up to [`MIN_STALL_INTERVAL`] rather than rejecting the
    /// call outright — the validation spec calls for happens once, here, at the single
    /// place worker options are accepted.
    pub fn validated(mut self) -> Self {
        if self.stall_interval < MIN_STALL_INTERVAL {
            self.stall_interval = MIN_STALL_INTERVAL;
        }
        self
    }
}

/// Owns queue/worker bookkeeping over a [`BackingStore`]. Memoizes which queues have a
/// registered worker so `register_worker` with the same name is cheap to repeat across
/// submission sites, and enforces the default job retry policy (§4.4, §6).
pub struct QueueManager<S: BackingStore> {
    store: Arc<S>,
    default_retry: RetryPolicy,
    registered_workers: Mutex<HashSet<String>>,
}

impl<S: BackingStore> QueueManager<S> {
    pub fn new(store: Arc<S>, default_retry: RetryPolicy) -> Self {
        Self {
            store,
            default_retry,
            registered_workers: Mutex::new(HashSet::new()),
        }
    }

    /// Deterministic canonical queue name for an event (§4.4: `event.${name}`).
    /// Workflow queue names are computed by [`crate::flow_builder`] instead, since they
    /// depend on the configured queue prefix.
    pub fn event_queue_name(event_name: &str) -> String {
        format!("event.{event_name}")
    }

    #[instrument(skip(self, data, opts))]
    pub async fn add_job(
        &self,
        queue: &str,
        data: Value,
        mut opts: JobOptions,
    ) -> Result<String, StoreError> {
        if opts.attempts.is_none() {
            opts.attempts = Some(self.default_retry.max_attempts);
        }
        if opts.backoff.is_none() {
            opts.backoff = Some(crate::store::BackoffSpec {
                kind: crate::store::BackoffKind::Exponential,
                base: self.default_retry.initial_interval,
            });
        }
        self.store.add_job(queue, data, opts).await
    }

    pub async fn submit_tree(&self, tree: JobSpec) -> Result<String, StoreError> {
        self.store.submit_tree(tree).await
    }

    /// Registers (or re-registers) a worker for `queue`, memoizing that this instance
    /// has one installed.
    #[instrument(skip(self, handler))]
    pub async fn register_worker(
        &self,
        queue: &str,
        handler: WorkerHandler,
        opts: WorkerOptions,
    ) -> Result<(), StoreError> {
        let opts = opts.validated();
        let handler = match &opts.backpressure {
            Some(config) => wrap_with_backpressure(queue.to_string(), handler, config.clone(), opts.concurrency),
            None => handler,
        };
        self.store
            .register_worker(queue, opts.concurrency, opts.stall_interval, handler)
            .await?;
        self.registered_workers.lock().insert(queue.to_string());
        Ok(())
    }

    pub fn has_worker(&self, queue: &str) -> bool {
        self.registered_workers.lock().contains(queue)
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Closes every worker, then every queue — order matters because workers consume
    /// queues (§4.4 "stop()").
    pub async fn stop(&self) -> Result<(), StoreError> {
        let queues: Vec<String> = self.registered_workers.lock().drain().collect();
        for queue in &queues {
            self.store.stop_worker(queue).await?;
        }
        for queue in &queues {
            self.store.close_queue(queue).await?;
        }
        info!(count = queues.len(), "queue manager stopped");
        Ok(())
    }
}

/// Wraps `handler` with a backpressure gate: rejects (as a handler error, the same
/// shape a failing job uses) rather than executes when the worker is over its high
/// watermark.
fn wrap_with_backpressure(
    queue: String,
    handler: WorkerHandler,
    config: BackpressureConfig,
    concurrency: usize,
) -> WorkerHandler {
    let state = Arc::new(BackpressureState::new(config, concurrency.max(1)));
    Arc::new(move |job| {
        let handler = Arc::clone(&handler);
        let state = Arc::clone(&state);
        let queue = queue.clone();
        Box::pin(async move {
            if !state.should_accept() {
                warn!(%queue, job_id = %job.id, load_ratio = state.load_ratio(), "rejecting job under backpressure");
                return Err(format!("worker for {queue} is over its backpressure watermark"));
            }
            state.task_started();
            let result = handler(job).await;
            state.task_completed();
            result
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryBackingStore;

    #[tokio::test]
    async fn add_job_fills_in_default_retry() {
        let manager = QueueManager::new(Arc::new(InMemoryBackingStore::new()), RetryPolicy::exponential());
        let id = manager
            .add_job("q", Value::Null, JobOptions::default())
            .await
            .unwrap();
        assert!(!id.is_empty());
    }

    #[test]
    fn worker_options_clamp_stall_interval_to_minimum() {
        let opts = WorkerOptions {
            stall_interval: Duration::from_secs(1),
            ..WorkerOptions::default()
        }
        .validated();
        assert_eq!(opts.stall_interval, MIN_STALL_INTERVAL);
    }

    #[test]
    fn event_queue_name_follows_naming_scheme() {
        assert_eq!(QueueManager::<InMemoryBackingStore>::event_queue_name("monitor.check"), "event.monitor.check");
    }

    #[tokio::test]
    async fn backpressure_wrapped_handler_rejects_once_load_crosses_the_high_watermark() {
        use crate::store::RawJob;

        let job = |id: &str| RawJob { id: id.to_string(), queue: "q".to_string(), name: "q".to_string(), data: Value::Null };

        let slow: WorkerHandler = Arc::new(|job| {
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(job.data)
            })
        });
        let config = BackpressureConfig::new().with_high_watermark(0.5).with_low_watermark(0.2);
        let wrapped = wrap_with_backpressure("q".to_string(), slow, config, 2);

        // Spawn one job and, while it's still in flight, issue a second: the second
        // now observes 50% load on a concurrency of 2, at the high watermark.
        let handle = tokio::spawn(wrapped(job("a")));
        tokio::task::yield_now().await;
        let result = wrapped(job("b")).await;
        assert!(result.is_err());
        handle.await.unwrap().unwrap();
    }
}
