//! The backing store contract (spec §6).
//!
//! Everything the engine needs from the external queue/stream/key-value collaborator is
//! expressed as a single async trait. [`crate::store::memory`] provides an in-process
//! implementation for tests and single-instance use; `flowmesh-redis` provides the
//! production implementation over Redis.

mod memory;

pub use memory::InMemoryBackingStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;

/// Errors a backing store implementation may return.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job not found: {queue}/{job_id}")]
    JobNotFound { queue: String, job_id: String },

    #[error("duplicate job id {job_id:?} on queue {queue:?} is still in flight")]
    DuplicateJobId { queue: String, job_id: String },

    #[error("connection closed")]
    ConnectionClosed,

    #[error("backend error: {0}")]
    Backend(String),
}

/// State of a job as reported by `findJobById` (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Completed,
    Failed,
    Active,
    Waiting,
    WaitingChildren,
    Delayed,
}

/// Options accepted by `addJob` / the dependent-job tree (spec §6).
#[derive(Debug, Clone, Default)]
pub struct JobOptions {
    pub delay: Option<Duration>,
    pub job_id: Option<String>,
    pub attempts: Option<u32>,
    pub backoff: Option<BackoffSpec>,
    pub fail_parent_on_failure: bool,
}

/// Backoff specification attached to a job (spec §4.4 default retry policy).
#[derive(Debug, Clone, Copy)]
pub struct BackoffSpec {
    pub kind: BackoffKind,
    pub base: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffKind {
    Fixed,
    Exponential,
}

/// One node of a dependent-job submission tree (spec §4.3, §6).
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub name: String,
    pub queue_name: String,
    pub data: Value,
    pub opts: JobOptions,
    pub children: Vec<JobSpec>,
}

/// The raw job object handed to a registered worker handler (spec §4.4: "invoking the
/// handler with the raw job object (envelope or wrapper)").
#[derive(Debug, Clone)]
pub struct RawJob {
    pub id: String,
    pub queue: String,
    pub name: String,
    pub data: Value,
}

/// A `completed`/`failed` notification from a queue's durable event stream (spec §4.5,
/// §6). `Serialize`/`Deserialize` let a networked store relay these over a wire format
/// (e.g. `flowmesh-redis` publishing on a pub/sub channel).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DurableEvent {
    Completed { job_id: String, return_value: Value },
    Failed { job_id: String, failed_reason: String },
}

/// A recurring/delayed event registration (spec §4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecurringSpec {
    pub schedule_id: String,
    pub timing: RecurringTiming,
    pub payload: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RecurringTiming {
    Cron(String),
    Interval(Duration),
}

/// A worker handler: takes the raw job, returns its stored return value or a failure
/// reason string (mirrors the teacher's `ActivityHandler` alias).
pub type WorkerHandler = std::sync::Arc<
    dyn Fn(RawJob) -> futures::future::BoxFuture<'static, Result<Value, String>> + Send + Sync,
>;

/// The backing store contract consumed by the engine (spec §6).
///
/// An implementer provides typed queues with dependent-job submission, durable
/// completion/failure streams, a recurring-job facility, and a small TTL'd key/value
/// facility for the flow registry. This trait is the sole seam between the engine and
/// the external queue system — the engine never talks to Redis (or anything else)
/// directly.
#[async_trait]
pub trait BackingStore: Send + Sync + 'static {
    /// Submit a single job. Rejects (returns `Err(StoreError::DuplicateJobId)`) when
    /// `opts.job_id` collides with an in-flight job, mirroring `addJob`'s duplicate
    /// rejection in spec §6.
    async fn add_job(&self, queue: &str, data: Value, opts: JobOptions)
        -> Result<String, StoreError>;

    /// Submit a dependent-job tree; returns the root job's id.
    async fn submit_tree(&self, tree: JobSpec) -> Result<String, StoreError>;

    /// Look up a job's state. `None` means the store has no record (evicted, or never
    /// existed — spec's Open Question on `NotFound` vs `Pending` is resolved at the
    /// Workflow Provider layer, not here).
    async fn find_job_by_id(&self, queue: &str, job_id: &str) -> Result<Option<JobState>, StoreError>;

    /// Read a job's return value if it has completed.
    async fn get_return_value(&self, queue: &str, job_id: &str) -> Result<Option<Value>, StoreError>;

    /// Read a job's failure reason if it has failed.
    async fn get_failed_reason(&self, queue: &str, job_id: &str) -> Result<Option<String>, StoreError>;

    /// `getChildrenValues()` — a map keyed by opaque child identifier to that child's
    /// stored return value. Order is insertion order (the order children were declared
    /// in the submitted tree), matching the Result Codec's ordered-merge requirement
    /// (spec §4.2).
    async fn get_children_values(
        &self,
        queue: &str,
        job_id: &str,
    ) -> Result<Vec<(String, Value)>, StoreError>;

    /// Register a worker for a queue, replacing any prior handler.
    async fn register_worker(
        &self,
        queue: &str,
        concurrency: usize,
        stall_interval: Duration,
        handler: WorkerHandler,
    ) -> Result<(), StoreError>;

    /// Stop the worker for a queue (waits for in-flight jobs).
    async fn stop_worker(&self, queue: &str) -> Result<(), StoreError>;

    /// Close a queue. Workers on it must already be stopped (spec §4.4 "order matters").
    async fn close_queue(&self, queue: &str) -> Result<(), StoreError>;

    /// Subscribe to a queue's durable completed/failed stream.
    async fn subscribe_durable_events(&self, queue: &str) -> Result<broadcast::Receiver<DurableEvent>, StoreError>;

    /// Block until the durable event listener for a queue is ready to receive
    /// (`waitUntilReady`, spec §4.5 — "fast-completing jobs cannot miss their events").
    async fn wait_until_ready(&self, queue: &str) -> Result<(), StoreError>;

    /// Register a recurring event specification.
    async fn schedule_recurring(&self, queue: &str, spec: RecurringSpec) -> Result<(), StoreError>;

    /// Remove a recurring event specification.
    async fn unschedule_recurring(&self, queue: &str, schedule_id: &str) -> Result<(), StoreError>;

    /// List recurring specifications registered for a queue.
    async fn list_schedules(&self, queue: &str) -> Result<Vec<RecurringSpec>, StoreError>;

    /// `set key value EX seconds` — the flow registry's key/value facility (spec §6).
    async fn kv_set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    /// `get key`.
    async fn kv_get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Move a job to the dead-letter queue. Default no-op: spec's Open Questions leave
    /// DLQ disposition unspecified, so the engine never calls this unless a store opts
    /// in (mirrors the teacher's default-no-op optional trait surface).
    async fn move_to_dlq(&self, _queue: &str, _job_id: &str, _error_history: Vec<String>) -> Result<(), StoreError> {
        Ok(())
    }
}
