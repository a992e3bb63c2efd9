//! In-memory [`BackingStore`](super::BackingStore) implementation.
//!
//! A `parking_lot::RwLock`-guarded `HashMap`-backed state, used for tests and
//! single-process deployments where a real Redis instance isn't available. It
//! implements the full dependent-job tree semantics, including `waiting-children` gating
//! and `failParentOnFailure` cascades, rather than a simplified stand-in, so tests
//! written against it exercise the same tree logic the Flow Builder produces for a real
//! store.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::{broadcast, watch, Notify, Semaphore};
use tracing::{debug, instrument, trace};
use uuid::Uuid;

use super::{
    BackingStore, DurableEvent, JobOptions, JobSpec, JobState, RawJob, RecurringSpec,
    RecurringTiming, StoreError, WorkerHandler,
};

struct JobRecord {
    id: String,
    queue: String,
    name: String,
    data: Value,
    state: JobState,
    fail_parent_on_failure: bool,
    parent: Option<(String, String)>,
    children: Vec<(String, String)>,
    pending_children: usize,
    return_value: Option<Value>,
    failed_reason: Option<String>,
}

struct QueueState {
    ready: VecDeque<(String, String)>,
    notify: Arc<Notify>,
    events_tx: broadcast::Sender<DurableEvent>,
    shutdown_tx: Option<watch::Sender<bool>>,
    worker_task: Option<tokio::task::JoinHandle<()>>,
    schedules: HashMap<String, RecurringSpec>,
    schedule_tasks: HashMap<String, tokio::task::JoinHandle<()>>,
}

impl QueueState {
    fn new() -> Self {
        let (events_tx, _) = broadcast::channel(1024);
        Self {
            ready: VecDeque::new(),
            notify: Arc::new(Notify::new()),
            events_tx,
            shutdown_tx: None,
            worker_task: None,
            schedules: HashMap::new(),
            schedule_tasks: HashMap::new(),
        }
    }
}

struct Shared {
    queues: RwLock<HashMap<String, QueueState>>,
    jobs: RwLock<HashMap<(String, String), JobRecord>>,
    kv: RwLock<HashMap<String, (String, Instant)>>,
}

/// An in-process [`BackingStore`](super::BackingStore). Not durable across process
/// restarts — use `flowmesh-redis` for cross-instance deployments.
///
/// Cheap to clone: internally an `Arc` handle, so a spawned worker loop can own a copy
/// without borrowing from the original.
#[derive(Clone)]
pub struct InMemoryBackingStore(Arc<Shared>);

impl std::ops::Deref for InMemoryBackingStore {
    type Target = Shared;
    fn deref(&self) -> &Shared {
        &self.0
    }
}

impl Default for InMemoryBackingStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBackingStore {
    pub fn new() -> Self {
        Self(Arc::new(Shared {
            queues: RwLock::new(HashMap::new()),
            jobs: RwLock::new(HashMap::new()),
            kv: RwLock::new(HashMap::new()),
        }))
    }

    fn job_id(opts: &JobOptions) -> String {
        opts.job_id
            .clone()
            .unwrap_or_else(|| Uuid::now_v7().to_string())
    }

    fn ensure_queue<'a>(
        queues: &'a mut HashMap<String, QueueState>,
        name: &str,
    ) -> &'a mut QueueState {
        queues.entry(name.to_string()).or_insert_with(QueueState::new)
    }

    fn push_ready(&self, queue: &str, job_id: &str) {
        let mut queues = self.queues.write();
        let state = Self::ensure_queue(&mut queues, queue);
        state.ready.push_back((queue.to_string(), job_id.to_string()));
        state.notify.notify_waiters();
    }

    /// Insert a dependent-job tree, deepest nodes first, wiring parent/child links and
    /// leaving leaves immediately ready while internal nodes start `waiting-children`.
    fn insert_tree(&self, spec: JobSpec, parent: Option<(String, String)>) -> String {
        let id = Self::job_id(&spec.opts);
        let mut child_ids = Vec::with_capacity(spec.children.len());
        for child in spec.children {
            let child_id = self.insert_tree(child, Some((spec.queue_name.clone(), id.clone())));
            child_ids.push(child_id);
        }

        let pending_children = child_ids.len();
        let record = JobRecord {
            id: id.clone(),
            queue: spec.queue_name.clone(),
            name: spec.name.clone(),
            data: spec.data,
            state: if pending_children == 0 {
                JobState::Waiting
            } else {
                JobState::WaitingChildren
            },
            fail_parent_on_failure: spec.opts.fail_parent_on_failure,
            parent,
            children: child_ids
                .into_iter()
                .map(|cid| (spec.queue_name.clone(), cid))
                .collect(),
            pending_children,
            return_value: None,
            failed_reason: None,
        };

        self.jobs
            .write()
            .insert((spec.queue_name.clone(), id.clone()), record);

        if pending_children == 0 {
            self.push_ready(&spec.queue_name, &id);
        }

        id
    }

    fn complete_job(&self, queue: &str, job_id: &str, value: Value) {
        let parent = {
            let mut jobs = self.jobs.write();
            let Some(job) = jobs.get_mut(&(queue.to_string(), job_id.to_string())) else {
                return;
            };
            job.state = JobState::Completed;
            job.return_value = Some(value.clone());
            job.parent.clone()
        };

        self.emit(
            queue,
            DurableEvent::Completed {
                job_id: job_id.to_string(),
                return_value: value,
            },
        );

        if let Some((parent_queue, parent_id)) = parent {
            let ready = {
                let mut jobs = self.jobs.write();
                match jobs.get_mut(&(parent_queue.clone(), parent_id.clone())) {
                    Some(parent_job) if parent_job.state == JobState::WaitingChildren => {
                        parent_job.pending_children = parent_job.pending_children.saturating_sub(1);
                        if parent_job.pending_children == 0 {
                            parent_job.state = JobState::Waiting;
                            true
                        } else {
                            false
                        }
                    }
                    _ => false,
                }
            };
            if ready {
                self.push_ready(&parent_queue, &parent_id);
            }
        }
    }

    fn fail_job(&self, queue: &str, job_id: &str, reason: String) {
        let outcome = {
            let mut jobs = self.jobs.write();
            match jobs.get_mut(&(queue.to_string(), job_id.to_string())) {
                None => None,
                Some(job) if job.state == JobState::Failed => None,
                Some(job) => {
                    job.state = JobState::Failed;
                    job.failed_reason = Some(reason.clone());
                    Some((job.fail_parent_on_failure, job.parent.clone()))
                }
            }
        };

        let Some((cascade, parent)) = outcome else {
            return;
        };

        self.emit(
            queue,
            DurableEvent::Failed {
                job_id: job_id.to_string(),
                failed_reason: reason.clone(),
            },
        );

        if cascade {
            if let Some((parent_queue, parent_id)) = parent {
                self.fail_job(
                    &parent_queue,
                    &parent_id,
                    format!("child {job_id} failed: {reason}"),
                );
            }
        }
    }

    fn emit(&self, queue: &str, event: DurableEvent) {
        let queues = self.queues.read();
        if let Some(state) = queues.get(queue) {
            let _ = state.events_tx.send(event);
        }
    }

    fn run_worker_loop(
        self,
        queue: String,
        handler: WorkerHandler,
        concurrency: usize,
        mut shutdown_rx: watch::Receiver<bool>,
        notify: Arc<Notify>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
            loop {
                if *shutdown_rx.borrow() {
                    break;
                }

                let next = {
                    let mut queues = self.queues.write();
                    queues.get_mut(&queue).and_then(|s| s.ready.pop_front())
                };

                let Some((job_queue, job_id)) = next else {
                    tokio::select! {
                        _ = notify.notified() => continue,
                        _ = shutdown_rx.changed() => break,
                    }
                };

                let data = {
                    let jobs = self.jobs.read();
                    jobs.get(&(job_queue.clone(), job_id.clone()))
                        .map(|j| (j.name.clone(), j.data.clone()))
                };
                let Some((name, data)) = data else { continue };

                let permit = semaphore.clone().acquire_owned().await.expect("semaphore not closed");
                let store = self.clone();
                let handler = handler.clone();
                let job_queue2 = job_queue.clone();
                let job_id2 = job_id.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    let raw = RawJob {
                        id: job_id2.clone(),
                        queue: job_queue2.clone(),
                        name,
                        data,
                    };
                    match handler(raw).await {
                        Ok(value) => store.complete_job(&job_queue2, &job_id2, value),
                        Err(reason) => store.fail_job(&job_queue2, &job_id2, reason),
                    }
                });
            }
            trace!(%queue, "worker loop stopped");
        });
    }

    /// Number of jobs currently tracked, across all queues. Test helper.
    pub fn job_count(&self) -> usize {
        self.jobs.read().len()
    }
}

#[async_trait]
impl BackingStore for InMemoryBackingStore {
    #[instrument(skip(self, data))]
    async fn add_job(
        &self,
        queue: &str,
        data: Value,
        opts: JobOptions,
    ) -> Result<String, StoreError> {
        if let Some(job_id) = &opts.job_id {
            let jobs = self.jobs.read();
            if let Some(existing) = jobs.get(&(queue.to_string(), job_id.clone())) {
                if !matches!(existing.state, JobState::Completed | JobState::Failed) {
                    return Err(StoreError::DuplicateJobId {
                        queue: queue.to_string(),
                        job_id: job_id.clone(),
                    });
                }
            }
        }

        let id = self.insert_tree(
            JobSpec {
                name: queue.to_string(),
                queue_name: queue.to_string(),
                data,
                opts,
                children: vec![],
            },
            None,
        );
        Ok(id)
    }

    #[instrument(skip(self, tree))]
    async fn submit_tree(&self, tree: JobSpec) -> Result<String, StoreError> {
        if let Some(job_id) = &tree.opts.job_id {
            let jobs = self.jobs.read();
            if let Some(existing) = jobs.get(&(tree.queue_name.clone(), job_id.clone())) {
                if !matches!(existing.state, JobState::Completed | JobState::Failed) {
                    return Err(StoreError::DuplicateJobId {
                        queue: tree.queue_name.clone(),
                        job_id: job_id.clone(),
                    });
                }
            }
        }
        Ok(self.insert_tree(tree, None))
    }

    async fn find_job_by_id(
        &self,
        queue: &str,
        job_id: &str,
    ) -> Result<Option<JobState>, StoreError> {
        Ok(self
            .jobs
            .read()
            .get(&(queue.to_string(), job_id.to_string()))
            .map(|j| j.state))
    }

    async fn get_return_value(&self, queue: &str, job_id: &str) -> Result<Option<Value>, StoreError> {
        Ok(self
            .jobs
            .read()
            .get(&(queue.to_string(), job_id.to_string()))
            .and_then(|j| j.return_value.clone()))
    }

    async fn get_failed_reason(
        &self,
        queue: &str,
        job_id: &str,
    ) -> Result<Option<String>, StoreError> {
        Ok(self
            .jobs
            .read()
            .get(&(queue.to_string(), job_id.to_string()))
            .and_then(|j| j.failed_reason.clone()))
    }

    async fn get_children_values(
        &self,
        queue: &str,
        job_id: &str,
    ) -> Result<Vec<(String, Value)>, StoreError> {
        let jobs = self.jobs.read();
        let Some(job) = jobs.get(&(queue.to_string(), job_id.to_string())) else {
            return Err(StoreError::JobNotFound {
                queue: queue.to_string(),
                job_id: job_id.to_string(),
            });
        };
        Ok(job
            .children
            .iter()
            .filter_map(|(cq, cid)| {
                jobs.get(&(cq.clone(), cid.clone()))
                    .map(|c| (c.id.clone(), c.return_value.clone().unwrap_or(Value::Null)))
            })
            .collect())
    }

    #[instrument(skip(self, handler))]
    async fn register_worker(
        &self,
        queue: &str,
        concurrency: usize,
        stall_interval: Duration,
        handler: WorkerHandler,
    ) -> Result<(), StoreError> {
        self.stop_worker(queue).await?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let notify = {
            let mut queues = self.queues.write();
            let state = Self::ensure_queue(&mut queues, queue);
            state.shutdown_tx = Some(shutdown_tx);
            state.notify.clone()
        };

        debug!(%queue, concurrency, ?stall_interval, "registering worker");
        let handle = self
            .clone()
            .run_worker_loop(queue.to_string(), handler, concurrency, shutdown_rx, notify);
        let mut queues = self.queues.write();
        Self::ensure_queue(&mut queues, queue).worker_task = Some(handle);
        Ok(())
    }

    async fn stop_worker(&self, queue: &str) -> Result<(), StoreError> {
        let mut queues = self.queues.write();
        if let Some(state) = queues.get_mut(queue) {
            if let Some(tx) = state.shutdown_tx.take() {
                let _ = tx.send(true);
            }
            if let Some(handle) = state.worker_task.take() {
                handle.abort();
            }
        }
        Ok(())
    }

    async fn close_queue(&self, queue: &str) -> Result<(), StoreError> {
        self.queues.write().remove(queue);
        Ok(())
    }

    async fn subscribe_durable_events(
        &self,
        queue: &str,
    ) -> Result<broadcast::Receiver<DurableEvent>, StoreError> {
        let mut queues = self.queues.write();
        let state = Self::ensure_queue(&mut queues, queue);
        Ok(state.events_tx.subscribe())
    }

    async fn wait_until_ready(&self, queue: &str) -> Result<(), StoreError> {
        let mut queues = self.queues.write();
        Self::ensure_queue(&mut queues, queue);
        Ok(())
    }

    async fn schedule_recurring(&self, queue: &str, spec: RecurringSpec) -> Result<(), StoreError> {
        let mut queues = self.queues.write();
        let state = Self::ensure_queue(&mut queues, queue);
        state.schedules.insert(spec.schedule_id.clone(), spec);
        Ok(())
    }

    async fn unschedule_recurring(&self, queue: &str, schedule_id: &str) -> Result<(), StoreError> {
        let mut queues = self.queues.write();
        if let Some(state) = queues.get_mut(queue) {
            state.schedules.remove(schedule_id);
            if let Some(handle) = state.schedule_tasks.remove(schedule_id) {
                handle.abort();
            }
        }
        Ok(())
    }

    async fn list_schedules(&self, queue: &str) -> Result<Vec<RecurringSpec>, StoreError> {
        Ok(self
            .queues
            .read()
            .get(queue)
            .map(|s| s.schedules.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn kv_set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        self.kv
            .write()
            .insert(key.to_string(), (value.to_string(), Instant::now() + ttl));
        Ok(())
    }

    async fn kv_get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut kv = self.kv.write();
        match kv.get(key) {
            Some((value, expiry)) if *expiry > Instant::now() => Ok(Some(value.clone())),
            Some(_) => {
                kv.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    fn leaf(queue: &str, name: &str, data: Value) -> JobSpec {
        JobSpec {
            name: name.to_string(),
            queue_name: queue.to_string(),
            data,
            opts: JobOptions {
                fail_parent_on_failure: true,
                ..Default::default()
            },
            children: vec![],
        }
    }

    #[tokio::test]
    async fn leaf_job_is_immediately_waiting() {
        let store = InMemoryBackingStore::new();
        let id = store
            .add_job("q", serde_json::json!({"x": 1}), JobOptions::default())
            .await
            .unwrap();
        assert_eq!(
            store.find_job_by_id("q", &id).await.unwrap(),
            Some(JobState::Waiting)
        );
    }

    #[tokio::test]
    async fn parent_waits_for_children_then_becomes_ready() {
        let store = InMemoryBackingStore::new();
        let a = leaf("steps", "a", serde_json::json!({}));
        let b = leaf("steps", "b", serde_json::json!({}));
        let tree = JobSpec {
            name: "root".into(),
            queue_name: "root".into(),
            data: serde_json::json!({}),
            opts: JobOptions::default(),
            children: vec![a, b],
        };
        let root_id = store.submit_tree(tree).await.unwrap();
        assert_eq!(
            store.find_job_by_id("root", &root_id).await.unwrap(),
            Some(JobState::WaitingChildren)
        );

        let children = store.get_children_values("root", &root_id).await.unwrap();
        assert_eq!(children.len(), 2);
        let (cq, cid) = ("steps".to_string(), children[0].0.clone());
        store.complete_job(&cq, &cid, serde_json::json!("done-a"));
        assert_eq!(
            store.find_job_by_id("root", &root_id).await.unwrap(),
            Some(JobState::WaitingChildren),
            "still waiting on the second child"
        );
        let cid2 = children[1].0.clone();
        store.complete_job(&cq, &cid2, serde_json::json!("done-b"));
        assert_eq!(
            store.find_job_by_id("root", &root_id).await.unwrap(),
            Some(JobState::Waiting)
        );
    }

    #[tokio::test]
    async fn child_failure_cascades_to_parent() {
        let store = InMemoryBackingStore::new();
        let a = leaf("steps", "a", serde_json::json!({}));
        let tree = JobSpec {
            name: "root".into(),
            queue_name: "root".into(),
            data: serde_json::json!({}),
            opts: JobOptions::default(),
            children: vec![a],
        };
        let root_id = store.submit_tree(tree).await.unwrap();
        let children = store.get_children_values("root", &root_id).await.unwrap();
        let child_id = children[0].0.clone();
        store.fail_job("steps", &child_id, "boom".into());

        assert_eq!(
            store.find_job_by_id("root", &root_id).await.unwrap(),
            Some(JobState::Failed)
        );
        let reason = store.get_failed_reason("root", &root_id).await.unwrap().unwrap();
        assert!(reason.contains("boom"));
    }

    #[tokio::test]
    async fn duplicate_job_id_rejected_while_in_flight() {
        let store = InMemoryBackingStore::new();
        let opts = JobOptions {
            job_id: Some("fixed-id".into()),
            ..Default::default()
        };
        store.add_job("q", serde_json::json!({}), opts.clone()).await.unwrap();
        let err = store.add_job("q", serde_json::json!({}), opts).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateJobId { .. }));
    }

    #[tokio::test]
    async fn kv_round_trip_with_ttl() {
        let store = InMemoryBackingStore::new();
        store
            .kv_set("flow:abc", "my_workflow", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(
            store.kv_get("flow:abc").await.unwrap(),
            Some("my_workflow".to_string())
        );
    }

    #[tokio::test]
    async fn kv_expires_after_ttl() {
        let store = InMemoryBackingStore::new();
        store
            .kv_set("flow:abc", "my_workflow", Duration::from_millis(5))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.kv_get("flow:abc").await.unwrap(), None);
    }

    #[tokio::test]
    async fn worker_completes_job_and_emits_durable_event() {
        let store = InMemoryBackingStore::new();
        let mut rx = store.subscribe_durable_events("q").await.unwrap();
        let handler: WorkerHandler = Arc::new(|job: RawJob| {
            async move { Ok(serde_json::json!({ "echo": job.data })) }.boxed()
        });
        store
            .register_worker("q", 2, Duration::from_secs(5), handler)
            .await
            .unwrap();
        let id = store
            .add_job("q", serde_json::json!({"x": 1}), JobOptions::default())
            .await
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("event within timeout")
            .unwrap();
        match event {
            DurableEvent::Completed { job_id, .. } => assert_eq!(job_id, id),
            other => panic!("expected Completed, got {other:?}"),
        }
    }
}
