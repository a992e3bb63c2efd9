//! [`RedisBackingStore`] — the production [`BackingStore`] implementation: a thin struct
//! wrapping a connection pool, one `#[instrument]`'d async method per trait method,
//! errors mapped to `StoreError` at the boundary.
//!
//! Dependent-job tree semantics (waiting-children gating, `failParentOnFailure`
//! cascades) are reproduced exactly as `InMemoryBackingStore` implements them (§6), just
//! against Redis hashes instead of an in-process `HashMap`. A job record lives at
//! `{prefix}:job:{queue}:{id}` as a Redis hash; a queue's ready ids live in a list at
//! `{prefix}:ready:{queue}`; durable completion/failure events are published on
//! `{prefix}:events:{queue}` and relayed into a local `broadcast` channel the first time
//! a caller subscribes, the same lazy-listener-per-queue shape
//! `CompletionTracker` uses on the caller side.
//!
//! Multi-step tree mutations (inserting a tree, completing or failing a node and
//! propagating to its parent) are serialized per queue name behind an in-process
//! `tokio::sync::Mutex`, not a Lua script. That is sufficient for correctness within one
//! process talking to Redis; a deployment running several producer processes against the
//! same queue concurrently would need the read-modify-write in those methods pushed into
//! a server-side script to stay atomic across processes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bb8::Pool;
use bb8_redis::RedisConnectionManager;
use futures::future::BoxFuture;
use futures::StreamExt;
use parking_lot::RwLock;
use redis::AsyncCommands;
use serde_json::Value;
use tokio::sync::{broadcast, watch, Mutex as AsyncMutex, Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, instrument, trace, warn};
use uuid::Uuid;

use flowmesh_core::store::{
    BackingStore, DurableEvent, JobOptions, JobSpec, JobState, RawJob, RecurringSpec, StoreError,
    WorkerHandler,
};

use crate::keys;
use crate::record::JobRecord;

struct QueueRuntime {
    notify: Arc<Notify>,
    events_tx: broadcast::Sender<DurableEvent>,
    relay_task: Option<JoinHandle<()>>,
    shutdown_tx: Option<watch::Sender<bool>>,
    worker_task: Option<JoinHandle<()>>,
    mutate_lock: Arc<AsyncMutex<()>>,
    schedules: HashMap<String, RecurringSpec>,
    schedule_tasks: HashMap<String, JoinHandle<()>>,
}

impl QueueRuntime {
    fn new() -> Self {
        let (events_tx, _) = broadcast::channel(1024);
        Self {
            notify: Arc::new(Notify::new()),
            events_tx,
            relay_task: None,
            shutdown_tx: None,
            worker_task: None,
            mutate_lock: Arc::new(AsyncMutex::new(())),
            schedules: HashMap::new(),
            schedule_tasks: HashMap::new(),
        }
    }
}

struct Shared {
    pool: Pool<RedisConnectionManager>,
    client: redis::Client,
    prefix: String,
    queues: RwLock<HashMap<String, QueueRuntime>>,
}

/// A [`BackingStore`](flowmesh_core::store::BackingStore) over Redis, using an async
/// multiplexed connection pool (`bb8`/`bb8-redis`) for commands and a dedicated pub/sub
/// connection per queue for the durable event stream.
///
/// Cheap to clone: internally an `Arc` handle, so a spawned worker loop can own a copy
/// without borrowing from the original — the same shape `InMemoryBackingStore` uses.
#[derive(Clone)]
pub struct RedisBackingStore(Arc<Shared>);

impl std::ops::Deref for RedisBackingStore {
    type Target = Shared;
    fn deref(&self) -> &Shared {
        &self.0
    }
}

impl RedisBackingStore {
    /// Opens a connection pool against `redis_url` and namespaces every key/channel
    /// under `prefix` (the same prefix a caller passes as `ProviderConfig::queue_prefix`
    /// need not match — this prefix is the store's own namespace, independent of the
    /// engine's queue-naming prefix).
    pub async fn connect(redis_url: &str, prefix: impl Into<String>) -> Result<Self, StoreError> {
        let manager = RedisConnectionManager::new(redis_url).map_err(Self::backend_err)?;
        let pool = Pool::builder()
            .max_size(32)
            .build(manager)
            .await
            .map_err(|err| StoreError::Backend(err.to_string()))?;
        let client = redis::Client::open(redis_url).map_err(Self::backend_err)?;
        Ok(Self(Arc::new(Shared {
            pool,
            client,
            prefix: prefix.into(),
            queues: RwLock::new(HashMap::new()),
        })))
    }

    fn backend_err(err: redis::RedisError) -> StoreError {
        StoreError::Backend(err.to_string())
    }

    async fn conn(&self) -> Result<bb8::PooledConnection<'_, RedisConnectionManager>, StoreError> {
        self.pool.get().await.map_err(|err| StoreError::Backend(err.to_string()))
    }

    fn ensure_runtime<'a>(queues: &'a mut HashMap<String, QueueRuntime>, name: &str) -> &'a mut QueueRuntime {
        queues.entry(name.to_string()).or_insert_with(QueueRuntime::new)
    }

    fn mutation_lock(&self, queue: &str) -> Arc<AsyncMutex<()>> {
        if let Some(runtime) = self.queues.read().get(queue) {
            return Arc::clone(&runtime.mutate_lock);
        }
        let mut queues = self.queues.write();
        Arc::clone(&Self::ensure_runtime(&mut queues, queue).mutate_lock)
    }

    async fn get_record(&self, queue: &str, job_id: &str) -> Result<Option<JobRecord>, StoreError> {
        let mut conn = self.conn().await?;
        let key = keys::job_key(&self.prefix, queue, job_id);
        let fields: HashMap<String, String> = conn.hgetall(&key).await.map_err(Self::backend_err)?;
        if fields.is_empty() {
            return Ok(None);
        }
        Ok(JobRecord::from_fields(job_id, &fields))
    }

    async fn write_record(&self, record: &JobRecord) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let key = keys::job_key(&self.prefix, &record.queue, &record.id);
        conn.hset_multiple(&key, &record.to_fields()).await.map_err(Self::backend_err)
    }

    async fn push_ready(&self, queue: &str, job_id: &str) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let key = keys::ready_key(&self.prefix, queue);
        let _: i64 = conn.rpush(&key, job_id).await.map_err(Self::backend_err)?;
        if let Some(runtime) = self.queues.read().get(queue) {
            runtime.notify.notify_waiters();
        }
        Ok(())
    }

    async fn emit(&self, queue: &str, event: &DurableEvent) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let channel = keys::events_channel(&self.prefix, queue);
        let payload = serde_json::to_string(event).map_err(|err| StoreError::Backend(err.to_string()))?;
        let _: i64 = conn.publish(&channel, payload).await.map_err(Self::backend_err)?;
        Ok(())
    }

    /// Insert a dependent-job tree, deepest nodes first, wiring parent/child links and
    /// leaving leaves immediately ready while internal nodes start `waiting-children`
    /// (mirrors `InMemoryBackingStore::insert_tree`, §6).
    fn insert_tree<'a>(
        &'a self,
        spec: JobSpec,
        parent: Option<(String, String)>,
    ) -> BoxFuture<'a, Result<String, StoreError>> {
        Box::pin(async move {
            let id = spec.opts.job_id.clone().unwrap_or_else(|| Uuid::now_v7().to_string());
            let queue_name = spec.queue_name.clone();
            let mut child_ids = Vec::with_capacity(spec.children.len());
            for child in spec.children {
                let child_id = self.insert_tree(child, Some((queue_name.clone(), id.clone()))).await?;
                child_ids.push(child_id);
            }

            let pending_children = child_ids.len();
            let record = JobRecord {
                id: id.clone(),
                queue: queue_name.clone(),
                name: spec.name,
                data: spec.data,
                state: if pending_children == 0 { JobState::Waiting } else { JobState::WaitingChildren },
                fail_parent_on_failure: spec.opts.fail_parent_on_failure,
                parent,
                children: child_ids.into_iter().map(|cid| (queue_name.clone(), cid)).collect(),
                pending_children,
                return_value: None,
                failed_reason: None,
            };

            self.write_record(&record).await?;
            if pending_children == 0 {
                self.push_ready(&queue_name, &id).await?;
            }
            Ok(id)
        })
    }

    async fn complete_job(&self, queue: &str, job_id: &str, value: Value) -> Result<(), StoreError> {
        let parent = {
            let lock = self.mutation_lock(queue);
            let _guard = lock.lock().await;
            let Some(mut record) = self.get_record(queue, job_id).await? else {
                return Ok(());
            };
            record.state = JobState::Completed;
            record.return_value = Some(value.clone());
            self.write_record(&record).await?;
            record.parent
        };

        self.emit(queue, &DurableEvent::Completed { job_id: job_id.to_string(), return_value: value }).await?;

        if let Some((parent_queue, parent_id)) = parent {
            let ready = {
                let lock = self.mutation_lock(&parent_queue);
                let _guard = lock.lock().await;
                match self.get_record(&parent_queue, &parent_id).await? {
                    Some(mut parent_job) if parent_job.state == JobState::WaitingChildren => {
                        parent_job.pending_children = parent_job.pending_children.saturating_sub(1);
                        let is_ready = parent_job.pending_children == 0;
                        if is_ready {
                            parent_job.state = JobState::Waiting;
                        }
                        self.write_record(&parent_job).await?;
                        is_ready
                    }
                    _ => false,
                }
            };
            if ready {
                self.push_ready(&parent_queue, &parent_id).await?;
            }
        }
        Ok(())
    }

    fn fail_job<'a>(&'a self, queue: &'a str, job_id: &'a str, reason: String) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(async move {
            let outcome = {
                let lock = self.mutation_lock(queue);
                let _guard = lock.lock().await;
                match self.get_record(queue, job_id).await? {
                    None => None,
                    Some(job) if job.state == JobState::Failed => None,
                    Some(mut job) => {
                        job.state = JobState::Failed;
                        job.failed_reason = Some(reason.clone());
                        let cascade = job.fail_parent_on_failure;
                        let parent = job.parent.clone();
                        self.write_record(&job).await?;
                        Some((cascade, parent))
                    }
                }
            };

            let Some((cascade, parent)) = outcome else {
                return Ok(());
            };

            self.emit(queue, &DurableEvent::Failed { job_id: job_id.to_string(), failed_reason: reason.clone() })
                .await?;

            if cascade {
                if let Some((parent_queue, parent_id)) = parent {
                    self.fail_job(&parent_queue, &parent_id, format!("child {job_id} failed: {reason}")).await?;
                }
            }
            Ok(())
        })
    }

    async fn start_relay(&self, queue: &str) -> Result<(), StoreError> {
        let channel = keys::events_channel(&self.prefix, queue);
        let mut pubsub = self.client.get_async_pubsub().await.map_err(Self::backend_err)?;
        pubsub.subscribe(&channel).await.map_err(Self::backend_err)?;

        let store = self.clone();
        let queue_owned = queue.to_string();
        let handle = tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(err) => {
                        warn!(%err, queue = %queue_owned, "durable event payload decode failed");
                        continue;
                    }
                };
                match serde_json::from_str::<DurableEvent>(&payload) {
                    Ok(event) => {
                        let queues = store.queues.read();
                        if let Some(runtime) = queues.get(&queue_owned) {
                            let _ = runtime.events_tx.send(event);
                        }
                    }
                    Err(err) => warn!(%err, queue = %queue_owned, "durable event json decode failed"),
                }
            }
            trace!(queue = %queue_owned, "durable event relay stopped");
        });

        let mut queues = self.queues.write();
        Self::ensure_runtime(&mut queues, queue).relay_task = Some(handle);
        Ok(())
    }

    fn run_worker_loop(
        self,
        queue: String,
        handler: WorkerHandler,
        concurrency: usize,
        shutdown_rx: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
            let ready_key = keys::ready_key(&self.prefix, &queue);

            loop {
                if *shutdown_rx.borrow() {
                    break;
                }

                let mut conn = match self.conn().await {
                    Ok(conn) => conn,
                    Err(err) => {
                        error!(%err, %queue, "redis connection unavailable, retrying");
                        tokio::time::sleep(Duration::from_millis(500)).await;
                        continue;
                    }
                };
                let popped: redis::RedisResult<Option<(String, String)>> = conn.blpop(&ready_key, 1.0).await;
                drop(conn);

                let job_id = match popped {
                    Ok(Some((_list, id))) => id,
                    // BLPOP timed out with nothing ready; loop back around to the
                    // shutdown check at the top.
                    Ok(None) => continue,
                    Err(err) => {
                        error!(%err, %queue, "blpop failed");
                        tokio::time::sleep(Duration::from_millis(500)).await;
                        continue;
                    }
                };

                let record = match self.get_record(&queue, &job_id).await {
                    Ok(Some(record)) => record,
                    Ok(None) => continue,
                    Err(err) => {
                        error!(%err, %queue, %job_id, "failed to load job record");
                        continue;
                    }
                };

                let permit = semaphore.clone().acquire_owned().await.expect("semaphore not closed");
                let store = self.clone();
                let handler = handler.clone();
                let queue_for_task = queue.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    let raw = RawJob { id: job_id.clone(), queue: queue_for_task.clone(), name: record.name, data: record.data };
                    match handler(raw).await {
                        Ok(value) => {
                            if let Err(err) = store.complete_job(&queue_for_task, &job_id, value).await {
                                error!(%err, queue = %queue_for_task, %job_id, "failed to record completion");
                            }
                        }
                        Err(reason) => {
                            if let Err(err) = store.fail_job(&queue_for_task, &job_id, reason).await {
                                error!(%err, queue = %queue_for_task, %job_id, "failed to record failure");
                            }
                        }
                    }
                });
            }
            trace!(%queue, "redis worker loop stopped");
        })
    }
}

#[async_trait]
impl BackingStore for RedisBackingStore {
    #[instrument(skip(self, data))]
    async fn add_job(&self, queue: &str, data: Value, opts: JobOptions) -> Result<String, StoreError> {
        if let Some(job_id) = &opts.job_id {
            if let Some(existing) = self.get_record(queue, job_id).await? {
                if !matches!(existing.state, JobState::Completed | JobState::Failed) {
                    return Err(StoreError::DuplicateJobId { queue: queue.to_string(), job_id: job_id.clone() });
                }
            }
        }
        self.insert_tree(
            JobSpec { name: queue.to_string(), queue_name: queue.to_string(), data, opts, children: vec![] },
            None,
        )
        .await
    }

    #[instrument(skip(self, tree))]
    async fn submit_tree(&self, tree: JobSpec) -> Result<String, StoreError> {
        if let Some(job_id) = &tree.opts.job_id {
            if let Some(existing) = self.get_record(&tree.queue_name, job_id).await? {
                if !matches!(existing.state, JobState::Completed | JobState::Failed) {
                    return Err(StoreError::DuplicateJobId { queue: tree.queue_name.clone(), job_id: job_id.clone() });
                }
            }
        }
        self.insert_tree(tree, None).await
    }

    #[instrument(skip(self))]
    async fn find_job_by_id(&self, queue: &str, job_id: &str) -> Result<Option<JobState>, StoreError> {
        Ok(self.get_record(queue, job_id).await?.map(|record| record.state))
    }

    #[instrument(skip(self))]
    async fn get_return_value(&self, queue: &str, job_id: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.get_record(queue, job_id).await?.and_then(|record| record.return_value))
    }

    #[instrument(skip(self))]
    async fn get_failed_reason(&self, queue: &str, job_id: &str) -> Result<Option<String>, StoreError> {
        Ok(self.get_record(queue, job_id).await?.and_then(|record| record.failed_reason))
    }

    #[instrument(skip(self))]
    async fn get_children_values(&self, queue: &str, job_id: &str) -> Result<Vec<(String, Value)>, StoreError> {
        let Some(record) = self.get_record(queue, job_id).await? else {
            return Err(StoreError::JobNotFound { queue: queue.to_string(), job_id: job_id.to_string() });
        };
        let mut out = Vec::with_capacity(record.children.len());
        for (child_queue, child_id) in &record.children {
            if let Some(child) = self.get_record(child_queue, child_id).await? {
                out.push((child.id, child.return_value.unwrap_or(Value::Null)));
            }
        }
        Ok(out)
    }

    #[instrument(skip(self, handler))]
    async fn register_worker(
        &self,
        queue: &str,
        concurrency: usize,
        _stall_interval: Duration,
        handler: WorkerHandler,
    ) -> Result<(), StoreError> {
        self.stop_worker(queue).await?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        {
            let mut queues = self.queues.write();
            Self::ensure_runtime(&mut queues, queue).shutdown_tx = Some(shutdown_tx);
        }

        debug!(%queue, concurrency, "registering redis worker");
        let handle = self.clone().run_worker_loop(queue.to_string(), handler, concurrency, shutdown_rx);
        let mut queues = self.queues.write();
        Self::ensure_runtime(&mut queues, queue).worker_task = Some(handle);
        Ok(())
    }

    async fn stop_worker(&self, queue: &str) -> Result<(), StoreError> {
        let mut queues = self.queues.write();
        if let Some(runtime) = queues.get_mut(queue) {
            if let Some(tx) = runtime.shutdown_tx.take() {
                let _ = tx.send(true);
            }
            if let Some(handle) = runtime.worker_task.take() {
                handle.abort();
            }
        }
        Ok(())
    }

    async fn close_queue(&self, queue: &str) -> Result<(), StoreError> {
        let mut queues = self.queues.write();
        if let Some(runtime) = queues.remove(queue) {
            if let Some(handle) = runtime.relay_task {
                handle.abort();
            }
            for handle in runtime.schedule_tasks.into_values() {
                handle.abort();
            }
        }
        Ok(())
    }

    async fn subscribe_durable_events(&self, queue: &str) -> Result<broadcast::Receiver<DurableEvent>, StoreError> {
        let needs_relay = {
            let mut queues = self.queues.write();
            Self::ensure_runtime(&mut queues, queue).relay_task.is_none()
        };
        if needs_relay {
            self.start_relay(queue).await?;
        }
        let queues = self.queues.read();
        Ok(queues.get(queue).expect("runtime ensured above").events_tx.subscribe())
    }

    async fn wait_until_ready(&self, queue: &str) -> Result<(), StoreError> {
        self.subscribe_durable_events(queue).await?;
        Ok(())
    }

    async fn schedule_recurring(&self, queue: &str, spec: RecurringSpec) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let key = keys::schedules_key(&self.prefix, queue);
        let payload = serde_json::to_string(&spec).map_err(|err| StoreError::Backend(err.to_string()))?;
        let _: () = conn.hset(&key, &spec.schedule_id, payload).await.map_err(Self::backend_err)?;
        let mut queues = self.queues.write();
        Self::ensure_runtime(&mut queues, queue).schedules.insert(spec.schedule_id.clone(), spec);
        Ok(())
    }

    async fn unschedule_recurring(&self, queue: &str, schedule_id: &str) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let key = keys::schedules_key(&self.prefix, queue);
        let _: () = conn.hdel(&key, schedule_id).await.map_err(Self::backend_err)?;
        let mut queues = self.queues.write();
        if let Some(runtime) = queues.get_mut(queue) {
            runtime.schedules.remove(schedule_id);
            if let Some(handle) = runtime.schedule_tasks.remove(schedule_id) {
                handle.abort();
            }
        }
        Ok(())
    }

    async fn list_schedules(&self, queue: &str) -> Result<Vec<RecurringSpec>, StoreError> {
        let mut conn = self.conn().await?;
        let key = keys::schedules_key(&self.prefix, queue);
        let raw: HashMap<String, String> = conn.hgetall(&key).await.map_err(Self::backend_err)?;
        Ok(raw.values().filter_map(|v| serde_json::from_str(v).ok()).collect())
    }

    async fn kv_set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let full_key = keys::kv_key(&self.prefix, key);
        let millis = ttl.as_millis().max(1) as u64;
        let _: () = conn.pset_ex(&full_key, value, millis).await.map_err(Self::backend_err)?;
        Ok(())
    }

    async fn kv_get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.conn().await?;
        let full_key = keys::kv_key(&self.prefix, key);
        conn.get(&full_key).await.map_err(Self::backend_err)
    }

    async fn move_to_dlq(&self, queue: &str, job_id: &str, error_history: Vec<String>) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let key = keys::dlq_key(&self.prefix, queue);
        let payload = serde_json::json!({ "job_id": job_id, "errors": error_history }).to_string();
        let _: i64 = conn.rpush(&key, payload).await.map_err(Self::backend_err)?;
        Ok(())
    }
}
