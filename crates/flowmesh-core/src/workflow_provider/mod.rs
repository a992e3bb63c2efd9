//! Workflow Provider: the caller-facing surface over the Queue Manager, Step Registry,
//! Flow Builder, and Completion Tracker (§4.8).

mod flow_registry;
mod flow_state;
mod rollback;
mod timeout;
mod workers;

pub use flow_state::FlowStatus;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::instrument;
use uuid::Uuid;

use crate::completion_tracker::{CompletionTracker, ErrorCallback, SuccessCallback};
use crate::config::ProviderConfig;
use crate::context::PropagationMeta;
use crate::error::EngineError;
use crate::flow_builder::{self, StepGroup, WorkflowJobData};
use crate::queue_manager::{QueueManager, WorkerOptions};
use crate::reliability::RetryPolicy;
use crate::registry::{StepFn, StepRegistry};
use crate::store::{BackingStore, DurableEvent, JobOptions, JobState, StoreError};

use flow_state::FlowStateCache;

/// A consumer's on-complete handler: `(workflow-data, meta, step-results) -> output`.
pub type WorkflowOnComplete = Arc<
    dyn Fn(Value, Option<PropagationMeta>, HashMap<String, Value>) -> BoxFuture<'static, Result<Value, EngineError>>
        + Send
        + Sync,
>;

/// A consumer's optional on-error hook. Takes the failure's display text rather than
/// the typed error — the engine never hands a raw error object to user callbacks
/// (§4.8.6 applies the same "logged as strings" discipline to this hook).
pub type WorkflowOnError = Arc<dyn Fn(String) + Send + Sync>;

/// One step registration passed to [`WorkflowProvider::register_definition_consumer`].
pub struct StepHandlerRegistration {
    pub step_name: String,
    pub execute: StepFn,
    pub rollback: Option<StepFn>,
}

#[derive(Clone)]
struct ConsumerDefinition {
    step_groups: Vec<StepGroup>,
    on_complete: WorkflowOnComplete,
    on_error: Option<WorkflowOnError>,
    retry: Option<RetryPolicy>,
}

#[derive(Clone)]
struct EmitterDefinition {
    step_groups: Vec<StepGroup>,
}

/// Per-`execute` overrides (§6 "Configuration").
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    pub meta: Option<PropagationMeta>,
    pub timeout: Option<std::time::Duration>,
    pub idempotency_key: Option<String>,
}

fn map_job_state(state: Option<JobState>) -> FlowStatus {
    match state {
        Some(JobState::Completed) => FlowStatus::Completed,
        Some(JobState::Failed) => FlowStatus::Failed,
        Some(JobState::Active | JobState::Waiting | JobState::WaitingChildren | JobState::Delayed) => {
            FlowStatus::Running
        }
        None => FlowStatus::Pending,
    }
}

/// A handle to one flow execution (§4.8 "execute... Return a handle").
pub struct FlowHandle<S: BackingStore> {
    flow_id: String,
    provider: Arc<WorkflowProvider<S>>,
    receiver: Option<oneshot::Receiver<Result<Value, EngineError>>>,
}

impl<S: BackingStore> FlowHandle<S> {
    pub fn id(&self) -> &str {
        &self.flow_id
    }

    pub async fn status(&self) -> FlowStatus {
        self.provider.get_status(&self.flow_id).await
    }

    /// Awaits the flow's outcome. A handle returned directly by `execute` awaits its own
    /// pending latch; a handle reconstructed via `get_handle` has none and always falls
    /// through to a direct store lookup / durable-event subscription.
    pub async fn result(self) -> Result<Value, EngineError> {
        match self.receiver {
            Some(receiver) => match receiver.await {
                Ok(outcome) => outcome,
                Err(_) => self.provider.get_result(&self.flow_id).await,
            },
            None => self.provider.get_result(&self.flow_id).await,
        }
    }
}

/// The caller-facing engine over one backing store (§4.8).
pub struct WorkflowProvider<S: BackingStore> {
    store: Arc<S>,
    queue_manager: Arc<QueueManager<S>>,
    step_registry: StepRegistry,
    completion_tracker: Arc<CompletionTracker<S>>,
    config: ProviderConfig,
    consumers: DashMap<String, ConsumerDefinition>,
    emitters: DashMap<String, EmitterDefinition>,
    flow_states: Arc<FlowStateCache>,
    started: AtomicBool,
}

impl<S: BackingStore> WorkflowProvider<S> {
    pub fn new(store: Arc<S>, config: ProviderConfig) -> Arc<Self> {
        let config = config.validated();
        let queue_manager = Arc::new(QueueManager::new(Arc::clone(&store), config.default_retry.clone()));
        let flow_states = Arc::new(FlowStateCache::new(config.max_flow_states));
        Arc::new(Self {
            completion_tracker: Arc::new(CompletionTracker::new(Arc::clone(&store))),
            store,
            queue_manager,
            step_registry: StepRegistry::new(),
            config,
            consumers: DashMap::new(),
            emitters: DashMap::new(),
            flow_states,
            started: AtomicBool::new(false),
        })
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

    /// Registers `name` as a step-executing consumer: records its step groups and
    /// on-complete/on-error hooks, installs every step handler into the Step Registry,
    /// and starts the root workflow worker and the shared step worker for this
    /// workflow's queues (§4.8, §4.8.1, §4.8.2).
    pub async fn register_definition_consumer(
        self: &Arc<Self>,
        name: &str,
        on_complete: WorkflowOnComplete,
        step_groups: Vec<StepGroup>,
        step_handlers: Vec<StepHandlerRegistration>,
        on_error: Option<WorkflowOnError>,
        retry: Option<RetryPolicy>,
    ) -> Result<(), EngineError> {
        for handler in step_handlers {
            self.step_registry
                .register(name, &handler.step_name, handler.execute, handler.rollback)?;
        }
        self.consumers.insert(
            name.to_string(),
            ConsumerDefinition {
                step_groups,
                on_complete,
                on_error,
                retry,
            },
        );

        let worker_opts = WorkerOptions {
            concurrency: 1,
            stall_interval: self.config.stall_interval,
            backpressure: None,
        };
        let workflow_queue = flow_builder::workflow_queue_name(&self.config.queue_prefix, name);
        let step_queue = flow_builder::step_queue_name(&self.config.queue_prefix, name);

        self.queue_manager
            .register_worker(
                &workflow_queue,
                workers::build_workflow_worker(Arc::clone(self), name.to_string()),
                worker_opts.clone(),
            )
            .await
            .map_err(EngineError::BackingStoreUnavailable)?;
        self.queue_manager
            .register_worker(&step_queue, workers::build_step_worker(Arc::clone(self)), worker_opts)
            .await
            .map_err(EngineError::BackingStoreUnavailable)?;
        Ok(())
    }

    /// Registers `name` as emitter-only: this instance can `execute` the workflow but
    /// never runs its steps. `step_groups` must mirror the consumer's plan so the tree
    /// this instance builds at submission time has the shape the consumer expects
    /// (§4.8.1 "the definition's step plan must be present on the emitter").
    pub fn register_emitter_workflow(&self, name: &str, step_groups: Vec<StepGroup>) {
        self.emitters.insert(name.to_string(), EmitterDefinition { step_groups });
    }

    fn resolve_step_groups(&self, workflow_name: &str) -> Option<Vec<StepGroup>> {
        if let Some(consumer) = self.consumers.get(workflow_name) {
            if !consumer.step_groups.is_empty() {
                return Some(consumer.step_groups.clone());
            }
        }
        if let Some(emitter) = self.emitters.get(workflow_name) {
            return Some(emitter.step_groups.clone());
        }
        self.consumers.get(workflow_name).map(|c| c.step_groups.clone())
    }

    fn is_registered(&self, workflow_name: &str) -> bool {
        self.consumers.contains_key(workflow_name) || self.emitters.contains_key(workflow_name)
    }

    /// Builds the pair of Completion-Tracker callbacks that settle this flow's pending
    /// latch: flips local flow-state to its terminal status, arms post-terminal
    /// cleanup, and forwards the outcome to `receiver`'s paired sender.
    fn settle_callbacks(
        self: &Arc<Self>,
        flow_id: &str,
    ) -> (SuccessCallback, ErrorCallback, oneshot::Receiver<Result<Value, EngineError>>) {
        let (tx, rx) = oneshot::channel();
        let tx = Arc::new(Mutex::new(Some(tx)));

        let provider_ok = Arc::clone(self);
        let flow_ok = flow_id.to_string();
        let tx_ok = Arc::clone(&tx);
        let on_success: SuccessCallback = Box::new(move |value| {
            provider_ok.flow_states.set_status(&flow_ok, FlowStatus::Completed);
            provider_ok
                .flow_states
                .schedule_cleanup(flow_ok.clone(), provider_ok.config.flow_state_cleanup_delay);
            if let Some(sender) = tx_ok.lock().take() {
                let _ = sender.send(Ok(value));
            }
        });

        let provider_err = Arc::clone(self);
        let flow_err = flow_id.to_string();
        let tx_err = Arc::clone(&tx);
        let on_error: ErrorCallback = Box::new(move |error| {
            provider_err.flow_states.set_status(&flow_err, FlowStatus::Failed);
            provider_err
                .flow_states
                .schedule_cleanup(flow_err.clone(), provider_err.config.flow_state_cleanup_delay);
            if let Some(sender) = tx_err.lock().take() {
                let _ = sender.send(Err(error));
            }
        });

        (on_success, on_error, rx)
    }

    /// Submits a new flow execution (§4.8 "execute").
    #[instrument(skip(self, data, options))]
    pub async fn execute(
        self: &Arc<Self>,
        workflow_name: &str,
        data: Value,
        options: ExecuteOptions,
    ) -> Result<FlowHandle<S>, EngineError> {
        self.require_started()?;
        if !self.is_registered(workflow_name) {
            return Err(EngineError::NotRegistered(workflow_name.to_string()));
        }
        let step_groups = self.resolve_step_groups(workflow_name).unwrap_or_default();

        let flow_id = Uuid::now_v7().to_string();
        self.flow_states.insert_pending(&flow_id, workflow_name);

        let retry = self
            .consumers
            .get(workflow_name)
            .and_then(|c| c.retry.clone())
            .unwrap_or_else(|| self.config.default_retry.clone());

        if step_groups.is_empty() {
            let workflow_queue = flow_builder::workflow_queue_name(&self.config.queue_prefix, workflow_name);
            let root_job_id = options
                .idempotency_key
                .clone()
                .unwrap_or_else(|| format!("{workflow_name}.{flow_id}"));

            let (on_success, on_error, rx) = self.settle_callbacks(&flow_id);
            self.completion_tracker
                .register(&workflow_queue, &root_job_id, on_success, on_error, None)
                .await
                .map_err(EngineError::BackingStoreUnavailable)?;

            let payload = serde_json::to_value(WorkflowJobData {
                kind: "workflow",
                version: 1,
                flow_id: flow_id.clone(),
                workflow_data: data,
                meta: options.meta.clone(),
            })?;
            let job_opts = JobOptions {
                job_id: Some(root_job_id.clone()),
                ..Default::default()
            };
            match self.queue_manager.add_job(&workflow_queue, payload, job_opts).await {
                Ok(job_id) => self.completion_tracker.map_job_id(&workflow_queue, &job_id, &root_job_id),
                Err(err) => self
                    .completion_tracker
                    .fail(&workflow_queue, &root_job_id, EngineError::BackingStoreUnavailable(err)),
            }
            self.finish_execute(&flow_id, workflow_name, &workflow_queue, &root_job_id, options.timeout);
            return Ok(FlowHandle {
                flow_id,
                provider: Arc::clone(self),
                receiver: Some(rx),
            });
        } else {
            let plan = flow_builder::build(
                workflow_name,
                &flow_id,
                &self.config.queue_prefix,
                &step_groups,
                data,
                options.meta.clone(),
                options.idempotency_key.as_deref(),
                Some(&retry),
            );

            let (on_success, on_error, rx) = self.settle_callbacks(&flow_id);
            self.completion_tracker
                .register(&plan.workflow_queue, &plan.root_job_id, on_success, on_error, None)
                .await
                .map_err(EngineError::BackingStoreUnavailable)?;

            match self.queue_manager.submit_tree(plan.tree).await {
                Ok(job_id) => {
                    self.completion_tracker
                        .map_job_id(&plan.workflow_queue, &job_id, &plan.root_job_id);
                }
                Err(err) => {
                    self.completion_tracker.fail(
                        &plan.workflow_queue,
                        &plan.root_job_id,
                        EngineError::BackingStoreUnavailable(err),
                    );
                }
            }
            self.finish_execute(&flow_id, workflow_name, &plan.workflow_queue, &plan.root_job_id, options.timeout);
            Ok(FlowHandle {
                flow_id,
                provider: Arc::clone(self),
                receiver: Some(rx),
            })
        }
    }

    /// Shared submission epilogue: best-effort registry write, `running` transition, and
    /// arming the flow's overall timeout.
    fn finish_execute(
        self: &Arc<Self>,
        flow_id: &str,
        workflow_name: &str,
        workflow_queue: &str,
        root_job_id: &str,
        requested_timeout: Option<std::time::Duration>,
    ) {
        let store = Arc::clone(&self.store);
        let queue_prefix = self.config.queue_prefix.clone();
        let flow_id_owned = flow_id.to_string();
        let workflow_name_owned = workflow_name.to_string();
        let root_job_id_owned = root_job_id.to_string();
        tokio::spawn(async move {
            flow_registry::write_entry(store.as_ref(), &queue_prefix, &flow_id_owned, &workflow_name_owned, &root_job_id_owned).await;
        });

        self.flow_states.set_status(flow_id, FlowStatus::Running);

        let base_timeout = requested_timeout.unwrap_or(self.config.default_timeout);
        if !base_timeout.is_zero() {
            let effective = base_timeout + self.config.stall_interval;
            timeout::arm(
                Arc::clone(&self.store),
                Arc::clone(&self.completion_tracker),
                workflow_queue.to_string(),
                root_job_id.to_string(),
                effective,
            );
        }
    }

    fn known_workflow_names(&self) -> Vec<String> {
        self.consumers
            .iter()
            .map(|e| e.key().clone())
            .chain(self.emitters.iter().map(|e| e.key().clone()))
            .collect()
    }

    /// Finds a flow's `(queue, job id)` on this instance's backing store (§4.8
    /// "findJobByFlowId"). Tries the registry's cached `root_job_id` first, then falls
    /// back to a sequential scan across every known workflow queue assuming the job id
    /// equals the flow id — true whenever no idempotency key was supplied, which is the
    /// common case. An idempotency-keyed flow whose registry entry has expired is the
    /// one case this fallback cannot recover (documented in the design ledger).
    async fn find_job_by_flow_id(&self, flow_id: &str) -> Option<(String, String)> {
        if let Some((workflow_name, root_job_id)) =
            flow_registry::lookup(self.store.as_ref(), &self.config.queue_prefix, flow_id).await
        {
            let queue = flow_builder::workflow_queue_name(&self.config.queue_prefix, &workflow_name);
            if self.store.find_job_by_id(&queue, &root_job_id).await.ok().flatten().is_some() {
                return Some((queue, root_job_id));
            }
        }

        for workflow_name in self.known_workflow_names() {
            let queue = flow_builder::workflow_queue_name(&self.config.queue_prefix, &workflow_name);
            if self.store.find_job_by_id(&queue, flow_id).await.ok().flatten().is_some() {
                return Some((queue, flow_id.to_string()));
            }
        }
        None
    }

    /// Fast path: local flow-state if known and non-pending. Slow path: store lookup
    /// via `find_job_by_flow_id` (§4.8 "getStatus").
    pub async fn get_status(&self, flow_id: &str) -> FlowStatus {
        if let Some(status) = self.flow_states.get_status(flow_id) {
            if status != FlowStatus::Pending {
                return status;
            }
        }
        match self.find_job_by_flow_id(flow_id).await {
            Some((queue, job_id)) => {
                let state = self.store.find_job_by_id(&queue, &job_id).await.ok().flatten();
                map_job_state(state)
            }
            None => FlowStatus::Pending,
        }
    }

    /// §4.8 "getResult": decode a completed job's return value, surface a failed job's
    /// reason, or subscribe and wait for one of those two outcomes to arrive.
    pub async fn get_result(&self, flow_id: &str) -> Result<Value, EngineError> {
        let (queue, job_id) = self
            .find_job_by_flow_id(flow_id)
            .await
            .ok_or_else(|| EngineError::NotRegistered(flow_id.to_string()))?;

        match self
            .store
            .find_job_by_id(&queue, &job_id)
            .await
            .map_err(EngineError::BackingStoreUnavailable)?
        {
            Some(JobState::Completed) => Ok(self
                .store
                .get_return_value(&queue, &job_id)
                .await
                .map_err(EngineError::BackingStoreUnavailable)?
                .unwrap_or(Value::Null)),
            Some(JobState::Failed) => {
                let reason = self
                    .store
                    .get_failed_reason(&queue, &job_id)
                    .await
                    .map_err(EngineError::BackingStoreUnavailable)?
                    .unwrap_or_default();
                Err(EngineError::StepFailure {
                    step_name: job_id,
                    source: reason.into(),
                })
            }
            _ => self.wait_for_settlement(&queue, &job_id).await,
        }
    }

    async fn wait_for_settlement(&self, queue: &str, job_id: &str) -> Result<Value, EngineError> {
        let mut receiver = self
            .store
            .subscribe_durable_events(queue)
            .await
            .map_err(EngineError::BackingStoreUnavailable)?;
        self.store
            .wait_until_ready(queue)
            .await
            .map_err(EngineError::BackingStoreUnavailable)?;

        // Recheck in case the job settled between the first lookup and subscribing.
        match self
            .store
            .find_job_by_id(queue, job_id)
            .await
            .map_err(EngineError::BackingStoreUnavailable)?
        {
            Some(JobState::Completed) => {
                return Ok(self
                    .store
                    .get_return_value(queue, job_id)
                    .await
                    .map_err(EngineError::BackingStoreUnavailable)?
                    .unwrap_or(Value::Null));
            }
            Some(JobState::Failed) => {
                let reason = self
                    .store
                    .get_failed_reason(queue, job_id)
                    .await
                    .map_err(EngineError::BackingStoreUnavailable)?
                    .unwrap_or_default();
                return Err(EngineError::StepFailure {
                    step_name: job_id.to_string(),
                    source: reason.into(),
                });
            }
            _ => {}
        }

        loop {
            match receiver.recv().await {
                Ok(DurableEvent::Completed { job_id: jid, return_value }) if jid == job_id => {
                    return Ok(return_value);
                }
                Ok(DurableEvent::Failed { job_id: jid, failed_reason }) if jid == job_id => {
                    return Err(EngineError::StepFailure {
                        step_name: job_id.to_string(),
                        source: failed_reason.into(),
                    });
                }
                Ok(_) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                    return Err(EngineError::BackingStoreUnavailable(StoreError::ConnectionClosed));
                }
            }
        }
    }

    /// §4.8 "getHandle": validates the flow exists, then returns a reconstructed handle
    /// with no live pending-latch receiver — its `status`/`result` always go through the
    /// store.
    pub async fn get_handle(self: &Arc<Self>, flow_id: &str) -> Result<FlowHandle<S>, EngineError> {
        self.find_job_by_flow_id(flow_id)
            .await
            .ok_or_else(|| EngineError::NotRegistered(flow_id.to_string()))?;
        Ok(FlowHandle {
            flow_id: flow_id.to_string(),
            provider: Arc::clone(self),
            receiver: None,
        })
    }

    /// Shuts down in §4.8.7's order: Queue Manager (workers drain, then queues close),
    /// then Completion Tracker listeners, then local timers. Idempotent.
    pub async fn stop(&self) -> Result<(), EngineError> {
        if !self.started.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.queue_manager.stop().await.map_err(EngineError::BackingStoreUnavailable)?;
        self.completion_tracker.stop().await;
        self.flow_states.clear_cleanup_tasks();
        Ok(())
    }
}
