//! Workflow Worker (§4.8.1), Step Worker (§4.8.2), and Parallel Group Worker (§4.8.3) —
//! built as [`crate::store::WorkerHandler`] closures over a [`super::WorkflowProvider`].

use std::sync::Arc;

use futures::future::join_all;
use indexmap::IndexMap;
use serde_json::Value;
use tracing::{error, instrument};

use crate::codec::{self, StepResultWrapper};
use crate::context::WorkflowContext;
use crate::error::EngineError;
use crate::flow_builder::{self, StepJobData, WorkflowJobData};
use crate::store::{BackingStore, RawJob, WorkerHandler};

use super::flow_state::FlowStatus;
use super::{rollback, timeout, WorkflowProvider};

/// Builds the root worker for `workflow_name`'s workflow queue.
pub fn build_workflow_worker<S: BackingStore>(
    provider: Arc<WorkflowProvider<S>>,
    workflow_name: String,
) -> WorkerHandler {
    Arc::new(move |job: RawJob| {
        let provider = Arc::clone(&provider);
        let workflow_name = workflow_name.clone();
        Box::pin(async move { run_workflow_worker(&provider, &workflow_name, job).await.map_err(|e| e.to_string()) })
    })
}

#[instrument(skip(provider, job), fields(workflow_name))]
async fn run_workflow_worker<S: BackingStore>(
    provider: &Arc<WorkflowProvider<S>>,
    workflow_name: &str,
    job: RawJob,
) -> Result<Value, EngineError> {
    let job_data: WorkflowJobData = serde_json::from_value(job.data)?;
    let flow_id = job_data.flow_id.clone();

    // A step worker on this same instance may already have observed the failure and
    // rejected the local latch directly; skip the consumer callback so it never sees a
    // workflow it already knows failed (§4.8.1).
    if provider.flow_states.get_status(&flow_id) == Some(FlowStatus::Failed) {
        return Ok(Value::Null);
    }

    let children = provider.store.get_children_values(&job.queue, &job.id).await?;
    let flattened = codec::flatten(&children)?;

    let consumer = provider
        .consumers
        .get(workflow_name)
        .map(|entry| entry.value().clone())
        .ok_or_else(|| EngineError::NotRegistered(workflow_name.to_string()))?;

    if !consumer.step_groups.is_empty() && flattened.is_empty() {
        return Err(EngineError::EmitterConsumerMismatch(workflow_name.to_string()));
    }

    (consumer.on_complete)(job_data.workflow_data, job_data.meta, flattened.into_iter().collect()).await
}

/// Builds the shared step worker for every consumer-registered workflow's step queue.
/// The workflow name is recovered from the queue name pattern at dispatch time rather
/// than captured per-registration, since a single handler value is reused verbatim for
/// every workflow's step queue registration.
pub fn build_step_worker<S: BackingStore>(provider: Arc<WorkflowProvider<S>>) -> WorkerHandler {
    Arc::new(move |job: RawJob| {
        let provider = Arc::clone(&provider);
        Box::pin(async move { run_step_worker(&provider, job).await.map_err(|e| e.to_string()) })
    })
}

/// Parses `${prefix}.${workflow-name}.steps` back to `workflow-name`.
fn workflow_name_from_step_queue(queue: &str) -> Option<&str> {
    queue.strip_suffix(".steps")?.split_once('.').map(|(_, rest)| rest)
}

#[instrument(skip(provider, job))]
async fn run_step_worker<S: BackingStore>(
    provider: &Arc<WorkflowProvider<S>>,
    job: RawJob,
) -> Result<Value, EngineError> {
    let workflow_name = workflow_name_from_step_queue(&job.queue)
        .ok_or_else(|| EngineError::NotRegistered(job.queue.clone()))?
        .to_string();
    let step_data: StepJobData = serde_json::from_value(job.data.clone())?;

    if flow_builder::is_parallel_step_name(&job.name) {
        run_parallel_group(provider, &workflow_name, &job, &step_data).await
    } else {
        run_single_step(provider, &workflow_name, &job, &step_data).await
    }
}

async fn run_single_step<S: BackingStore>(
    provider: &Arc<WorkflowProvider<S>>,
    workflow_name: &str,
    job: &RawJob,
    step_data: &StepJobData,
) -> Result<Value, EngineError> {
    let execute = provider.step_registry.get(workflow_name, &job.name)?;
    let children = provider.store.get_children_values(&job.queue, &job.id).await?;
    let prior_results = codec::flatten(&children)?;

    let ctx = WorkflowContext::new(
        step_data.flow_id.clone(),
        workflow_name.to_string(),
        job.name.clone(),
        provider.config.provider_id.clone(),
        step_data.workflow_data.clone(),
        prior_results.clone().into_iter().collect(),
        step_data.meta.clone(),
    );

    match timeout::with_step_timeout(provider.config.step_timeout, &job.name, execute(ctx)).await {
        Ok(value) => Ok(StepResultWrapper::sequential(job.name.clone(), value, prior_results).to_value()?),
        Err(err) => {
            // The failing step itself was never completed, so the rollback sweep must
            // cover only the steps that already succeeded — `prior_results`, in the
            // order they completed.
            let completion_order: Vec<String> = prior_results.keys().cloned().collect();
            on_step_failure(provider, workflow_name, step_data, &job.name, &completion_order, &prior_results, &err).await;
            Err(err)
        }
    }
}

async fn run_parallel_group<S: BackingStore>(
    provider: &Arc<WorkflowProvider<S>>,
    workflow_name: &str,
    job: &RawJob,
    step_data: &StepJobData,
) -> Result<Value, EngineError> {
    let members = flow_builder::parallel_members(&job.name);
    let children = provider.store.get_children_values(&job.queue, &job.id).await?;
    let prior_results = codec::flatten(&children)?;

    let outcomes = join_all(members.iter().map(|member| {
        let provider = Arc::clone(provider);
        let workflow_name = workflow_name.to_string();
        let member = member.clone();
        let prior_results = prior_results.clone();
        let step_data = step_data.clone();
        async move {
            let execute = provider.step_registry.get(&workflow_name, &member)?;
            let ctx = WorkflowContext::new(
                step_data.flow_id.clone(),
                workflow_name.clone(),
                member.clone(),
                provider.config.provider_id.clone(),
                step_data.workflow_data.clone(),
                prior_results.clone().into_iter().collect(),
                step_data.meta.clone(),
            );
            let value = timeout::with_step_timeout(provider.config.step_timeout, &member, execute(ctx)).await?;
            Ok::<(String, Value), EngineError>((member, value))
        }
    }))
    .await;

    let mut parallel_results = IndexMap::new();
    let mut first_failure: Option<(String, EngineError)> = None;
    for (member, outcome) in members.iter().zip(outcomes) {
        match outcome {
            Ok((name, value)) => {
                parallel_results.insert(name, value);
            }
            Err(err) => {
                if first_failure.is_none() {
                    first_failure = Some((member.clone(), err));
                }
            }
        }
    }

    match first_failure {
        None => Ok(StepResultWrapper::parallel(parallel_results, prior_results).to_value()?),
        Some((failed_member, err)) => {
            // Only the members that actually completed belong in the sweep; the failed
            // member (and any member the join never got to) has no completion to undo.
            let mut completed = prior_results.clone();
            completed.extend(parallel_results);
            let completion_order: Vec<String> = completed.keys().cloned().collect();
            on_step_failure(provider, workflow_name, step_data, &failed_member, &completion_order, &completed, &err).await;
            Err(EngineError::StepFailure {
                step_name: failed_member,
                source: err.to_string().into(),
            })
        }
    }
}

/// Common failure path for both a single step and a parallel group (§4.8.2, §4.8.3):
/// rollback sweep, consumer `on_error`, local flow-state transition, and — when this
/// instance also holds the flow's pending latch — an immediate local rejection rather
/// than waiting on the durable-failure cascade to the root job.
async fn on_step_failure<S: BackingStore>(
    provider: &Arc<WorkflowProvider<S>>,
    workflow_name: &str,
    step_data: &StepJobData,
    failed_step: &str,
    completion_order: &[String],
    completed: &IndexMap<String, Value>,
    err: &EngineError,
) {
    rollback::run_sweep(
        &provider.step_registry,
        workflow_name,
        &step_data.flow_id,
        &provider.config.provider_id,
        &step_data.workflow_data,
        &step_data.meta,
        completion_order,
        completed,
    )
    .await;

    if let Some(consumer) = provider.consumers.get(workflow_name) {
        if let Some(on_error) = &consumer.on_error {
            on_error(err.to_string());
        }
    }

    provider.flow_states.set_status(&step_data.flow_id, FlowStatus::Failed);
    let provider_for_cleanup = Arc::clone(provider);
    provider_for_cleanup
        .flow_states
        .schedule_cleanup(step_data.flow_id.clone(), provider.config.flow_state_cleanup_delay);

    let workflow_queue = flow_builder::workflow_queue_name(&provider.config.queue_prefix, workflow_name);
    if provider.completion_tracker.has_pending(&workflow_queue, &step_data.root_job_id) {
        error!(workflow_name, flow_id = %step_data.flow_id, "rejecting local pending latch after step failure");
        provider.completion_tracker.fail(
            &workflow_queue,
            &step_data.root_job_id,
            EngineError::StepFailure {
                step_name: failed_step.to_string(),
                source: err.to_string().into(),
            },
        );
    }
}
