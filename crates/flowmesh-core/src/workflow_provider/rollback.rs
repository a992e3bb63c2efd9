//! Rollback Engine (§4.8.6): on step failure, unwinds the steps that already
//! succeeded, in reverse completion order.

use indexmap::IndexMap;
use serde_json::Value;
use tracing::{info, warn};

use crate::context::{PropagationMeta, WorkflowContext};
use crate::registry::StepRegistry;

/// Runs every completed step's rollback (if registered) in reverse of `completion_order`.
/// Each rollback is awaited independently; a rollback's own error is logged as a string
/// and never propagated, since rollback failures must not mask the original step
/// failure that triggered the sweep.
///
/// `completion_order` and `completed` are expected to describe the same set: the former
/// gives ordering, the latter gives the value each step produced.
pub async fn run_sweep(
    step_registry: &StepRegistry,
    workflow_name: &str,
    flow_id: &str,
    provider_id: &str,
    workflow_data: &Value,
    meta: &Option<PropagationMeta>,
    completion_order: &[String],
    completed: &IndexMap<String, Value>,
) {
    let mut succeeded = 0usize;
    let mut failed = 0usize;

    for step_name in completion_order.iter().rev() {
        let Ok(Some(rollback_fn)) = step_registry.get_rollback(workflow_name, step_name) else {
            continue;
        };
        let ctx = WorkflowContext::new(
            flow_id.to_string(),
            workflow_name.to_string(),
            step_name.clone(),
            provider_id.to_string(),
            workflow_data.clone(),
            completed.clone().into_iter().collect(),
            meta.clone(),
        )
        .for_rollback();

        match rollback_fn(ctx).await {
            Ok(_) => succeeded += 1,
            Err(err) => {
                failed += 1;
                warn!(
                    %workflow_name,
                    step = %step_name,
                    error = %err,
                    "rollback failed"
                );
            }
        }
    }

    info!(%workflow_name, %flow_id, succeeded, failed, "rollback sweep complete");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn rollbacks_run_in_reverse_completion_order() {
        let registry = StepRegistry::new();
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        for name in ["step1", "step2"] {
            let order = Arc::clone(&order);
            let name_owned = name.to_string();
            registry
                .register(
                    "wf",
                    name,
                    Arc::new(move |_ctx| Box::pin(async move { Ok(Value::Null) })),
                    Some(Arc::new(move |_ctx| {
                        let order = Arc::clone(&order);
                        let name_owned = name_owned.clone();
                        Box::pin(async move {
                            order.lock().push(name_owned);
                            Ok(Value::Null)
                        })
                    })),
                )
                .unwrap();
        }

        let mut completed = IndexMap::new();
        completed.insert("step1".to_string(), serde_json::json!(1));
        completed.insert("step2".to_string(), serde_json::json!(2));

        run_sweep(
            &registry,
            "wf",
            "flow-1",
            "provider-a",
            &Value::Null,
            &None,
            &["step1".to_string(), "step2".to_string()],
            &completed,
        )
        .await;

        assert_eq!(*order.lock(), vec!["step2".to_string(), "step1".to_string()]);
    }

    #[tokio::test]
    async fn missing_rollback_is_skipped_without_error() {
        let registry = StepRegistry::new();
        registry
            .register(
                "wf",
                "step1",
                Arc::new(|_ctx| Box::pin(async move { Ok(Value::Null) })),
                None,
            )
            .unwrap();

        run_sweep(
            &registry,
            "wf",
            "flow-1",
            "provider-a",
            &Value::Null,
            &None,
            &["step1".to_string()],
            &IndexMap::new(),
        )
        .await;
    }

    #[tokio::test]
    async fn a_failing_rollback_does_not_stop_the_sweep() {
        let registry = StepRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        for name in ["step1", "step2"] {
            let calls = Arc::clone(&calls);
            registry
                .register(
                    "wf",
                    name,
                    Arc::new(|_ctx| Box::pin(async move { Ok(Value::Null) })),
                    Some(Arc::new(move |_ctx| {
                        let calls = Arc::clone(&calls);
                        Box::pin(async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            Err(EngineError::WorkflowTimeout)
                        })
                    })),
                )
                .unwrap();
        }

        run_sweep(
            &registry,
            "wf",
            "flow-1",
            "provider-a",
            &Value::Null,
            &None,
            &["step1".to_string(), "step2".to_string()],
            &IndexMap::new(),
        )
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
