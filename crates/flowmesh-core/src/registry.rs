//! Step Registry: the in-process map from (workflow-name, step-name) to its execute-fn
//! and optional rollback-fn (§4.1).

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde_json::Value;

use crate::context::WorkflowContext;
use crate::error::EngineError;

/// A step's execute or rollback function. Boxed and `Arc`-shared so a single registered
/// step can be invoked concurrently by a parallel-group worker (§4.8.3).
pub type StepFn =
    Arc<dyn Fn(WorkflowContext) -> BoxFuture<'static, Result<Value, EngineError>> + Send + Sync>;

struct StepEntry {
    execute: StepFn,
    rollback: Option<StepFn>,
}

/// Maximum length of a step name (§3).
pub const MAX_STEP_NAME_LEN: usize = 128;

/// Validates a step name against §3 / §8's "Step name validity" property: alphanumeric
/// with underscores and hyphens, starting alphanumeric, never beginning with the
/// reserved `__` prefix, at most 128 characters.
pub fn validate_step_name(name: &str) -> Result<(), EngineError> {
    let valid = !name.is_empty()
        && name.len() <= MAX_STEP_NAME_LEN
        && !name.starts_with("__")
        && name
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphanumeric())
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(EngineError::InvalidStepName(name.to_string()))
    }
}

/// Two-level map: workflow-name → step-name → (execute-fn, optional rollback-fn).
///
/// Registration overwrites prior entries for the same key silently (§4.1).
#[derive(Clone, Default)]
pub struct StepRegistry {
    workflows: Arc<RwLock<HashMap<String, HashMap<String, StepEntry>>>>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a step's execute-fn and optional rollback-fn under a workflow name.
    /// Validates the step name first (§8 "Step name validity").
    pub fn register(
        &self,
        workflow_name: &str,
        step_name: &str,
        execute: StepFn,
        rollback: Option<StepFn>,
    ) -> Result<(), EngineError> {
        validate_step_name(step_name)?;
        self.workflows
            .write()
            .entry(workflow_name.to_string())
            .or_default()
            .insert(step_name.to_string(), StepEntry { execute, rollback });
        Ok(())
    }

    /// Look up a step's execute-fn. Fails with `StepNotFound` carrying both names.
    pub fn get(&self, workflow_name: &str, step_name: &str) -> Result<StepFn, EngineError> {
        self.workflows
            .read()
            .get(workflow_name)
            .and_then(|steps| steps.get(step_name))
            .map(|entry| entry.execute.clone())
            .ok_or_else(|| EngineError::StepNotFound {
                workflow_name: workflow_name.to_string(),
                step_name: step_name.to_string(),
            })
    }

    /// Look up a step's rollback-fn. `None` is legal — it means the step has no
    /// compensation and is skipped during rollback sweeps (§4.1, §4.8.6). Only the
    /// lookup of the step itself can fail.
    pub fn get_rollback(
        &self,
        workflow_name: &str,
        step_name: &str,
    ) -> Result<Option<StepFn>, EngineError> {
        self.workflows
            .read()
            .get(workflow_name)
            .and_then(|steps| steps.get(step_name))
            .map(|entry| entry.rollback.clone())
            .ok_or_else(|| EngineError::StepNotFound {
                workflow_name: workflow_name.to_string(),
                step_name: step_name.to_string(),
            })
    }

    pub fn has(&self, workflow_name: &str, step_name: &str) -> bool {
        self.workflows
            .read()
            .get(workflow_name)
            .is_some_and(|steps| steps.contains_key(step_name))
    }

    /// Step names registered under a workflow, in no particular order.
    pub fn list_steps(&self, workflow_name: &str) -> Vec<String> {
        self.workflows
            .read()
            .get(workflow_name)
            .map(|steps| steps.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Remove every registration. Used by tests and by a provider shutting down.
    pub fn clear(&self) {
        self.workflows.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    fn noop_step() -> StepFn {
        Arc::new(|_ctx| async { Ok(Value::Null) }.boxed())
    }

    #[test]
    fn rejects_reserved_double_underscore_prefix() {
        let registry = StepRegistry::new();
        let err = registry
            .register("wf", "__parallel__:a,b", noop_step(), None)
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidStepName(_)));
    }

    #[test]
    fn rejects_names_with_invalid_characters() {
        assert!(validate_step_name("send email").is_err());
        assert!(validate_step_name("send:email").is_err());
        assert!(validate_step_name("-leading-hyphen").is_err());
    }

    #[test]
    fn accepts_alphanumeric_underscore_hyphen_names() {
        assert!(validate_step_name("send_email-v2").is_ok());
    }

    #[test]
    fn get_missing_step_names_both_workflow_and_step() {
        let registry = StepRegistry::new();
        let err = registry.get("onboarding", "send_email").unwrap_err();
        match err {
            EngineError::StepNotFound {
                workflow_name,
                step_name,
            } => {
                assert_eq!(workflow_name, "onboarding");
                assert_eq!(step_name, "send_email");
            }
            other => panic!("expected StepNotFound, got {other:?}"),
        }
    }

    #[test]
    fn rollback_absence_is_legal() {
        let registry = StepRegistry::new();
        registry.register("wf", "step1", noop_step(), None).unwrap();
        assert_eq!(registry.get_rollback("wf", "step1").unwrap().is_none(), true);
    }

    #[test]
    fn reregistration_overwrites_silently() {
        let registry = StepRegistry::new();
        registry.register("wf", "step1", noop_step(), None).unwrap();
        registry
            .register("wf", "step1", noop_step(), Some(noop_step()))
            .unwrap();
        assert!(registry.get_rollback("wf", "step1").unwrap().is_some());
    }

    #[test]
    fn list_steps_reflects_registrations() {
        let registry = StepRegistry::new();
        registry.register("wf", "a", noop_step(), None).unwrap();
        registry.register("wf", "b", noop_step(), None).unwrap();
        let mut steps = registry.list_steps("wf");
        steps.sort();
        assert_eq!(steps, vec!["a".to_string(), "b".to_string()]);
    }
}
