//! Workflow Context: the value presented to step and rollback code (§6).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info_span;

/// Ambient propagation metadata captured from the caller (or passed explicitly) and
/// carried on every job envelope and step wrapper (§9 "Ambient context propagation").
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PropagationMeta {
    pub correlation_id: Option<String>,
    pub trace_id: Option<String>,
    pub user_id: Option<String>,
    pub account_id: Option<String>,
    pub action: Option<String>,
    /// Anything else the caller attached; preserved verbatim across hops.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub extra: serde_json::Map<String, Value>,
}

/// The value handed to a registered step's execute-fn or rollback-fn (§6, §4.8.2).
///
/// `log` is a `tracing::Span` pre-annotated with `{flow_id, step, provider_id}`
/// (§4.8.2: "a logger derived from meta ... annotated with {flow-id, step, provider-id}")
/// — entering it (`ctx.log.enter()`) attaches those fields to every event the step emits.
#[derive(Clone)]
pub struct WorkflowContext {
    pub flow_id: String,
    pub data: Value,
    pub results: HashMap<String, Value>,
    pub log: tracing::Span,
    pub meta: Option<PropagationMeta>,
    pub workflow_name: String,
    pub step_name: String,
    pub provider_id: String,
}

impl WorkflowContext {
    pub fn new(
        flow_id: impl Into<String>,
        workflow_name: impl Into<String>,
        step_name: impl Into<String>,
        provider_id: impl Into<String>,
        data: Value,
        results: HashMap<String, Value>,
        meta: Option<PropagationMeta>,
    ) -> Self {
        let flow_id = flow_id.into();
        let workflow_name = workflow_name.into();
        let step_name = step_name.into();
        let provider_id = provider_id.into();
        let log = info_span!(
            "step",
            flow_id = %flow_id,
            step = %step_name,
            provider_id = %provider_id,
        );
        Self {
            flow_id,
            data,
            results,
            log,
            meta,
            workflow_name,
            step_name,
            provider_id,
        }
    }

    /// A prior step's recorded output, if any.
    pub fn result_of(&self, step_name: &str) -> Option<&Value> {
        self.results.get(step_name)
    }

    /// A context for a rollback invocation of the same step: same data and results,
    /// step name suffixed `:rollback` per §4.8.6.
    pub fn for_rollback(&self) -> Self {
        let mut ctx = self.clone();
        ctx.step_name = format!("{}:rollback", self.step_name);
        ctx.log = info_span!(
            "step",
            flow_id = %ctx.flow_id,
            step = %ctx.step_name,
            provider_id = %ctx.provider_id,
        );
        ctx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rollback_context_suffixes_step_name() {
        let ctx = WorkflowContext::new(
            "flow-1",
            "onboarding",
            "send_email",
            "provider-a",
            Value::Null,
            HashMap::new(),
            None,
        );
        let rollback_ctx = ctx.for_rollback();
        assert_eq!(rollback_ctx.step_name, "send_email:rollback");
        assert_eq!(rollback_ctx.flow_id, ctx.flow_id);
    }

    #[test]
    fn result_of_reads_prior_results() {
        let mut results = HashMap::new();
        results.insert("double".to_string(), serde_json::json!(10));
        let ctx = WorkflowContext::new(
            "flow-1", "wf", "add10", "provider-a", Value::Null, results, None,
        );
        assert_eq!(ctx.result_of("double"), Some(&serde_json::json!(10)));
        assert_eq!(ctx.result_of("missing"), None);
    }
}
