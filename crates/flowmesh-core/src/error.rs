//! Error kinds for the workflow and event engine (spec §7).

use thiserror::Error;

/// Errors surfaced by the Step Registry, Flow Builder, Workflow Provider, and Event
/// Provider.
///
/// Names follow spec §7 ("Error kinds (names, not language types)") directly so the
/// propagation policy described there maps onto a single closed enum.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A provider method was called before `start()`.
    #[error("provider not started")]
    NotStarted,

    /// `execute`/`emit` targeted a workflow or event name with no registration.
    #[error("{0:?} is not registered")]
    NotRegistered(String),

    /// A step name failed validation at registration time (spec §3, §8 "Step name validity").
    #[error("invalid step name {0:?}: must be alphanumeric/underscore/hyphen, start alphanumeric, not begin with `__`, and be at most 128 characters")]
    InvalidStepName(String),

    /// Step Registry lookup miss; carries both the workflow and step name.
    #[error("step not found: {workflow_name}.{step_name}")]
    StepNotFound {
        workflow_name: String,
        step_name: String,
    },

    /// A step's execute-fn returned an error. Carries the step name and the wrapped cause.
    #[error("step {step_name:?} failed: {source}")]
    StepFailure {
        step_name: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// A step did not complete within its configured step timeout (spec §4.8.5).
    #[error("step {0:?} timed out")]
    StepTimeout(String),

    /// A flow did not settle within its effective timeout (spec §4.8.4). Distinct from
    /// the generic [`EngineError::Timeout`] below: this one has already been
    /// reconciled against the backing store by the timeout engine (the near-miss
    /// check), so by the time it surfaces the store genuinely has no completed result.
    #[error("workflow timed out")]
    WorkflowTimeout,

    /// A Completion Tracker registration (an event `emit`'s request/response wait, most
    /// commonly) timed out waiting for a durable completion or failure signal. Carries
    /// the correlation id.
    #[error("timed out waiting for correlation id {0:?}")]
    Timeout(String),

    /// An emitter-only instance produced a flat job but the consumer expected step
    /// children (spec §4.8.1).
    #[error("emitter/consumer mismatch: workflow {0:?} expected step children but found none")]
    EmitterConsumerMismatch(String),

    /// An idempotency-key collision was suppressed (spec §4.8.8); never surfaced to the
    /// caller, kept here only so internal plumbing has a typed value to log.
    #[error("duplicate submission suppressed for idempotency key {0:?}")]
    Duplicate(String),

    /// The backing store is unavailable. Suppressed during shutdown, otherwise surfaced.
    #[error("backing store unavailable: {0}")]
    BackingStoreUnavailable(#[from] crate::store::StoreError),

    /// JSON (de)serialization failure while wrapping/flattening step results.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    /// True for the two error kinds spec §7 says must be swallowed rather than surfaced:
    /// connection-close during shutdown, and suppressed idempotency-key collisions.
    pub fn is_suppressed_during_shutdown(&self) -> bool {
        matches!(self, EngineError::BackingStoreUnavailable(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_not_found_names_both_parts() {
        let err = EngineError::StepNotFound {
            workflow_name: "onboarding".into(),
            step_name: "send_email".into(),
        };
        assert_eq!(err.to_string(), "step not found: onboarding.send_email");
    }

    #[test]
    fn invalid_step_name_message_carries_the_name() {
        let err = EngineError::InvalidStepName("__reserved".into());
        assert!(err.to_string().contains("__reserved"));
    }
}
