//! Provider configuration shared by the Workflow Provider and Event Provider (§6
//! "Configuration").

use std::time::Duration;

use crate::queue_manager::MIN_STALL_INTERVAL;
use crate::reliability::RetryPolicy;

/// Every field is optional at the call site; [`ProviderConfig::default`] carries the
/// spec's defaults.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub queue_prefix: String,
    pub default_timeout: Duration,
    pub stall_interval: Duration,
    pub flow_state_cleanup_delay: Duration,
    pub max_flow_states: usize,
    /// `Duration::ZERO` disables the per-step timeout.
    pub step_timeout: Duration,
    pub provider_id: String,
    pub default_retry: RetryPolicy,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            queue_prefix: "workflow".to_string(),
            default_timeout: Duration::from_secs(30),
            stall_interval: MIN_STALL_INTERVAL,
            flow_state_cleanup_delay: Duration::from_secs(300),
            max_flow_states: 10_000,
            step_timeout: Duration::ZERO,
            provider_id: uuid::Uuid::now_v7().to_string(),
            default_retry: RetryPolicy::exponential(),
        }
    }
}

impl ProviderConfig {
    pub fn with_queue_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.queue_prefix = prefix.into();
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_stall_interval(mut self, interval: Duration) -> Self {
        self.stall_interval = interval;
        self
    }

    pub fn with_flow_state_cleanup_delay(mut self, delay: Duration) -> Self {
        self.flow_state_cleanup_delay = delay;
        self
    }

    pub fn with_max_flow_states(mut self, max: usize) -> Self {
        self.max_flow_states = max;
        self
    }

    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = timeout;
        self
    }

    pub fn with_provider_id(mut self, provider_id: impl Into<String>) -> Self {
        self.provider_id = provider_id.into();
        self
    }

    pub fn with_default_retry(mut self, retry: RetryPolicy) -> Self {
        self.default_retry = retry;
        self
    }

    /// Clamps `stall_interval` up to the enforced minimum (§4.4, §5 "Stall-lock
    /// discipline").
    pub fn validated(mut self) -> Self {
        if self.stall_interval < MIN_STALL_INTERVAL {
            self.stall_interval = MIN_STALL_INTERVAL;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_spec() {
        let config = ProviderConfig::default();
        assert_eq!(config.queue_prefix, "workflow");
        assert_eq!(config.default_timeout, Duration::from_secs(30));
        assert_eq!(config.stall_interval, Duration::from_secs(5));
        assert_eq!(config.flow_state_cleanup_delay, Duration::from_secs(300));
        assert_eq!(config.max_flow_states, 10_000);
        assert_eq!(config.step_timeout, Duration::ZERO);
        assert_eq!(config.default_retry.max_attempts, 3);
    }

    #[test]
    fn validated_clamps_stall_interval() {
        let config = ProviderConfig {
            stall_interval: Duration::from_millis(500),
            ..ProviderConfig::default()
        }
        .validated();
        assert_eq!(config.stall_interval, MIN_STALL_INTERVAL);
    }
}
