//! Reliability patterns
//!
//! This module provides:
//! - [`RetryPolicy`] - configurable retry with exponential backoff, the queue manager's
//!   default job retry policy (spec §4.4, §6)
//! - [`CircuitBreakerConfig`] - optional per-step circuit breaker; not required by the
//!   engine itself, available for a [`crate::flow_builder`] caller to attach

mod circuit_breaker;
mod retry;

pub use circuit_breaker::{CircuitBreakerConfig, CircuitState};
pub use retry::RetryPolicy;
