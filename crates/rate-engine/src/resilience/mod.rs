//! Resilience primitives for calls to external collaborators.

mod circuit_breaker;

pub use circuit_breaker::{
    BreakerError, CircuitBreaker, CircuitBreakerConfig, CircuitMetrics, CircuitState,
};
