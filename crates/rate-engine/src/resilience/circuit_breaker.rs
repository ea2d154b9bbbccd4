//! Circuit breaker guarding one flaky dependency.
//!
//! The circuit has three states:
//!
//! - **Closed**: Normal operation, calls go through.
//! - **Open**: The dependency is failing, calls are rejected without being made.
//! - **HalfOpen**: Cooldown elapsed, calls are let through to test recovery.
//!
//! ```text
//!            N consecutive failures
//!   Closed ─────────────────────────▶ Open
//!     ▲                                │  cooldown elapsed
//!     │ M successes                    │  (checked lazily on next call)
//!     │                                ▼
//!     └────────────────────────── HalfOpen
//!               any failure ──▶ Open
//! ```
//!
//! The Open → HalfOpen move happens inside [`CircuitBreaker::is_call_permitted`];
//! there is no timer. State is in-memory and resets on restart.

use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Default number of failures before opening the circuit.
const DEFAULT_FAILURE_THRESHOLD: u32 = 5;

/// Default time to wait before transitioning from Open to HalfOpen.
const DEFAULT_RECOVERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Number of successful calls needed to close the circuit from HalfOpen.
const HALF_OPEN_SUCCESS_THRESHOLD: u32 = 2;

/// Circuit breaker state.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Normal operation - calls are allowed.
    Closed,
    /// Dependency is failing - calls are rejected.
    Open,
    /// Probing recovery - calls are allowed.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "CLOSED"),
            Self::Open => write!(f, "OPEN"),
            Self::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Error returned by [`CircuitBreaker::execute`].
#[derive(Error, Debug)]
pub enum BreakerError<E> {
    /// The circuit rejected the call; the operation was not invoked.
    #[error("Circuit open: {name}")]
    Open { name: String },

    /// The operation ran and failed.
    #[error(transparent)]
    Inner(E),
}

impl<E> BreakerError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open { .. })
    }
}

#[derive(Debug)]
struct Circuit {
    state: CircuitState,
    /// Consecutive failures while Closed.
    failure_count: u32,
    /// Consecutive successes while HalfOpen.
    half_open_successes: u32,
    opened_at: Option<Instant>,
    last_failure: Option<Instant>,
}

impl Circuit {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            half_open_successes: 0,
            opened_at: None,
            last_failure: None,
        }
    }

    fn open(&mut self) {
        self.state = CircuitState::Open;
        self.half_open_successes = 0;
        self.opened_at = Some(Instant::now());
    }
}

/// Circuit breaker configuration.
#[derive(Clone, Debug, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening the circuit.
    pub failure_threshold: u32,
    /// Cooldown before a call may test recovery.
    pub recovery_timeout: Duration,
    /// Number of successes needed to close from HalfOpen.
    pub half_open_success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            recovery_timeout: DEFAULT_RECOVERY_TIMEOUT,
            half_open_success_threshold: HALF_OPEN_SUCCESS_THRESHOLD,
        }
    }
}

/// Thread-safe circuit breaker for a single named dependency.
pub struct CircuitBreaker {
    name: String,
    circuit: Mutex<Circuit>,
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    /// Create a breaker with default settings.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_config(name, CircuitBreakerConfig::default())
    }

    pub fn with_config(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            circuit: Mutex::new(Circuit::new()),
            config,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Lock the circuit, recovering from poison.
    ///
    /// A poisoned lock only means a panic happened mid-update; the worst
    /// outcome is a slightly wrong counter.
    fn lock_circuit(&self) -> MutexGuard<'_, Circuit> {
        self.circuit.lock().unwrap_or_else(|poisoned| {
            warn!(breaker = %self.name, "Circuit breaker mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Whether a call may be made now.
    ///
    /// True in Closed and HalfOpen. An Open circuit whose cooldown has
    /// elapsed moves to HalfOpen here and permits the call.
    pub fn is_call_permitted(&self) -> bool {
        let mut circuit = self.lock_circuit();

        match circuit.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let cooled_down = circuit
                    .opened_at
                    .map(|at| at.elapsed() >= self.config.recovery_timeout)
                    .unwrap_or(true);
                if cooled_down {
                    info!(breaker = %self.name, "Circuit breaker: Open -> HalfOpen");
                    circuit.state = CircuitState::HalfOpen;
                    circuit.half_open_successes = 0;
                }
                cooled_down
            }
        }
    }

    /// Record a successful call.
    ///
    /// Always resets the failure count. In HalfOpen state it also counts
    /// toward closing.
    pub fn record_success(&self) {
        let mut circuit = self.lock_circuit();

        match circuit.state {
            CircuitState::Closed => {
                circuit.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                circuit.failure_count = 0;
                circuit.half_open_successes += 1;
                debug!(
                    breaker = %self.name,
                    "Circuit breaker: success in HalfOpen ({}/{})",
                    circuit.half_open_successes,
                    self.config.half_open_success_threshold
                );

                if circuit.half_open_successes >= self.config.half_open_success_threshold {
                    info!(
                        breaker = %self.name,
                        "Circuit breaker: closing after {} successes", circuit.half_open_successes
                    );
                    *circuit = Circuit::new();
                }
            }
            CircuitState::Open => {
                debug!(breaker = %self.name, "Circuit breaker: late success while Open ignored");
            }
        }
    }

    /// Record a failed call.
    ///
    /// In HalfOpen state any failure reopens the circuit.
    pub fn record_failure(&self) {
        let mut circuit = self.lock_circuit();
        circuit.last_failure = Some(Instant::now());

        match circuit.state {
            CircuitState::Closed => {
                circuit.failure_count += 1;
                if circuit.failure_count >= self.config.failure_threshold {
                    warn!(
                        breaker = %self.name,
                        "Circuit breaker: opening after {} failures", circuit.failure_count
                    );
                    circuit.open();
                } else {
                    debug!(
                        breaker = %self.name,
                        "Circuit breaker: failure ({}/{})",
                        circuit.failure_count,
                        self.config.failure_threshold
                    );
                }
            }
            CircuitState::HalfOpen => {
                warn!(breaker = %self.name, "Circuit breaker: reopening after failure in HalfOpen");
                circuit.open();
            }
            CircuitState::Open => {}
        }
    }

    /// Run `op` through the breaker.
    ///
    /// Returns [`BreakerError::Open`] without invoking `op` when the call is
    /// not permitted. Otherwise the outcome of `op` is recorded.
    pub async fn execute<F, Fut, T, E>(&self, op: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if !self.is_call_permitted() {
            return Err(BreakerError::Open {
                name: self.name.clone(),
            });
        }

        match op().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                self.record_failure();
                Err(BreakerError::Inner(e))
            }
        }
    }

    /// Current state, without applying the lazy cooldown transition.
    pub fn state(&self) -> CircuitState {
        self.lock_circuit().state
    }

    pub fn failure_count(&self) -> u32 {
        self.lock_circuit().failure_count
    }

    /// Reset to Closed.
    pub fn reset(&self) {
        let mut circuit = self.lock_circuit();
        info!(breaker = %self.name, "Circuit breaker: manual reset");
        *circuit = Circuit::new();
    }

    pub fn metrics(&self) -> CircuitMetrics {
        let circuit = self.lock_circuit();
        CircuitMetrics {
            name: self.name.clone(),
            state: circuit.state,
            failure_count: circuit.failure_count,
            half_open_successes: circuit.half_open_successes,
            millis_since_last_failure: circuit
                .last_failure
                .map(|at| at.elapsed().as_millis() as u64),
        }
    }
}

/// Snapshot of a breaker for health reporting.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitMetrics {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub half_open_successes: u32,
    pub millis_since_last_failure: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast_config(failures: u32, successes: u32) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: failures,
            recovery_timeout: Duration::from_millis(10),
            half_open_success_threshold: successes,
        }
    }

    #[test]
    fn test_circuit_starts_closed() {
        let cb = CircuitBreaker::new("cache");
        assert!(cb.is_call_permitted());
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_circuit_opens_after_threshold() {
        let cb = CircuitBreaker::with_config(
            "cache",
            CircuitBreakerConfig {
                failure_threshold: 3,
                recovery_timeout: Duration::from_secs(60),
                half_open_success_threshold: 2,
            },
        );

        cb.record_failure();
        cb.record_failure();
        assert!(cb.is_call_permitted());
        assert_eq!(cb.state(), CircuitState::Closed);

        cb.record_failure();
        assert!(!cb.is_call_permitted());
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn test_success_resets_failure_count() {
        let cb = CircuitBreaker::with_config(
            "cache",
            CircuitBreakerConfig {
                failure_threshold: 3,
                ..Default::default()
            },
        );

        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.failure_count(), 2);

        cb.record_success();
        assert_eq!(cb.failure_count(), 0);

        // Failures must be consecutive to open
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_open_transitions_to_half_open_lazily() {
        let cb = CircuitBreaker::with_config("cache", fast_config(1, 1));

        cb.record_failure();
        assert!(!cb.is_call_permitted());

        std::thread::sleep(Duration::from_millis(20));

        // Nothing moves until the next check
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.is_call_permitted());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn test_half_open_closes_after_successes() {
        let cb = CircuitBreaker::with_config("cache", fast_config(1, 2));

        cb.record_failure();
        std::thread::sleep(Duration::from_millis(20));
        cb.is_call_permitted();

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 0);
    }

    #[test]
    fn test_half_open_success_resets_failure_count() {
        let cb = CircuitBreaker::with_config("cache", fast_config(3, 2));

        cb.record_failure();
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.failure_count(), 3);
        std::thread::sleep(Duration::from_millis(20));
        assert!(cb.is_call_permitted());

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert_eq!(cb.failure_count(), 0);
        assert_eq!(cb.metrics().failure_count, 0);
    }

    #[test]
    fn test_half_open_reopens_on_failure() {
        let cb = CircuitBreaker::with_config("cache", fast_config(1, 2));

        cb.record_failure();
        std::thread::sleep(Duration::from_millis(20));
        cb.is_call_permitted();
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.is_call_permitted());
    }

    #[test]
    fn test_manual_reset() {
        let cb = CircuitBreaker::with_config("cache", fast_config(1, 1));

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);

        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 0);
    }

    #[tokio::test]
    async fn test_execute_rejects_without_invoking_when_open() {
        let cb = CircuitBreaker::with_config(
            "publisher",
            CircuitBreakerConfig {
                failure_threshold: 2,
                recovery_timeout: Duration::from_secs(60),
                half_open_success_threshold: 1,
            },
        );
        let calls = AtomicUsize::new(0);

        for _ in 0..2 {
            let result: Result<(), _> = cb
                .execute(|| async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>("boom")
                })
                .await;
            assert!(matches!(result, Err(BreakerError::Inner("boom"))));
        }
        assert_eq!(cb.state(), CircuitState::Open);

        let result = cb
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, &str>(42)
            })
            .await;
        assert!(result.as_ref().is_err_and(|e| e.is_open()));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_execute_full_recovery_cycle() {
        let cb = CircuitBreaker::with_config("cache", fast_config(1, 2));

        let _ = cb.execute(|| async { Err::<(), _>("down") }).await;
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(20)).await;

        let value = cb.execute(|| async { Ok::<_, &str>(1) }).await.unwrap();
        assert_eq!(value, 1);
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.execute(|| async { Ok::<_, &str>(2) }).await.unwrap();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_metrics() {
        let cb = CircuitBreaker::new("cache");
        cb.record_failure();
        cb.record_failure();

        let metrics = cb.metrics();
        assert_eq!(metrics.name, "cache");
        assert_eq!(metrics.failure_count, 2);
        assert_eq!(metrics.state, CircuitState::Closed);
        assert!(metrics.millis_since_last_failure.is_some());
    }
}
