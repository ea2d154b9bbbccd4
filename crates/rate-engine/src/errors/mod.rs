//! Error types and failure classification for the rate engine.
//!
//! This module provides:
//! - [`EngineError`]: The main error enum for engine operations
//! - [`BackendError`]: Failures reported by a cache backend
//! - [`SinkError`]: Failures reported by a rate sink
//! - [`ErrorClass`]: Classification deciding how a failure is contained

mod class;

pub use class::ErrorClass;

use thiserror::Error;

use crate::resilience::BreakerError;

/// Errors raised by a cache backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// The backend could not be reached.
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    /// The call did not complete within the configured timeout.
    #[error("Backend operation timed out after {0} ms")]
    Timeout(u64),

    /// The stored value could not be encoded or decoded.
    #[error("Backend serialization failed: {0}")]
    Serialization(String),

    /// The requested TTL cannot be represented as a deadline.
    #[error("Backend rejected TTL of {0} s")]
    InvalidTtl(u64),
}

/// Errors raised by a rate sink.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    /// The downstream transport rejected or dropped the message.
    #[error("Sink delivery failed: {0}")]
    Delivery(String),

    /// The sink is closed and accepts no further messages.
    #[error("Sink closed")]
    Closed,

    /// Publishing did not complete within the configured timeout.
    #[error("Sink publish timed out after {0} ms")]
    Timeout(u64),
}

/// Errors that can occur inside the engine.
///
/// Each variant is classified into an [`ErrorClass`] via [`class`](Self::class),
/// which decides whether the failure is fatal, contained to a run, or silent.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Settings or rules are invalid.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The rule set contains a dependency cycle.
    #[error("Dependency cycle detected: {}", path.join(" -> "))]
    DependencyCycle {
        /// Output symbols forming the cycle, first symbol repeated at the end.
        path: Vec<String>,
    },

    /// No strategy matches a rule by id or by kind.
    #[error("No strategy for rule '{output}' (strategy id '{strategy_id}', kind {kind})")]
    UnresolvableStrategy {
        /// Output symbol of the rule
        output: String,
        /// Strategy id requested by the rule
        strategy_id: String,
        /// Rule kind used as the fallback key
        kind: String,
    },

    /// A raw tick failed validation.
    #[error("Validation failed for {symbol}: {message}")]
    Validation {
        /// Symbol of the rejected rate
        symbol: String,
        /// Joined hard-failure messages
        message: String,
    },

    /// Required inputs for an output are not yet available.
    #[error("Inputs missing for {output}: {}", missing.join(", "))]
    MissingInputs {
        /// Output symbol that was deferred
        output: String,
        /// Dependency keys not found
        missing: Vec<String>,
    },

    /// A strategy returned no value for complete inputs.
    #[error("Strategy '{strategy_id}' could not compute {output}")]
    NotComputable {
        /// Output symbol
        output: String,
        /// Strategy that declined
        strategy_id: String,
    },

    /// A pipeline stage failed.
    #[error("Stage '{stage}' failed: {message}")]
    Stage {
        /// Stage name
        stage: &'static str,
        /// Failure description
        message: String,
    },

    /// A circuit breaker rejected the call.
    #[error("Circuit open: {name}")]
    CircuitOpen {
        /// Name of the guarded resource
        name: String,
    },

    /// The engine is not in a state that allows the operation.
    #[error("Invalid lifecycle transition from {from} to {to}")]
    Lifecycle {
        /// Current state
        from: String,
        /// Requested state
        to: String,
    },

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Sink(#[from] SinkError),

    #[error("Settings file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    /// Returns the containment class for this error.
    ///
    /// ```
    /// use ratefeed_engine::errors::{EngineError, ErrorClass};
    ///
    /// let error = EngineError::DependencyCycle { path: vec!["A".into(), "B".into(), "A".into()] };
    /// assert_eq!(error.class(), ErrorClass::Configuration);
    ///
    /// let error = EngineError::CircuitOpen { name: "cache".into() };
    /// assert_eq!(error.class(), ErrorClass::Transient);
    /// ```
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Configuration(_)
            | Self::DependencyCycle { .. }
            | Self::UnresolvableStrategy { .. }
            | Self::Io(_)
            | Self::Json(_) => ErrorClass::Configuration,

            Self::Backend(_) | Self::Sink(_) | Self::CircuitOpen { .. } => ErrorClass::Transient,

            Self::MissingInputs { .. } => ErrorClass::Deferred,

            Self::NotComputable { .. } => ErrorClass::Computation,

            Self::Validation { .. } | Self::Stage { .. } | Self::Lifecycle { .. } => {
                ErrorClass::Rejected
            }
        }
    }
}

impl<E> From<BreakerError<E>> for EngineError
where
    E: Into<EngineError>,
{
    fn from(error: BreakerError<E>) -> Self {
        match error {
            BreakerError::Open { name } => Self::CircuitOpen { name },
            BreakerError::Inner(inner) => inner.into(),
        }
    }
}
