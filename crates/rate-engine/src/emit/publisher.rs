//! Breaker-guarded publishing to the configured sink.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::batch::RateBatch;
use super::sink::{RateSink, SinkMessage};
use crate::errors::{EngineError, SinkError};
use crate::models::Rate;
use crate::resilience::{CircuitBreaker, CircuitBreakerConfig, CircuitMetrics};

/// Breaker name used in logs and health output.
pub const PUBLISH_BREAKER_NAME: &str = "publisher";

/// Publishes through a circuit breaker with a per-call timeout.
///
/// Failures are logged and reported as `false`; they never propagate into
/// the pipeline.
pub struct Publisher {
    sink: Arc<dyn RateSink>,
    breaker: CircuitBreaker,
    timeout: Duration,
}

impl Publisher {
    pub fn new(sink: Arc<dyn RateSink>, timeout: Duration, breaker_config: CircuitBreakerConfig) -> Self {
        Self {
            sink,
            breaker: CircuitBreaker::with_config(PUBLISH_BREAKER_NAME, breaker_config),
            timeout,
        }
    }

    async fn send(&self, message: SinkMessage) -> Result<(), EngineError> {
        let timeout = self.timeout;
        let sink = &self.sink;
        self.breaker
            .execute(|| async move {
                match tokio::time::timeout(timeout, sink.publish(message)).await {
                    Ok(result) => result,
                    Err(_) => Err(SinkError::Timeout(timeout.as_millis() as u64)),
                }
            })
            .await
            .map_err(EngineError::from)
    }

    /// Publish a single finished rate.
    pub async fn publish_rate(&self, rate: Rate) -> bool {
        let symbol = rate.symbol().to_string();
        match self.send(SinkMessage::Rate(rate)).await {
            Ok(()) => {
                debug!(symbol = %symbol, "Rate published");
                true
            }
            Err(e) => {
                warn!(symbol = %symbol, error = %e, "Rate publish dropped");
                false
            }
        }
    }

    /// Publish a run's batch.
    pub async fn publish_batch(&self, batch: RateBatch) -> bool {
        let pipeline_id = batch.pipeline_id.clone();
        let rates = batch.rate_count();
        match self.send(SinkMessage::Batch(batch)).await {
            Ok(()) => {
                debug!(pipeline_id = %pipeline_id, rates, "Batch published");
                true
            }
            Err(e) => {
                warn!(pipeline_id = %pipeline_id, error = %e, "Batch publish dropped");
                false
            }
        }
    }

    pub fn breaker_metrics(&self) -> CircuitMetrics {
        self.breaker.metrics()
    }
}
