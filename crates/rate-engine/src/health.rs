//! Engine health aggregate.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::ingest::{ConnectionState, ProviderStatus};
use crate::lifecycle::LifecycleState;
use crate::pipeline::RunCounters;
use crate::resilience::{CircuitMetrics, CircuitState};

// =============================================================================
// Status
// =============================================================================

/// Overall engine status.
///
/// Ordered from best to worst: Healthy < Degraded < Down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Down,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "HEALTHY",
            HealthStatus::Degraded => "DEGRADED",
            HealthStatus::Down => "DOWN",
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// =============================================================================
// Report
// =============================================================================

/// Point-in-time view of the engine, serialized for the daemon's status output.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: HealthStatus,
    pub lifecycle: LifecycleState,
    pub cache_available: bool,
    pub breakers: Vec<CircuitMetrics>,
    /// Outputs waiting on calculated inputs.
    pub pending: Vec<String>,
    pub open_windows: usize,
    pub runs: RunCounters,
    pub providers: BTreeMap<String, ProviderStatus>,
    pub checked_at: DateTime<Utc>,
}

impl HealthReport {
    /// Down unless running; degraded when the cache is unreachable, a
    /// breaker is not closed, or a known provider is disconnected.
    pub fn derive_status(
        lifecycle: LifecycleState,
        cache_available: bool,
        breakers: &[CircuitMetrics],
        providers: &BTreeMap<String, ProviderStatus>,
    ) -> HealthStatus {
        if lifecycle != LifecycleState::Running {
            return HealthStatus::Down;
        }
        let breaker_tripped = breakers.iter().any(|b| b.state != CircuitState::Closed);
        let provider_down = providers
            .values()
            .any(|p| p.state == ConnectionState::Disconnected);
        if !cache_available || breaker_tripped || provider_down {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}
