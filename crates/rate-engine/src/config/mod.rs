//! Engine settings.
//!
//! Loaded from a camelCase JSON file. Every section has defaults, so a
//! minimal file only lists instruments and rules:
//!
//! ```json
//! {
//!   "window": { "skewToleranceMs": 3000, "instruments": { "USDTRY": ["PF1", "PF2"] } },
//!   "rules": [
//!     { "outputSymbol": "USDTRY_AVG", "kind": "AVG", "strategyId": "AVERAGE",
//!       "dependsOnRaw": ["PF1_USDTRY", "PF2_USDTRY"], "priority": 1 }
//!   ]
//! }
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::cache::CacheSettings;
use crate::errors::EngineError;
use crate::models::symbol::{base_instrument, split_raw_key};
use crate::models::CalculationRule;
use crate::resilience::CircuitBreakerConfig;
use crate::rules::RuleSet;
use crate::strategy::StrategyLookup;
use crate::validation::ValidatorConfig;
use crate::window::WindowSettings;

/// Staleness must be at least this multiple of the skew tolerance.
pub const STALENESS_MARGIN_FACTOR: u64 = 2;

/// Upper bound for cache TTLs (30 days).
pub const MAX_CACHE_TTL_SECS: u64 = 30 * 24 * 60 * 60;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WindowSection {
    pub skew_tolerance_ms: u64,
    pub staleness_threshold_ms: u64,
    pub sweep_interval_ms: u64,
    /// Base instrument → expected providers.
    pub instruments: BTreeMap<String, Vec<String>>,
}

impl Default for WindowSection {
    fn default() -> Self {
        Self {
            skew_tolerance_ms: 3_000,
            staleness_threshold_ms: 30_000,
            sweep_interval_ms: 10_000,
            instruments: BTreeMap::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheSection {
    pub raw_ttl_secs: u64,
    pub calculated_ttl_secs: u64,
    pub operation_timeout_ms: u64,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            raw_ttl_secs: 3_600,
            calculated_ttl_secs: 1_800,
            operation_timeout_ms: 250,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BreakerSection {
    pub failure_threshold: u32,
    pub recovery_timeout_ms: u64,
    pub half_open_success_threshold: u32,
}

impl Default for BreakerSection {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_ms: 30_000,
            half_open_success_threshold: 2,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PipelineSection {
    /// Upper bound on concurrently running ticks.
    pub max_concurrency: usize,
    pub publish_timeout_ms: u64,
    pub pending_sweep_interval_ms: u64,
    /// Capacity of the feed event channel.
    pub ingest_buffer: usize,
    pub strategy_lookup: StrategyLookup,
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            max_concurrency: 64,
            publish_timeout_ms: 500,
            pending_sweep_interval_ms: 5_000,
            ingest_buffer: 10_000,
            strategy_lookup: StrategyLookup::IdThenKind,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ValidationSection {
    pub min_price: Decimal,
    pub max_price: Option<Decimal>,
    pub max_spread_ratio: Option<Decimal>,
    pub max_future_drift_ms: u64,
    pub max_age_ms: u64,
}

impl Default for ValidationSection {
    fn default() -> Self {
        let defaults = ValidatorConfig::default();
        Self {
            min_price: defaults.min_price,
            max_price: defaults.max_price,
            max_spread_ratio: defaults.max_spread_ratio,
            max_future_drift_ms: defaults.max_future_drift.as_millis() as u64,
            max_age_ms: defaults.max_age.as_millis() as u64,
        }
    }
}

/// Complete engine configuration.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineSettings {
    pub window: WindowSection,
    pub cache: CacheSection,
    pub circuit_breaker: BreakerSection,
    pub pipeline: PipelineSection,
    pub validation: ValidationSection,
    /// Inline rules.
    pub rules: Vec<CalculationRule>,
    /// Extra rule file, relative to the settings file.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rules_path: Option<PathBuf>,
}

impl EngineSettings {
    pub fn from_json_str(json: &str) -> Result<Self, EngineError> {
        let settings: Self = serde_json::from_str(json)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load a settings file. A relative `rulesPath` is resolved against the
    /// file's directory.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let path = path.as_ref();
        let mut settings = Self::from_json_str(&std::fs::read_to_string(path)?)?;
        if let Some(rules_path) = settings.rules_path.take() {
            let resolved = if rules_path.is_relative() {
                path.parent()
                    .map(|dir| dir.join(&rules_path))
                    .unwrap_or(rules_path)
            } else {
                rules_path
            };
            settings.rules_path = Some(resolved);
        }
        info!(path = %path.display(), "Loaded engine settings");
        Ok(settings)
    }

    /// Check value ranges and cross-field constraints.
    pub fn validate(&self) -> Result<(), EngineError> {
        let w = &self.window;
        if w.skew_tolerance_ms == 0 {
            return Err(config_error("window.skewToleranceMs must be positive"));
        }
        if w.staleness_threshold_ms < w.skew_tolerance_ms.saturating_mul(STALENESS_MARGIN_FACTOR) {
            return Err(EngineError::Configuration(format!(
                "window.stalenessThresholdMs ({}) must be at least {}x skewToleranceMs ({})",
                w.staleness_threshold_ms, STALENESS_MARGIN_FACTOR, w.skew_tolerance_ms
            )));
        }
        if w.sweep_interval_ms == 0 {
            return Err(config_error("window.sweepIntervalMs must be positive"));
        }
        if w.sweep_interval_ms > w.staleness_threshold_ms {
            return Err(EngineError::Configuration(format!(
                "window.sweepIntervalMs ({}) must not exceed stalenessThresholdMs ({})",
                w.sweep_interval_ms, w.staleness_threshold_ms
            )));
        }
        for (instrument, providers) in &w.instruments {
            if providers.iter().all(|p| p.trim().is_empty()) {
                return Err(EngineError::Configuration(format!(
                    "window.instruments.{} lists no providers",
                    instrument
                )));
            }
        }

        let c = &self.cache;
        if c.operation_timeout_ms == 0 {
            return Err(config_error("cache.operationTimeoutMs must be positive"));
        }
        for (name, ttl) in [
            ("cache.rawTtlSecs", c.raw_ttl_secs),
            ("cache.calculatedTtlSecs", c.calculated_ttl_secs),
        ] {
            if ttl == 0 || ttl > MAX_CACHE_TTL_SECS {
                return Err(EngineError::Configuration(format!(
                    "{} must be between 1 and {} (got {})",
                    name, MAX_CACHE_TTL_SECS, ttl
                )));
            }
        }

        let b = &self.circuit_breaker;
        if b.failure_threshold == 0 || b.half_open_success_threshold == 0 {
            return Err(config_error("circuitBreaker thresholds must be positive"));
        }

        let p = &self.pipeline;
        if p.max_concurrency == 0 || p.ingest_buffer == 0 {
            return Err(config_error(
                "pipeline.maxConcurrency and pipeline.ingestBuffer must be positive",
            ));
        }
        if p.publish_timeout_ms == 0 || p.pending_sweep_interval_ms == 0 {
            return Err(config_error(
                "pipeline.publishTimeoutMs and pipeline.pendingSweepIntervalMs must be positive",
            ));
        }
        Ok(())
    }

    /// Inline rules followed by the rules in `rulesPath`.
    pub fn rule_set(&self) -> Result<RuleSet, EngineError> {
        let mut rules = self.rules.clone();
        if let Some(path) = &self.rules_path {
            let content = std::fs::read_to_string(path)?;
            let from_file: Vec<CalculationRule> = serde_json::from_str(&content)?;
            rules.extend(from_file);
        }
        RuleSet::new(rules)
    }

    /// Every raw dependency must name a configured instrument and provider,
    /// otherwise its window could never complete.
    pub fn check_rule_coverage(&self, rules: &RuleSet) -> Result<(), EngineError> {
        let expected = self.expected_providers();
        for rule in rules.rules() {
            for key in &rule.depends_on_raw {
                let covered = split_raw_key(key)
                    .and_then(|(provider, instrument)| {
                        expected.get(&instrument).map(|set| set.contains(&provider))
                    })
                    .unwrap_or(false);
                if !covered {
                    return Err(EngineError::Configuration(format!(
                        "Rule '{}' depends on '{}' but no window lists that provider and instrument",
                        rule.output_symbol, key
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn expected_providers(&self) -> HashMap<String, BTreeSet<String>> {
        self.window
            .instruments
            .iter()
            .map(|(instrument, providers)| {
                let providers = providers
                    .iter()
                    .map(|p| p.trim().to_string())
                    .filter(|p| !p.is_empty())
                    .collect();
                (base_instrument(instrument), providers)
            })
            .collect()
    }

    pub fn window_settings(&self) -> WindowSettings {
        WindowSettings {
            expected_providers: self.expected_providers(),
            skew_tolerance: Duration::from_millis(self.window.skew_tolerance_ms),
            staleness_threshold: Duration::from_millis(self.window.staleness_threshold_ms),
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.window.sweep_interval_ms)
    }

    pub fn cache_settings(&self) -> CacheSettings {
        CacheSettings {
            raw_ttl: Duration::from_secs(self.cache.raw_ttl_secs),
            calculated_ttl: Duration::from_secs(self.cache.calculated_ttl_secs),
            operation_timeout: Duration::from_millis(self.cache.operation_timeout_ms),
        }
    }

    pub fn breaker_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.circuit_breaker.failure_threshold,
            recovery_timeout: Duration::from_millis(self.circuit_breaker.recovery_timeout_ms),
            half_open_success_threshold: self.circuit_breaker.half_open_success_threshold,
        }
    }

    pub fn validator_config(&self) -> ValidatorConfig {
        ValidatorConfig {
            min_price: self.validation.min_price,
            max_price: self.validation.max_price,
            max_spread_ratio: self.validation.max_spread_ratio,
            max_future_drift: Duration::from_millis(self.validation.max_future_drift_ms),
            max_age: Duration::from_millis(self.validation.max_age_ms),
        }
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.pipeline.publish_timeout_ms)
    }

    pub fn pending_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.pipeline.pending_sweep_interval_ms)
    }
}

fn config_error(message: &str) -> EngineError {
    EngineError::Configuration(message.to_string())
}
