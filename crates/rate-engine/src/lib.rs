//! Ratefeed Engine Crate
//!
//! Derives calculated FX rates from raw provider ticks.
//!
//! # Overview
//!
//! The engine supports:
//! - Time-synchronized per-instrument windows across providers
//! - Rule-driven derivation (averages, crosses, crosses of crosses)
//! - Pluggable calculation strategies, selected by id or by kind
//! - Breaker-guarded caching and publishing
//!
//! # Architecture
//!
//! ```text
//!  FeedEvent ──▶ +----------------+
//!  (channel)     |    Ingestor    |  (connectivity tracking)
//!                +----------------+
//!                        |  Tick
//!                        v
//!                +------------------+
//!                | PipelineExecutor |  (one run per tick, bounded)
//!                +------------------+
//!                        |
//!     ingest ──▶ window ──▶ chain ──▶ assembly
//!       |          |          |          |
//!       v          v          v          v
//!   RateCache  WindowSync  ChainResolver Publisher ──▶ RateSink
//!                             |
//!                      DependencyGraph + StrategyRegistry
//! ```
//!
//! # Core Types
//!
//! - [`RateEngine`] - Assembled engine with lifecycle and health
//! - [`EngineSettings`] - JSON settings with defaults per section
//! - [`RawRate`] / [`DerivedRate`] - Provider ticks and calculated rates
//! - [`CalculationRule`] - One configured derivation
//! - [`CalculationStrategy`] - Pluggable calculation
//! - [`FeedEvent`] - Everything a provider can report
//! - [`RateSink`] - Downstream publication boundary

pub mod cache;
pub mod chain;
pub mod config;
pub mod emit;
pub mod engine;
pub mod errors;
pub mod health;
pub mod ingest;
pub mod lifecycle;
pub mod models;
pub mod pipeline;
pub mod resilience;
pub mod rules;
pub mod scheduler;
pub mod strategy;
pub mod validation;
pub mod window;

pub use cache::{CacheBackend, CacheSettings, InMemoryBackend, RateCache};
pub use chain::{ChainResolver, PendingSet, Resolution};
pub use config::EngineSettings;
pub use emit::{ChannelSink, MockRateSink, NoOpRateSink, Publisher, RateBatch, RateSink, SinkMessage};
pub use engine::RateEngine;
pub use errors::{BackendError, EngineError, ErrorClass, SinkError};
pub use health::{HealthReport, HealthStatus};
pub use ingest::{ConnectionState, FeedEvent, ProviderStatus};
pub use lifecycle::{LifecycleHandle, LifecycleState};
pub use models::{CalculationRule, DerivedRate, Rate, RateKind, RawRate, RuleKind};
pub use pipeline::{PipelineExecutor, RunCounters, RunOutcome};
pub use resilience::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use rules::{DependencyGraph, RuleSet};
pub use strategy::{CalculationStrategy, RateInputs, StrategyLookup, StrategyRegistry};
pub use validation::RateValidator;
pub use window::{CompletedWindow, WindowSettings, WindowSynchronizer};
