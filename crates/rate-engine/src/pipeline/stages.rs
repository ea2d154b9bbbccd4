//! The four pipeline stages.
//!
//! ```text
//!   ingest ──▶ window ──▶ chain ──▶ assembly
//!   validate   complete    propagate  batch +
//!   + cache    + average   crosses    publish
//! ```

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, warn};

use super::context::ExecutionContext;
use crate::cache::{RateCache, WriteOutcome};
use crate::chain::{ChainResolver, Resolution};
use crate::emit::{Publisher, RateBatch};
use crate::errors::EngineError;
use crate::models::{Rate, RawRate};
use crate::strategy::RateInputs;
use crate::validation::RateValidator;
use crate::window::WindowSynchronizer;

/// One step of a pipeline run.
#[async_trait]
pub trait PipelineStage: Send + Sync {
    fn name(&self) -> &'static str;

    /// Run against the context. An error fails the whole run.
    async fn execute(&self, ctx: &mut ExecutionContext) -> Result<(), EngineError>;
}

/// Runs `stage` and records its elapsed time on the context.
pub(crate) async fn timed(
    stage: &dyn PipelineStage,
    ctx: &mut ExecutionContext,
) -> Result<(), EngineError> {
    let started = Instant::now();
    let result = stage.execute(ctx).await;
    ctx.record_stage(stage.name(), started.elapsed());
    result
}

// =============================================================================
// Ingest
// =============================================================================

/// Validates the trigger and writes it to the cache.
pub struct IngestStage {
    validator: Arc<RateValidator>,
    cache: Arc<RateCache>,
}

impl IngestStage {
    pub fn new(validator: Arc<RateValidator>, cache: Arc<RateCache>) -> Self {
        Self { validator, cache }
    }
}

#[async_trait]
impl PipelineStage for IngestStage {
    fn name(&self) -> &'static str {
        "ingest"
    }

    async fn execute(&self, ctx: &mut ExecutionContext) -> Result<(), EngineError> {
        self.validator.validate(&ctx.trigger)?;

        if self.cache.put_raw(&ctx.trigger).await == WriteOutcome::Dropped {
            // Best effort; the window stage works from memory
            debug!(pipeline_id = %ctx.pipeline_id, "Raw rate not cached");
        }
        Ok(())
    }
}

// =============================================================================
// Window
// =============================================================================

/// Feeds the window synchronizer and, on completion, evaluates the rules
/// consuming the trigger's raw key with the window's rates as inputs.
pub struct WindowStage {
    windows: Arc<WindowSynchronizer>,
    resolver: Arc<ChainResolver>,
}

impl WindowStage {
    pub fn new(windows: Arc<WindowSynchronizer>, resolver: Arc<ChainResolver>) -> Self {
        Self { windows, resolver }
    }
}

#[async_trait]
impl PipelineStage for WindowStage {
    fn name(&self) -> &'static str {
        "window"
    }

    async fn execute(&self, ctx: &mut ExecutionContext) -> Result<(), EngineError> {
        let Some(completed) = self.windows.accept(&Rate::Raw(ctx.trigger.clone())) else {
            return Ok(());
        };

        let mut seeds = RateInputs::new();
        for rate in completed.rates.values() {
            seeds.insert(rate.raw_key(), Rate::Raw(rate.clone()));
        }

        let rules = self
            .resolver
            .graph()
            .rules_to_trigger(&ctx.trigger.raw_key(), true)
            .to_vec();
        for rule in rules {
            match self.resolver.evaluate(&rule, &seeds, &mut ctx.derived).await {
                Resolution::Computed(rate) => {
                    debug!(pipeline_id = %ctx.pipeline_id, output = %rate.symbol, "Window output calculated");
                }
                Resolution::NotComputable => {
                    warn!(
                        pipeline_id = %ctx.pipeline_id,
                        output = %rule.output_symbol,
                        "Window inputs inconsistent, output skipped"
                    );
                }
                _ => {}
            }
        }

        ctx.completed_window = Some(completed);
        Ok(())
    }
}

// =============================================================================
// Chain
// =============================================================================

/// Propagates every rate produced so far through the dependency graph.
pub struct ChainStage {
    resolver: Arc<ChainResolver>,
}

impl ChainStage {
    pub fn new(resolver: Arc<ChainResolver>) -> Self {
        Self { resolver }
    }
}

#[async_trait]
impl PipelineStage for ChainStage {
    fn name(&self) -> &'static str {
        "chain"
    }

    async fn execute(&self, ctx: &mut ExecutionContext) -> Result<(), EngineError> {
        for symbol in ctx.derived_symbols() {
            let count = self.resolver.propagate(&symbol, &mut ctx.derived).await;
            if count > 0 {
                debug!(pipeline_id = %ctx.pipeline_id, from = %symbol, count, "Chain propagated");
            }
        }
        Ok(())
    }
}

// =============================================================================
// Assembly
// =============================================================================

/// Publishes the trigger and the run's batch.
pub struct AssemblyStage {
    windows: Arc<WindowSynchronizer>,
    cache: Arc<RateCache>,
    publisher: Arc<Publisher>,
}

impl AssemblyStage {
    pub fn new(
        windows: Arc<WindowSynchronizer>,
        cache: Arc<RateCache>,
        publisher: Arc<Publisher>,
    ) -> Self {
        Self {
            windows,
            cache,
            publisher,
        }
    }

    /// Other providers' latest rates for the trigger's instrument, from the
    /// completed window if there is one, otherwise from the cache.
    async fn peers(&self, ctx: &ExecutionContext) -> Vec<RawRate> {
        let trigger = &ctx.trigger;
        if let Some(window) = &ctx.completed_window {
            return window
                .rates
                .values()
                .filter(|rate| rate.provider != trigger.provider)
                .cloned()
                .collect();
        }

        let instrument = trigger.instrument();
        let providers: Vec<String> = self
            .windows
            .expected_providers(&instrument)
            .map(|set| {
                set.iter()
                    .filter(|p| **p != trigger.provider)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        let mut peers = Vec::with_capacity(providers.len());
        for provider in providers {
            if let Some(rate) = self.cache.get_raw(&instrument, &provider).await {
                peers.push(rate);
            }
        }
        peers
    }
}

#[async_trait]
impl PipelineStage for AssemblyStage {
    fn name(&self) -> &'static str {
        "assembly"
    }

    async fn execute(&self, ctx: &mut ExecutionContext) -> Result<(), EngineError> {
        self.publisher
            .publish_rate(Rate::Raw(ctx.trigger.clone()))
            .await;

        let batch = RateBatch {
            pipeline_id: ctx.pipeline_id.clone(),
            trigger: ctx.trigger.clone(),
            peers: self.peers(ctx).await,
            derived: ctx.derived.clone(),
            assembled_at: Utc::now(),
        };
        self.publisher.publish_batch(batch).await;
        Ok(())
    }
}
