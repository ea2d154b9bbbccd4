//! Runs the stage sequence once per raw rate.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::context::ExecutionContext;
use super::stages::{timed, PipelineStage};
use crate::errors::EngineError;
use crate::models::RawRate;

/// How a single run ended.
#[derive(Clone, Debug, PartialEq)]
pub enum RunOutcome {
    Succeeded {
        pipeline_id: String,
        /// Symbols calculated during the run.
        derived: Vec<String>,
        elapsed: Duration,
    },
    Failed {
        pipeline_id: String,
        stage: &'static str,
        error: String,
        elapsed: Duration,
    },
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded { .. })
    }

    pub fn pipeline_id(&self) -> &str {
        match self {
            Self::Succeeded { pipeline_id, .. } | Self::Failed { pipeline_id, .. } => pipeline_id,
        }
    }
}

/// Succeeded / failed run totals since start.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunCounters {
    pub succeeded: u64,
    pub failed: u64,
}

/// Executes the ordered stages for each tick, with a bound on concurrent runs.
pub struct PipelineExecutor {
    stages: Vec<Arc<dyn PipelineStage>>,
    permits: Arc<Semaphore>,
    max_concurrency: usize,
    succeeded: AtomicU64,
    failed: AtomicU64,
}

impl PipelineExecutor {
    pub fn new(stages: Vec<Arc<dyn PipelineStage>>, max_concurrency: usize) -> Self {
        Self {
            stages,
            permits: Arc::new(Semaphore::new(max_concurrency.max(1))),
            max_concurrency: max_concurrency.max(1),
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|stage| stage.name()).collect()
    }

    /// Run every stage for `rate` in order.
    ///
    /// The first stage error ends the run; later stages (assembly included)
    /// are skipped so nothing from a failed run reaches the sink. A panicking
    /// stage is caught and counted as a stage error.
    pub async fn process_tick(&self, rate: RawRate) -> RunOutcome {
        let mut ctx = ExecutionContext::new(rate);
        debug!(pipeline_id = %ctx.pipeline_id, provider = %ctx.trigger.provider, "Run started");

        for stage in &self.stages {
            let result = AssertUnwindSafe(timed(stage.as_ref(), &mut ctx))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| {
                    Err(EngineError::Stage {
                        stage: stage.name(),
                        message: format!("panicked: {}", panic_message(panic.as_ref())),
                    })
                });
            if let Err(e) = result {
                self.failed.fetch_add(1, Ordering::Relaxed);
                let elapsed = ctx.elapsed();
                warn!(
                    pipeline_id = %ctx.pipeline_id,
                    stage = stage.name(),
                    class = ?e.class(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    error = %e,
                    "Run failed"
                );
                return RunOutcome::Failed {
                    pipeline_id: ctx.pipeline_id,
                    stage: stage.name(),
                    error: e.to_string(),
                    elapsed,
                };
            }
        }

        self.succeeded.fetch_add(1, Ordering::Relaxed);
        let elapsed = ctx.elapsed();
        debug!(
            pipeline_id = %ctx.pipeline_id,
            derived = ctx.derived.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            stages = ?ctx.timings,
            "Run completed"
        );
        RunOutcome::Succeeded {
            derived: ctx.derived_symbols(),
            pipeline_id: ctx.pipeline_id,
            elapsed,
        }
    }

    /// Schedule `process_tick` on the runtime.
    ///
    /// Waits for a free slot first, so a saturated executor pushes back on
    /// the caller. Fails once the executor is closed.
    pub async fn submit(self: &Arc<Self>, rate: RawRate) -> Result<JoinHandle<RunOutcome>, EngineError> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| EngineError::Stage {
                stage: "submit",
                message: "executor is closed".to_string(),
            })?;

        let executor = Arc::clone(self);
        Ok(tokio::spawn(async move {
            let _permit = permit;
            executor.process_tick(rate).await
        }))
    }

    /// Wait until every in-flight run has finished.
    pub async fn drain(&self) {
        let slots = u32::try_from(self.max_concurrency).unwrap_or(u32::MAX);
        // Fails only when closed, and then there is nothing left to wait for
        if let Ok(all) = self.permits.acquire_many(slots).await {
            drop(all);
        }
    }

    /// Refuse further submissions. Runs already in flight finish normally.
    pub fn close(&self) {
        if !self.permits.is_closed() {
            self.permits.close();
            info!("Pipeline executor closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.permits.is_closed()
    }

    pub fn counters(&self) -> RunCounters {
        RunCounters {
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheSettings, InMemoryBackend, RateCache};
    use crate::chain::{ChainResolver, PendingSet};
    use crate::emit::{MockRateSink, Publisher, SinkMessage};
    use crate::models::{CalculationRule, RuleKind};
    use crate::pipeline::{AssemblyStage, ChainStage, IngestStage, WindowStage};
    use crate::resilience::CircuitBreakerConfig;
    use crate::rules::{DependencyGraph, RuleSet};
    use crate::strategy::{StrategyLookup, StrategyRegistry};
    use crate::validation::RateValidator;
    use crate::window::{WindowSettings, WindowSynchronizer};
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, Utc};
    use rust_decimal_macros::dec;
    use std::collections::{BTreeSet, HashMap};

    fn executor(sink: &MockRateSink, extra: Option<Arc<dyn PipelineStage>>) -> PipelineExecutor {
        let rules = RuleSet::new(vec![CalculationRule::new("USDTRY_AVG", RuleKind::Avg, "AVERAGE")
            .with_raw(["PF1_USDTRY", "PF2_USDTRY"])])
        .unwrap();
        let graph = Arc::new(DependencyGraph::build(&rules).unwrap());
        let strategies = Arc::new(
            StrategyRegistry::builtin(StrategyLookup::IdThenKind)
                .bind(rules.rules())
                .unwrap(),
        );
        let cache = Arc::new(RateCache::new(
            Arc::new(InMemoryBackend::new()),
            CacheSettings::default(),
            CircuitBreakerConfig::default(),
        ));
        let publisher = Arc::new(Publisher::new(
            Arc::new(sink.clone()),
            Duration::from_secs(1),
            CircuitBreakerConfig::default(),
        ));
        let resolver = Arc::new(ChainResolver::new(
            graph,
            strategies,
            Arc::clone(&cache),
            Arc::new(PendingSet::new()),
            Arc::clone(&publisher),
        ));
        let windows = Arc::new(WindowSynchronizer::new(WindowSettings {
            expected_providers: HashMap::from([(
                "USDTRY".to_string(),
                BTreeSet::from(["PF1".to_string(), "PF2".to_string()]),
            )]),
            ..WindowSettings::default()
        }));

        let mut stages: Vec<Arc<dyn PipelineStage>> = vec![
            Arc::new(IngestStage::new(Arc::new(RateValidator::new()), Arc::clone(&cache))),
            Arc::new(WindowStage::new(Arc::clone(&windows), Arc::clone(&resolver))),
            Arc::new(ChainStage::new(resolver)),
        ];
        if let Some(stage) = extra {
            stages.push(stage);
        }
        stages.push(Arc::new(AssemblyStage::new(windows, cache, publisher)));
        PipelineExecutor::new(stages, 4)
    }

    struct FailingStage;

    #[async_trait]
    impl PipelineStage for FailingStage {
        fn name(&self) -> &'static str {
            "failing"
        }

        async fn execute(&self, _ctx: &mut ExecutionContext) -> Result<(), EngineError> {
            Err(EngineError::Stage {
                stage: "failing",
                message: "boom".to_string(),
            })
        }
    }

    struct PanickingStage;

    #[async_trait]
    impl PipelineStage for PanickingStage {
        fn name(&self) -> &'static str {
            "panicking"
        }

        async fn execute(&self, _ctx: &mut ExecutionContext) -> Result<(), EngineError> {
            panic!("overflow when adding duration to instant");
        }
    }

    #[tokio::test]
    async fn test_pair_produces_average_and_batch() {
        let sink = MockRateSink::new();
        let executor = executor(&sink, None);
        let now = Utc::now();

        let first = executor
            .process_tick(RawRate::new("PF1", "PF1_USDTRY", dec!(34.00), dec!(34.10), now))
            .await;
        assert!(first.is_success());
        assert!(sink.calculated("USDTRY_AVG").is_empty());

        let second = executor
            .process_tick(RawRate::new(
                "PF2",
                "PF2_USDTRY",
                dec!(34.20),
                dec!(34.30),
                now + ChronoDuration::milliseconds(500),
            ))
            .await;
        match &second {
            RunOutcome::Succeeded { derived, .. } => assert_eq!(derived, &vec!["USDTRY_AVG".to_string()]),
            other => panic!("unexpected outcome {:?}", other),
        }

        let avg = sink.calculated("USDTRY_AVG");
        assert_eq!(avg.len(), 1);
        assert_eq!(avg[0].bid, dec!(34.1));
        assert_eq!(avg[0].ask, dec!(34.2));

        let batches = sink.batches();
        assert_eq!(batches.len(), 2);
        let last = &batches[1];
        assert_eq!(last.pipeline_id, second.pipeline_id());
        assert_eq!(last.peers.len(), 1);
        assert_eq!(last.peers[0].provider, "PF1");
        assert_eq!(last.derived.len(), 1);
        assert_eq!(executor.counters(), RunCounters { succeeded: 2, failed: 0 });
    }

    #[tokio::test]
    async fn test_invalid_tick_fails_run_and_emits_nothing() {
        let sink = MockRateSink::new();
        let executor = executor(&sink, None);

        let outcome = executor
            .process_tick(RawRate::new("PF1", "PF1_USDTRY", dec!(34.5), dec!(34.1), Utc::now()))
            .await;

        match outcome {
            RunOutcome::Failed { stage, .. } => assert_eq!(stage, "ingest"),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(sink.is_empty());
        assert_eq!(executor.counters(), RunCounters { succeeded: 0, failed: 1 });
    }

    #[tokio::test]
    async fn test_stage_failure_skips_assembly() {
        let sink = MockRateSink::new();
        let executor = executor(&sink, Some(Arc::new(FailingStage)));

        let outcome = executor
            .process_tick(RawRate::new("PF1", "PF1_USDTRY", dec!(34.0), dec!(34.1), Utc::now()))
            .await;

        assert!(!outcome.is_success());
        assert!(sink.batches().is_empty());
        assert!(!sink
            .messages()
            .iter()
            .any(|m| matches!(m, SinkMessage::Rate(_))));

        // The next run is unaffected by the earlier failure
        let healthy = self::executor(&sink, None);
        assert!(healthy
            .process_tick(RawRate::new("PF1", "PF1_USDTRY", dec!(34.0), dec!(34.1), Utc::now()))
            .await
            .is_success());
    }

    #[tokio::test]
    async fn test_panicking_stage_counts_as_failed_run() {
        let sink = MockRateSink::new();
        let executor = Arc::new(executor(&sink, Some(Arc::new(PanickingStage))));

        let handle = executor
            .submit(RawRate::new("PF1", "PF1_USDTRY", dec!(34.0), dec!(34.1), Utc::now()))
            .await
            .unwrap();
        let outcome = handle.await.expect("panic must not escape the run");

        match outcome {
            RunOutcome::Failed { stage, error, .. } => {
                assert_eq!(stage, "panicking");
                assert!(error.contains("overflow when adding duration"));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(sink.batches().is_empty());
        assert_eq!(executor.counters(), RunCounters { succeeded: 0, failed: 1 });

        // The permit is released, so draining does not hang
        executor.drain().await;
    }

    #[tokio::test]
    async fn test_stage_order() {
        let sink = MockRateSink::new();
        let executor = executor(&sink, None);
        assert_eq!(executor.stage_names(), vec!["ingest", "window", "chain", "assembly"]);
    }

    #[tokio::test]
    async fn test_submit_runs_and_close_rejects() {
        let sink = MockRateSink::new();
        let executor = Arc::new(executor(&sink, None));

        let handle = executor
            .submit(RawRate::new("PF1", "PF1_USDTRY", dec!(34.0), dec!(34.1), Utc::now()))
            .await
            .unwrap();
        assert!(handle.await.unwrap().is_success());
        executor.drain().await;

        executor.close();
        assert!(executor.is_closed());
        let rejected = executor
            .submit(RawRate::new("PF2", "PF2_USDTRY", dec!(34.0), dec!(34.1), Utc::now()))
            .await;
        assert!(rejected.is_err());
        assert_eq!(executor.counters().succeeded, 1);
    }
}
