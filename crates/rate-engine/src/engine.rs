//! Engine assembly and lifecycle.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use futures::future::join_all;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::cache::{CacheBackend, InMemoryBackend, RateCache};
use crate::chain::{ChainResolver, PendingSet};
use crate::config::EngineSettings;
use crate::emit::{Publisher, RateSink};
use crate::errors::EngineError;
use crate::health::HealthReport;
use crate::ingest::{FeedEvent, Ingestor, ProviderTracker};
use crate::lifecycle::{Lifecycle, LifecycleHandle, LifecycleState};
use crate::models::RawRate;
use crate::pipeline::{
    AssemblyStage, ChainStage, IngestStage, PipelineExecutor, PipelineStage, RunOutcome,
    WindowStage,
};
use crate::rules::DependencyGraph;
use crate::scheduler::{spawn_pending_sweep, spawn_window_sweeper};
use crate::strategy::StrategyRegistry;
use crate::validation::RateValidator;
use crate::window::WindowSynchronizer;

/// The assembled rate engine.
///
/// Built once from [`EngineSettings`]; any configuration problem (invalid
/// values, unresolvable strategy, dependency cycle) fails [`build`](Self::build).
pub struct RateEngine {
    settings: EngineSettings,
    lifecycle: Lifecycle,
    cache: Arc<RateCache>,
    memory_backend: Option<Arc<InMemoryBackend>>,
    windows: Arc<WindowSynchronizer>,
    resolver: Arc<ChainResolver>,
    publisher: Arc<Publisher>,
    executor: Arc<PipelineExecutor>,
    providers: Arc<ProviderTracker>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RateEngine {
    /// Build with the built-in strategies.
    pub fn build(
        settings: EngineSettings,
        backend: Arc<dyn CacheBackend>,
        sink: Arc<dyn RateSink>,
    ) -> Result<Self, EngineError> {
        let registry = StrategyRegistry::builtin(settings.pipeline.strategy_lookup);
        Self::assemble(settings, registry, backend, None, sink)
    }

    /// Build on a fresh in-memory cache, purged by the window sweeper.
    pub fn in_memory(settings: EngineSettings, sink: Arc<dyn RateSink>) -> Result<Self, EngineError> {
        let backend = Arc::new(InMemoryBackend::new());
        let registry = StrategyRegistry::builtin(settings.pipeline.strategy_lookup);
        Self::assemble(
            settings,
            registry,
            Arc::clone(&backend) as Arc<dyn CacheBackend>,
            Some(backend),
            sink,
        )
    }

    /// Build with a caller-supplied strategy registry.
    pub fn with_registry(
        settings: EngineSettings,
        registry: StrategyRegistry,
        backend: Arc<dyn CacheBackend>,
        sink: Arc<dyn RateSink>,
    ) -> Result<Self, EngineError> {
        Self::assemble(settings, registry, backend, None, sink)
    }

    fn assemble(
        settings: EngineSettings,
        registry: StrategyRegistry,
        backend: Arc<dyn CacheBackend>,
        memory_backend: Option<Arc<InMemoryBackend>>,
        sink: Arc<dyn RateSink>,
    ) -> Result<Self, EngineError> {
        settings.validate()?;
        let rules = settings.rule_set()?;
        settings.check_rule_coverage(&rules)?;
        let graph = Arc::new(DependencyGraph::build(&rules)?);
        let strategies = Arc::new(registry.bind(rules.rules())?);

        let breaker_config = settings.breaker_config();
        let cache = Arc::new(RateCache::new(
            backend,
            settings.cache_settings(),
            breaker_config.clone(),
        ));
        let publisher = Arc::new(Publisher::new(
            sink,
            settings.publish_timeout(),
            breaker_config,
        ));
        let resolver = Arc::new(ChainResolver::new(
            graph,
            strategies,
            Arc::clone(&cache),
            Arc::new(PendingSet::new()),
            Arc::clone(&publisher),
        ));
        let windows = Arc::new(WindowSynchronizer::new(settings.window_settings()));
        let validator = Arc::new(RateValidator::with_config(settings.validator_config()));

        let stages: Vec<Arc<dyn PipelineStage>> = vec![
            Arc::new(IngestStage::new(validator, Arc::clone(&cache))),
            Arc::new(WindowStage::new(Arc::clone(&windows), Arc::clone(&resolver))),
            Arc::new(ChainStage::new(Arc::clone(&resolver))),
            Arc::new(AssemblyStage::new(
                Arc::clone(&windows),
                Arc::clone(&cache),
                Arc::clone(&publisher),
            )),
        ];
        let executor = Arc::new(PipelineExecutor::new(
            stages,
            settings.pipeline.max_concurrency,
        ));

        info!(
            rules = rules.len(),
            instruments = settings.window.instruments.len(),
            strategies = ?registry.ids(),
            lookup = ?registry.lookup(),
            "Rate engine built"
        );

        Ok(Self {
            settings,
            lifecycle: Lifecycle::new(),
            cache,
            memory_backend,
            windows,
            resolver,
            publisher,
            executor,
            providers: Arc::new(ProviderTracker::new()),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn lifecycle(&self) -> LifecycleHandle {
        self.lifecycle.handle()
    }

    pub fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    /// Start background tasks and the ingest loop.
    ///
    /// Returns the sender providers push [`FeedEvent`]s into.
    pub async fn start(&self) -> Result<mpsc::Sender<FeedEvent>, EngineError> {
        self.lifecycle.transition(LifecycleState::Starting)?;

        if !self.cache.is_available().await {
            warn!("Cache backend unavailable at start, running degraded");
        }

        let (tx, rx) = mpsc::channel(self.settings.pipeline.ingest_buffer);
        let ingestor = Ingestor::new(Arc::clone(&self.executor), Arc::clone(&self.providers));
        let handles = vec![
            tokio::spawn(ingestor.run(rx, self.lifecycle.handle())),
            spawn_window_sweeper(
                Arc::clone(&self.windows),
                self.memory_backend.clone(),
                self.settings.sweep_interval(),
                self.lifecycle.handle(),
            ),
            spawn_pending_sweep(
                Arc::clone(&self.resolver),
                self.settings.pending_sweep_interval(),
                self.lifecycle.handle(),
            ),
        ];
        self.lock_tasks().extend(handles);

        self.lifecycle.transition(LifecycleState::Running)?;
        info!("Rate engine running");
        Ok(tx)
    }

    /// Stop background tasks and wait for in-flight runs to finish.
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        self.lifecycle.transition(LifecycleState::Stopping)?;

        let handles: Vec<JoinHandle<()>> = self.lock_tasks().drain(..).collect();
        for result in join_all(handles).await {
            if let Err(e) = result {
                warn!(error = %e, "Background task ended abnormally");
            }
        }
        self.executor.drain().await;

        self.lifecycle.transition(LifecycleState::Stopped)?;
        info!(runs = ?self.executor.counters(), "Rate engine stopped");
        Ok(())
    }

    /// Run one tick through the pipeline on the caller's task.
    pub async fn process_tick(&self, rate: RawRate) -> RunOutcome {
        self.executor.process_tick(rate).await
    }

    /// Retry every pending output now.
    pub async fn resolve_pending(&self) -> usize {
        self.resolver.resolve_all_pending().await.len()
    }

    pub async fn health(&self) -> HealthReport {
        let lifecycle = self.lifecycle.state();
        let cache_available = self.cache.is_available().await;
        let breakers = vec![self.cache.breaker_metrics(), self.publisher.breaker_metrics()];
        let providers = self.providers.snapshot();

        HealthReport {
            status: HealthReport::derive_status(lifecycle, cache_available, &breakers, &providers),
            lifecycle,
            cache_available,
            breakers,
            pending: self.resolver.pending().snapshot(),
            open_windows: self.windows.window_count(),
            runs: self.executor.counters(),
            providers,
            checked_at: Utc::now(),
        }
    }

    fn lock_tasks(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }
}
