//! Background maintenance tasks.
//!
//! Both loops tick on a fixed interval and exit once the lifecycle leaves
//! `Running`.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

use crate::cache::InMemoryBackend;
use crate::chain::ChainResolver;
use crate::lifecycle::LifecycleHandle;
use crate::window::WindowSynchronizer;

/// Evicts stale window entries. Also purges expired keys when the cache runs
/// on the in-memory backend.
pub fn spawn_window_sweeper(
    windows: Arc<WindowSynchronizer>,
    memory_backend: Option<Arc<InMemoryBackend>>,
    every: Duration,
    mut lifecycle: LifecycleHandle,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(interval_ms = every.as_millis() as u64, "Window sweeper started");
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let stats = windows.sweep();
                    let purged = memory_backend.as_ref().map(|b| b.purge_expired()).unwrap_or(0);
                    if stats.evicted_rates > 0 || purged > 0 {
                        debug!(
                            evicted = stats.evicted_rates,
                            dropped_windows = stats.dropped_windows,
                            purged_keys = purged,
                            "Sweep completed"
                        );
                    }
                }
                _ = lifecycle.stopping() => break,
            }
        }
        info!("Window sweeper stopped");
    })
}

/// Retries pending outputs against the cache.
pub fn spawn_pending_sweep(
    resolver: Arc<ChainResolver>,
    every: Duration,
    mut lifecycle: LifecycleHandle,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(interval_ms = every.as_millis() as u64, "Pending sweep started");
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if resolver.pending().is_empty() {
                        continue;
                    }
                    let produced = resolver.resolve_all_pending().await;
                    if !produced.is_empty() {
                        info!(count = produced.len(), "Pending outputs resolved");
                    }
                }
                _ = lifecycle.stopping() => break,
            }
        }
        info!("Pending sweep stopped");
    })
}
