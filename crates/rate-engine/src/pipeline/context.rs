//! Per-run execution state.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{DerivedRate, RawRate};
use crate::window::CompletedWindow;

/// Wall-clock time spent in one stage.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StageTiming {
    pub stage: &'static str,
    pub elapsed: Duration,
}

/// State of a single pipeline run, created per incoming raw rate and
/// dropped when the run ends.
#[derive(Debug)]
pub struct ExecutionContext {
    /// `<symbol>-<uuid v7>`
    pub pipeline_id: String,
    pub trigger: RawRate,
    pub started_at: DateTime<Utc>,
    started: Instant,
    /// Set by the window stage when the trigger completed its window.
    pub completed_window: Option<CompletedWindow>,
    /// Rates calculated during this run, in production order.
    pub derived: Vec<DerivedRate>,
    pub timings: Vec<StageTiming>,
}

impl ExecutionContext {
    pub fn new(trigger: RawRate) -> Self {
        Self {
            pipeline_id: format!("{}-{}", trigger.symbol, Uuid::now_v7()),
            trigger,
            started_at: Utc::now(),
            started: Instant::now(),
            completed_window: None,
            derived: Vec::new(),
            timings: Vec::new(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn record_stage(&mut self, stage: &'static str, elapsed: Duration) {
        self.timings.push(StageTiming { stage, elapsed });
    }

    pub fn derived_symbols(&self) -> Vec<String> {
        self.derived.iter().map(|rate| rate.symbol.clone()).collect()
    }
}
