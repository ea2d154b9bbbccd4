//! Per-tick pipeline: context, stages and executor.

mod context;
mod executor;
mod stages;

pub use context::{ExecutionContext, StageTiming};
pub use executor::{PipelineExecutor, RunCounters, RunOutcome};
pub use stages::{AssemblyStage, ChainStage, IngestStage, PipelineStage, WindowStage};
