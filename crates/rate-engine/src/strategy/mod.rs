//! Calculation strategies and their registry.

mod average;
mod cross;
mod registry;
mod traits;

pub use average::{AverageStrategy, WeightedAverageStrategy};
pub use cross::{CrossOperation, CrossStrategy};
pub use registry::{BoundStrategies, StrategyLookup, StrategyRegistry};
pub use traits::{is_consistent, round_price, CalculationStrategy, RateInputs};
