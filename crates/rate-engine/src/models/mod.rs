//! Core data types for the rate engine.

mod rate;
mod rule;
pub mod symbol;

pub use rate::{DerivedRate, InputRate, Rate, RateKind, RawRate};
pub use rule::{CalculationRule, RuleKind, DEFAULT_SCALE};
