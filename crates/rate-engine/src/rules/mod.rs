//! Calculation rules and their dependency graph.

mod graph;
mod rule_set;

pub use graph::DependencyGraph;
pub use rule_set::RuleSet;
