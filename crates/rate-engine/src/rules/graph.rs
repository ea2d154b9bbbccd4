//! Reverse dependency index over the rule set.
//!
//! ```text
//!  raw key            ─┐
//!  (PF1_USDTRY)        ├──▶ rules consuming it ──▶ output symbol ─┐
//!  calculated symbol  ─┘    (priority order)       (USDTRY_AVG)    │
//!        ▲                                                         │
//!        └─────────────────────────────────────────────────────────┘
//! ```
//!
//! Built once at startup and read-only afterwards, so lookups need no
//! locking. The build rejects any cycle among calculated outputs.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::warn;

use super::rule_set::RuleSet;
use crate::errors::EngineError;
use crate::models::symbol::{calculated_symbol, normalize_raw_key};
use crate::models::CalculationRule;

type RuleList = Vec<Arc<CalculationRule>>;

/// Maps input symbols to the rules that consume them.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    by_raw: HashMap<String, RuleList>,
    by_calculated: HashMap<String, RuleList>,
    by_output: HashMap<String, Arc<CalculationRule>>,
    ordered: RuleList,
}

impl DependencyGraph {
    /// Fan the rule set out into the reverse maps and verify it is acyclic.
    pub fn build(rules: &RuleSet) -> Result<Self, EngineError> {
        let mut graph = Self::default();

        // RuleSet is already priority ordered, so each list stays sorted
        for rule in rules.rules() {
            for key in &rule.depends_on_raw {
                graph
                    .by_raw
                    .entry(key.clone())
                    .or_default()
                    .push(Arc::clone(rule));
            }
            for symbol in &rule.depends_on_calculated {
                graph
                    .by_calculated
                    .entry(symbol.clone())
                    .or_default()
                    .push(Arc::clone(rule));
            }
            graph
                .by_output
                .insert(rule.output_symbol.clone(), Arc::clone(rule));
            graph.ordered.push(Arc::clone(rule));
        }

        graph.check_acyclic()?;

        for symbol in graph.by_calculated.keys() {
            if !graph.by_output.contains_key(symbol) {
                warn!(symbol = %symbol, "Calculated dependency has no producing rule");
            }
        }

        Ok(graph)
    }

    /// Rules that consume `symbol`, in ascending priority.
    ///
    /// `is_raw` selects the raw-key map; otherwise the calculated map is used.
    /// Unknown symbols yield an empty slice.
    pub fn rules_to_trigger(&self, symbol: &str, is_raw: bool) -> &[Arc<CalculationRule>] {
        let found = if is_raw {
            normalize_raw_key(symbol).and_then(|key| self.by_raw.get(&key))
        } else {
            self.by_calculated.get(&calculated_symbol(symbol))
        };
        found.map(Vec::as_slice).unwrap_or(&[])
    }

    /// The rule producing `output_symbol`.
    pub fn rule_for(&self, output_symbol: &str) -> Option<&Arc<CalculationRule>> {
        self.by_output.get(&calculated_symbol(output_symbol))
    }

    /// All rules in priority order.
    pub fn rules(&self) -> &[Arc<CalculationRule>] {
        &self.ordered
    }

    pub fn raw_keys(&self) -> impl Iterator<Item = &str> {
        self.by_raw.keys().map(String::as_str)
    }

    fn check_acyclic(&self) -> Result<(), EngineError> {
        let mut marks: HashMap<&str, Mark> = HashMap::new();
        let mut stack: Vec<&str> = Vec::new();

        for rule in &self.ordered {
            visit(&rule.output_symbol, &self.by_calculated, &mut marks, &mut stack)
                .map_err(|path| EngineError::DependencyCycle { path })?;
        }
        Ok(())
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

/// Depth-first walk from `node` along "is consumed by" edges.
///
/// Returns the cycle path when `node` is reached again while still on the stack.
fn visit<'a>(
    node: &'a str,
    consumers: &'a HashMap<String, RuleList>,
    marks: &mut HashMap<&'a str, Mark>,
    stack: &mut Vec<&'a str>,
) -> Result<(), Vec<String>> {
    match marks.get(node) {
        Some(Mark::Done) => return Ok(()),
        Some(Mark::Visiting) => {
            let start = stack.iter().position(|n| *n == node).unwrap_or(0);
            let mut path: Vec<String> = stack[start..].iter().map(|n| n.to_string()).collect();
            path.push(node.to_string());
            return Err(path);
        }
        None => {}
    }

    marks.insert(node, Mark::Visiting);
    stack.push(node);

    if let Some(rules) = consumers.get(node) {
        for rule in rules {
            visit(&rule.output_symbol, consumers, marks, stack)?;
        }
    }

    stack.pop();
    marks.insert(node, Mark::Done);
    Ok(())
}
