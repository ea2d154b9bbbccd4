//! Loading and validating the calculation rule list.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use tracing::info;

use crate::errors::EngineError;
use crate::models::symbol::{calculated_symbol, normalize_raw_key};
use crate::models::CalculationRule;

/// Immutable, priority-ordered list of calculation rules.
///
/// Symbols are normalized on load: outputs and calculated dependencies are
/// upper-cased, raw dependencies keep their provider part and normalize the
/// instrument part. Rules with equal priority keep their configured order.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<Arc<CalculationRule>>,
}

impl RuleSet {
    /// Validate and order `rules`.
    pub fn new(rules: Vec<CalculationRule>) -> Result<Self, EngineError> {
        let mut seen = HashSet::new();
        let mut normalized = Vec::with_capacity(rules.len());

        for rule in rules {
            let rule = normalize_rule(rule)?;
            if !seen.insert(rule.output_symbol.clone()) {
                return Err(EngineError::Configuration(format!(
                    "Duplicate rule for output '{}'",
                    rule.output_symbol
                )));
            }
            normalized.push(Arc::new(rule));
        }

        normalized.sort_by_key(|rule| rule.priority);
        Ok(Self { rules: normalized })
    }

    /// Parse a JSON array of rules.
    pub fn from_json_str(json: &str) -> Result<Self, EngineError> {
        let rules: Vec<CalculationRule> = serde_json::from_str(json)?;
        Self::new(rules)
    }

    /// Load a JSON rule file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let set = Self::from_json_str(&content)?;
        info!(path = %path.display(), rules = set.len(), "Loaded calculation rules");
        Ok(set)
    }

    pub fn rules(&self) -> &[Arc<CalculationRule>] {
        &self.rules
    }

    pub fn get(&self, output_symbol: &str) -> Option<&Arc<CalculationRule>> {
        let wanted = calculated_symbol(output_symbol);
        self.rules.iter().find(|r| r.output_symbol == wanted)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

fn normalize_rule(mut rule: CalculationRule) -> Result<CalculationRule, EngineError> {
    rule.output_symbol = calculated_symbol(&rule.output_symbol);
    if rule.output_symbol.is_empty() {
        return Err(EngineError::Configuration(
            "Rule with empty output symbol".to_string(),
        ));
    }
    rule.strategy_id = rule.strategy_id.trim().to_uppercase();

    if !rule.has_dependencies() {
        return Err(EngineError::Configuration(format!(
            "Rule '{}' declares no dependencies",
            rule.output_symbol
        )));
    }

    rule.depends_on_raw = rule
        .depends_on_raw
        .iter()
        .map(|key| {
            normalize_raw_key(key).ok_or_else(|| {
                EngineError::Configuration(format!(
                    "Rule '{}': raw dependency '{}' is not of the form <provider>_<instrument>",
                    rule.output_symbol, key
                ))
            })
        })
        .collect::<Result<_, _>>()?;

    rule.depends_on_calculated = rule
        .depends_on_calculated
        .iter()
        .map(|s| calculated_symbol(s))
        .collect();
    if rule.depends_on_calculated.iter().any(String::is_empty) {
        return Err(EngineError::Configuration(format!(
            "Rule '{}' has an empty calculated dependency",
            rule.output_symbol
        )));
    }

    Ok(rule)
}
