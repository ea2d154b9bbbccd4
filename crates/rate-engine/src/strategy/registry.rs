//! Compile-time strategy registry.
//!
//! Strategies are registered in code at startup; rules pick one by id, with
//! the rule kind as fallback when [`StrategyLookup::IdThenKind`] is in effect.
//! Every rule is bound to a strategy before the engine starts, so an
//! unresolvable rule is a startup error rather than a per-tick failure.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::average::{AverageStrategy, WeightedAverageStrategy};
use super::cross::CrossStrategy;
use super::traits::CalculationStrategy;
use crate::errors::EngineError;
use crate::models::{CalculationRule, RuleKind};

/// Order in which a rule's strategy is looked up.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StrategyLookup {
    /// Exact strategy id, then the strategy registered for the rule kind.
    #[default]
    IdThenKind,
    /// Exact strategy id only.
    IdOnly,
}

/// Strategy id → implementation, plus a per-kind fallback.
pub struct StrategyRegistry {
    by_id: HashMap<&'static str, Arc<dyn CalculationStrategy>>,
    by_kind: HashMap<RuleKind, Arc<dyn CalculationStrategy>>,
    lookup: StrategyLookup,
}

impl StrategyRegistry {
    /// Registry with no strategies.
    pub fn empty(lookup: StrategyLookup) -> Self {
        Self {
            by_id: HashMap::new(),
            by_kind: HashMap::new(),
            lookup,
        }
    }

    /// Registry with the built-in strategies.
    pub fn builtin(lookup: StrategyLookup) -> Self {
        let mut registry = Self::empty(lookup);
        registry
            .register(Arc::new(AverageStrategy))
            .register(Arc::new(WeightedAverageStrategy))
            .register(Arc::new(CrossStrategy));
        registry
    }

    /// Add a strategy.
    ///
    /// The first strategy registered for a kind serves that kind's fallback.
    /// Registering an id twice replaces the earlier strategy for id lookups.
    pub fn register(&mut self, strategy: Arc<dyn CalculationStrategy>) -> &mut Self {
        let id = strategy.id();
        if let Some(kind) = strategy.kind() {
            self.by_kind.entry(kind).or_insert_with(|| Arc::clone(&strategy));
        }
        if self.by_id.insert(id, strategy).is_some() {
            warn!(strategy = id, "Strategy id registered twice, keeping the latest");
        }
        self
    }

    pub fn lookup(&self) -> StrategyLookup {
        self.lookup
    }

    pub fn ids(&self) -> Vec<&'static str> {
        let mut ids: Vec<_> = self.by_id.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Find the strategy for `rule`.
    pub fn resolve(&self, rule: &CalculationRule) -> Option<Arc<dyn CalculationStrategy>> {
        let wanted = rule.strategy_id.trim().to_uppercase();
        if let Some(strategy) = self.by_id.get(wanted.as_str()) {
            return Some(Arc::clone(strategy));
        }

        match self.lookup {
            StrategyLookup::IdOnly => None,
            StrategyLookup::IdThenKind => {
                let fallback = self.by_kind.get(&rule.kind).map(Arc::clone);
                if fallback.is_some() && !wanted.is_empty() {
                    debug!(
                        output = %rule.output_symbol,
                        strategy_id = %wanted,
                        kind = %rule.kind,
                        "Strategy id not registered, using kind fallback"
                    );
                }
                fallback
            }
        }
    }

    /// Resolve a strategy for every rule, failing on the first miss.
    pub fn bind<'a, I>(&self, rules: I) -> Result<BoundStrategies, EngineError>
    where
        I: IntoIterator<Item = &'a Arc<CalculationRule>>,
    {
        let mut bound = HashMap::new();
        for rule in rules {
            let strategy = self
                .resolve(rule)
                .ok_or_else(|| EngineError::UnresolvableStrategy {
                    output: rule.output_symbol.clone(),
                    strategy_id: rule.strategy_id.clone(),
                    kind: rule.kind.to_string(),
                })?;
            bound.insert(rule.output_symbol.clone(), strategy);
        }
        Ok(BoundStrategies { bound })
    }
}

/// Output symbol → strategy, fixed at startup.
#[derive(Default)]
pub struct BoundStrategies {
    bound: HashMap<String, Arc<dyn CalculationStrategy>>,
}

impl BoundStrategies {
    pub fn get(&self, output_symbol: &str) -> Option<&Arc<dyn CalculationStrategy>> {
        self.bound.get(output_symbol)
    }

    pub fn len(&self) -> usize {
        self.bound.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bound.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DerivedRate;
    use crate::strategy::RateInputs;

    struct FixedStrategy;

    impl CalculationStrategy for FixedStrategy {
        fn id(&self) -> &'static str {
            "FIXED"
        }
        fn kind(&self) -> Option<RuleKind> {
            Some(RuleKind::Custom)
        }
        fn calculate(&self, _: &CalculationRule, _: &RateInputs) -> Option<DerivedRate> {
            None
        }
    }

    fn rule(kind: RuleKind, strategy_id: &str) -> Arc<CalculationRule> {
        Arc::new(CalculationRule::new("OUT", kind, strategy_id).with_raw(["PF1_USDTRY"]))
    }

    #[test]
    fn test_builtin_ids() {
        let registry = StrategyRegistry::builtin(StrategyLookup::default());
        assert_eq!(registry.ids(), vec!["AVERAGE", "CROSS", "WEIGHTED_AVERAGE"]);
    }

    #[test]
    fn test_exact_id_wins_over_kind() {
        let registry = StrategyRegistry::builtin(StrategyLookup::IdThenKind);
        let strategy = registry
            .resolve(&rule(RuleKind::Avg, "weighted_average"))
            .unwrap();
        assert_eq!(strategy.id(), "WEIGHTED_AVERAGE");
    }

    #[test]
    fn test_kind_fallback_when_id_unknown() {
        let registry = StrategyRegistry::builtin(StrategyLookup::IdThenKind);
        assert_eq!(
            registry.resolve(&rule(RuleKind::Avg, "MEDIAN")).unwrap().id(),
            "AVERAGE"
        );
        assert_eq!(
            registry.resolve(&rule(RuleKind::Cross, "")).unwrap().id(),
            "CROSS"
        );
    }

    #[test]
    fn test_id_only_lookup_skips_fallback() {
        let registry = StrategyRegistry::builtin(StrategyLookup::IdOnly);
        assert!(registry.resolve(&rule(RuleKind::Avg, "MEDIAN")).is_none());
        assert!(registry.resolve(&rule(RuleKind::Avg, "AVERAGE")).is_some());
    }

    #[test]
    fn test_custom_kind_has_no_builtin_fallback() {
        let registry = StrategyRegistry::builtin(StrategyLookup::IdThenKind);
        assert!(registry.resolve(&rule(RuleKind::Custom, "SPECIAL")).is_none());
    }

    #[test]
    fn test_registered_custom_strategy_serves_its_kind() {
        let mut registry = StrategyRegistry::builtin(StrategyLookup::IdThenKind);
        registry.register(Arc::new(FixedStrategy));
        assert_eq!(
            registry.resolve(&rule(RuleKind::Custom, "SPECIAL")).unwrap().id(),
            "FIXED"
        );
    }

    #[test]
    fn test_bind_fails_on_unresolvable_rule() {
        let registry = StrategyRegistry::builtin(StrategyLookup::IdThenKind);
        let rules = vec![rule(RuleKind::Avg, "AVERAGE"), rule(RuleKind::Custom, "MAGIC")];
        match registry.bind(&rules) {
            Err(EngineError::UnresolvableStrategy { strategy_id, kind, .. }) => {
                assert_eq!(strategy_id, "MAGIC");
                assert_eq!(kind, "CUSTOM");
            }
            other => panic!("expected unresolvable strategy, got ok={}", other.is_ok()),
        }
    }

    #[test]
    fn test_bind_maps_outputs() {
        let registry = StrategyRegistry::builtin(StrategyLookup::IdThenKind);
        let rules = vec![rule(RuleKind::Avg, "AVERAGE")];
        let bound = registry.bind(&rules).unwrap();
        assert_eq!(bound.len(), 1);
        assert_eq!(bound.get("OUT").unwrap().id(), "AVERAGE");
    }
}
