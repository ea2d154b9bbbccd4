//! Chain resolution over the dependency graph.
//!
//! When a calculated rate becomes available, every rule consuming it is
//! re-evaluated in priority order; each new output in turn triggers its own
//! dependants:
//!
//! ```text
//!   raw PF1_USDTRY ┐
//!   raw PF2_USDTRY ┴─▶ USDTRY_AVG ─┐
//!   raw PF1_EURUSD ┐               ├─▶ EURTRY ─▶ ...
//!   raw PF2_EURUSD ┴─▶ EURUSD_AVG ─┘
//! ```
//!
//! A rule whose calculated inputs are not all available is parked in the
//! [`PendingSet`] and re-checked once one of them arrives.
//!
//! Inputs are looked up in this order: caller-supplied seeds (e.g. a completed
//! window), outputs produced earlier in the same run, then the shared cache.
//! Each output is produced at most once per run, which also bounds
//! propagation.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, trace, warn};

use super::pending::PendingSet;
use crate::cache::RateCache;
use crate::emit::Publisher;
use crate::models::symbol::{calculated_symbol, split_raw_key};
use crate::models::{CalculationRule, DerivedRate, Rate};
use crate::rules::DependencyGraph;
use crate::strategy::{BoundStrategies, RateInputs};

/// Outcome of evaluating one rule.
#[derive(Clone, Debug, PartialEq)]
pub enum Resolution {
    /// The output was calculated, cached and published.
    Computed(DerivedRate),
    /// Some inputs are not yet available.
    Deferred { missing: Vec<String> },
    /// All inputs were present but the strategy declined.
    NotComputable,
    /// The output was already produced in this run.
    AlreadyProduced,
    /// No rule produces the requested symbol.
    UnknownRule,
}

/// Walks the dependency graph, calculating whatever has become computable.
pub struct ChainResolver {
    graph: Arc<DependencyGraph>,
    strategies: Arc<BoundStrategies>,
    cache: Arc<RateCache>,
    pending: Arc<PendingSet>,
    publisher: Arc<Publisher>,
}

impl ChainResolver {
    pub fn new(
        graph: Arc<DependencyGraph>,
        strategies: Arc<BoundStrategies>,
        cache: Arc<RateCache>,
        pending: Arc<PendingSet>,
        publisher: Arc<Publisher>,
    ) -> Self {
        Self {
            graph,
            strategies,
            cache,
            pending,
            publisher,
        }
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    pub fn pending(&self) -> &PendingSet {
        &self.pending
    }

    /// Evaluate `rule` once.
    ///
    /// `produced` holds the outputs of the current run; a computed output is
    /// appended to it.
    pub async fn evaluate(
        &self,
        rule: &CalculationRule,
        seeds: &RateInputs,
        produced: &mut Vec<DerivedRate>,
    ) -> Resolution {
        let output = rule.output_symbol.as_str();
        if produced.iter().any(|rate| rate.symbol == output) {
            return Resolution::AlreadyProduced;
        }

        let mut inputs = RateInputs::new();
        let mut missing_raw = Vec::new();
        let mut missing_calculated = Vec::new();

        for key in &rule.depends_on_raw {
            match self.raw_input(key, seeds).await {
                Some(rate) => inputs.insert(key.clone(), rate),
                None => missing_raw.push(key.clone()),
            }
        }
        for symbol in &rule.depends_on_calculated {
            match self.calculated_input(symbol, seeds, produced).await {
                Some(rate) => inputs.insert(symbol.clone(), rate),
                None => missing_calculated.push(symbol.clone()),
            }
        }

        if !missing_calculated.is_empty() {
            if self.pending.add(output) {
                debug!(output, missing = ?missing_calculated, "Rule pending on calculated inputs");
            }
            missing_calculated.extend(missing_raw);
            return Resolution::Deferred {
                missing: missing_calculated,
            };
        }
        if !missing_raw.is_empty() {
            trace!(output, missing = ?missing_raw, "Rule waiting on raw inputs");
            return Resolution::Deferred {
                missing: missing_raw,
            };
        }

        let Some(strategy) = self.strategies.get(output) else {
            warn!(output, "No strategy bound for rule");
            return Resolution::UnknownRule;
        };

        let Some(mut rate) = strategy.calculate(rule, &inputs) else {
            warn!(output, strategy = strategy.id(), "Strategy could not compute output");
            return Resolution::NotComputable;
        };
        rate.calculated_at = Utc::now();

        self.cache.put_calculated(&rate).await;
        self.publisher
            .publish_rate(Rate::Calculated(rate.clone()))
            .await;
        self.pending.remove(output);
        debug!(output, bid = %rate.bid, ask = %rate.ask, "Calculated rate produced");

        produced.push(rate.clone());
        Resolution::Computed(rate)
    }

    /// Evaluate the rule producing `output_symbol` against current state.
    pub async fn resolve(&self, output_symbol: &str, produced: &mut Vec<DerivedRate>) -> Resolution {
        let Some(rule) = self.graph.rule_for(output_symbol).cloned() else {
            return Resolution::UnknownRule;
        };
        self.evaluate(&rule, &RateInputs::new(), produced).await
    }

    /// Re-evaluate everything downstream of the calculated `symbol`.
    ///
    /// Returns the number of outputs produced.
    pub async fn propagate(&self, symbol: &str, produced: &mut Vec<DerivedRate>) -> usize {
        let mut queue = VecDeque::from([calculated_symbol(symbol)]);
        let mut count = 0;

        while let Some(current) = queue.pop_front() {
            let rules: Vec<Arc<CalculationRule>> =
                self.graph.rules_to_trigger(&current, false).to_vec();
            for rule in rules {
                if let Resolution::Computed(rate) =
                    self.evaluate(&rule, &RateInputs::new(), produced).await
                {
                    count += 1;
                    queue.push_back(rate.symbol);
                }
            }
        }
        count
    }

    /// Retry every pending output against the current cache.
    ///
    /// Catch-up path for outputs whose inputs arrived through another route.
    pub async fn resolve_all_pending(&self) -> Vec<DerivedRate> {
        let mut symbols = self.pending.snapshot();
        symbols.sort_by_key(|s| {
            self.graph
                .rule_for(s)
                .map(|rule| rule.priority)
                .unwrap_or(i32::MAX)
        });

        let mut produced = Vec::new();
        for symbol in symbols {
            match self.resolve(&symbol, &mut produced).await {
                Resolution::Computed(rate) => {
                    self.propagate(&rate.symbol, &mut produced).await;
                }
                Resolution::UnknownRule => {
                    self.pending.remove(&symbol);
                }
                _ => {}
            }
        }

        if !produced.is_empty() {
            debug!(count = produced.len(), "Pending sweep produced rates");
        }
        produced
    }

    async fn raw_input(&self, key: &str, seeds: &RateInputs) -> Option<Rate> {
        if let Some(rate) = seeds.get(key) {
            return Some(rate.clone());
        }
        let (provider, instrument) = split_raw_key(key)?;
        self.cache
            .get_raw(&instrument, &provider)
            .await
            .map(Rate::Raw)
    }

    async fn calculated_input(
        &self,
        symbol: &str,
        seeds: &RateInputs,
        produced: &[DerivedRate],
    ) -> Option<Rate> {
        if let Some(rate) = seeds.get(symbol) {
            return Some(rate.clone());
        }
        if let Some(rate) = produced.iter().rev().find(|r| r.symbol == symbol) {
            return Some(Rate::Calculated(rate.clone()));
        }
        self.cache.get_calculated(symbol).await.map(Rate::Calculated)
    }
}
