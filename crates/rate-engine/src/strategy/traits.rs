//! Strategy trait and shared helpers.

use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};

use crate::models::{CalculationRule, DerivedRate, Rate, RuleKind};

// =============================================================================
// Inputs
// =============================================================================

/// Inputs handed to a strategy, keyed by dependency and kept in rule order.
#[derive(Clone, Debug, Default)]
pub struct RateInputs {
    entries: Vec<(String, Rate)>,
}

impl RateInputs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the input for `key`.
    pub fn insert(&mut self, key: impl Into<String>, rate: Rate) {
        let key = key.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = rate,
            None => self.entries.push((key, rate)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Rate> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, rate)| rate)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Rate)> {
        self.entries.iter().map(|(k, r)| (k.as_str(), r))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Latest event time among the inputs.
    pub fn latest_timestamp(&self) -> Option<DateTime<Utc>> {
        self.entries.iter().map(|(_, r)| r.event_timestamp()).max()
    }
}

// =============================================================================
// Strategy trait
// =============================================================================

/// A pluggable calculation producing one derived rate.
///
/// Implementations must be pure with respect to their inputs: no I/O, no
/// shared state. Returning `None` means "cannot compute from these inputs"
/// and is not an error; the caller skips caching and publishing.
pub trait CalculationStrategy: Send + Sync {
    /// Identifier rules refer to via `strategyId`.
    fn id(&self) -> &'static str;

    /// Rule kind this strategy serves when no strategy matches by id.
    ///
    /// `None` restricts the strategy to exact id lookups.
    fn kind(&self) -> Option<RuleKind>;

    fn calculate(&self, rule: &CalculationRule, inputs: &RateInputs) -> Option<DerivedRate>;
}

/// A quote is usable when bid is positive and strictly below ask.
pub fn is_consistent(bid: Decimal, ask: Decimal) -> bool {
    bid > Decimal::ZERO && bid < ask
}

pub fn round_price(value: Decimal, scale: u32) -> Decimal {
    value.round_dp_with_strategy(scale, RoundingStrategy::MidpointAwayFromZero)
}

/// Assemble the output record for `rule`, recording every input.
///
/// `calculated_at` starts at the event time; the resolver stamps the wall
/// clock once the value is accepted.
pub(crate) fn derived_rate(
    rule: &CalculationRule,
    strategy_id: &str,
    bid: Decimal,
    ask: Decimal,
    inputs: &RateInputs,
) -> Option<DerivedRate> {
    let event_timestamp = inputs.latest_timestamp()?;
    Some(DerivedRate {
        symbol: rule.output_symbol.clone(),
        bid,
        ask,
        event_timestamp,
        source_strategy: strategy_id.to_string(),
        inputs: inputs.iter().map(|(key, rate)| rate.to_input(key)).collect(),
        calculated_at: event_timestamp,
    })
}
