//! Cross rates from two legs.

use std::str::FromStr;

use tracing::debug;

use super::traits::{derived_rate, is_consistent, round_price, CalculationStrategy, RateInputs};
use crate::models::{CalculationRule, DerivedRate, Rate, RuleKind};

/// How the two legs are combined.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Default)]
pub enum CrossOperation {
    /// `A/B × B/C = A/C`, e.g. EURUSD × USDTRY.
    #[default]
    Multiply,
    /// `A/C ÷ B/C = A/B`, bid against the other leg's ask.
    Divide,
}

impl FromStr for CrossOperation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "multiply" | "mul" | "*" => Ok(Self::Multiply),
            "divide" | "div" | "/" => Ok(Self::Divide),
            other => Err(format!("unknown cross operation '{}'", other)),
        }
    }
}

/// Combines two rates into a cross.
///
/// Legs are the first two calculated dependencies, or the first two raw
/// dependencies when the rule has no calculated ones. The `operation`
/// parameter selects [`CrossOperation`].
pub struct CrossStrategy;

impl CrossStrategy {
    pub const ID: &'static str = "CROSS";

    fn legs<'a>(rule: &CalculationRule, inputs: &'a RateInputs) -> Option<(&'a Rate, &'a Rate)> {
        let keys = if rule.depends_on_calculated.len() >= 2 {
            &rule.depends_on_calculated
        } else {
            &rule.depends_on_raw
        };
        match keys.as_slice() {
            [first, second, ..] => Some((inputs.get(first)?, inputs.get(second)?)),
            _ => None,
        }
    }
}

impl CalculationStrategy for CrossStrategy {
    fn id(&self) -> &'static str {
        Self::ID
    }

    fn kind(&self) -> Option<RuleKind> {
        Some(RuleKind::Cross)
    }

    fn calculate(&self, rule: &CalculationRule, inputs: &RateInputs) -> Option<DerivedRate> {
        let operation = match rule.parameter("operation") {
            Some(value) => match value.parse::<CrossOperation>() {
                Ok(op) => op,
                Err(e) => {
                    debug!(output = %rule.output_symbol, error = %e, "Invalid cross operation");
                    return None;
                }
            },
            None => CrossOperation::default(),
        };

        let (a, b) = Self::legs(rule, inputs)?;
        if !is_consistent(a.bid(), a.ask()) || !is_consistent(b.bid(), b.ask()) {
            debug!(output = %rule.output_symbol, "Inconsistent cross leg");
            return None;
        }

        let (bid, ask) = match operation {
            CrossOperation::Multiply => (a.bid().checked_mul(b.bid())?, a.ask().checked_mul(b.ask())?),
            CrossOperation::Divide => (a.bid().checked_div(b.ask())?, a.ask().checked_div(b.bid())?),
        };

        let scale = rule.scale();
        let (bid, ask) = (round_price(bid, scale), round_price(ask, scale));
        if !is_consistent(bid, ask) {
            return None;
        }
        derived_rate(rule, Self::ID, bid, ask, inputs)
    }
}
