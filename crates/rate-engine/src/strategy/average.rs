//! Provider average strategies.

use rust_decimal::Decimal;
use tracing::debug;

use super::traits::{derived_rate, is_consistent, round_price, CalculationStrategy, RateInputs};
use crate::models::{CalculationRule, DerivedRate, Rate, RuleKind};

/// Arithmetic mean of bid and ask across all inputs.
pub struct AverageStrategy;

impl AverageStrategy {
    pub const ID: &'static str = "AVERAGE";
}

impl CalculationStrategy for AverageStrategy {
    fn id(&self) -> &'static str {
        Self::ID
    }

    fn kind(&self) -> Option<RuleKind> {
        Some(RuleKind::Avg)
    }

    fn calculate(&self, rule: &CalculationRule, inputs: &RateInputs) -> Option<DerivedRate> {
        let weighted = inputs.iter().map(|(_, rate)| (rate, Decimal::ONE));
        let (bid, ask) = weighted_mean(rule, weighted)?;
        derived_rate(rule, Self::ID, bid, ask, inputs)
    }
}

/// Mean weighted by `weight.<inputKey>` parameters (default weight 1).
pub struct WeightedAverageStrategy;

impl WeightedAverageStrategy {
    pub const ID: &'static str = "WEIGHTED_AVERAGE";
}

impl CalculationStrategy for WeightedAverageStrategy {
    fn id(&self) -> &'static str {
        Self::ID
    }

    fn kind(&self) -> Option<RuleKind> {
        None
    }

    fn calculate(&self, rule: &CalculationRule, inputs: &RateInputs) -> Option<DerivedRate> {
        let weighted = inputs.iter().map(|(key, rate)| {
            let weight = rule
                .parameter(&format!("weight.{}", key))
                .and_then(|w| w.trim().parse::<Decimal>().ok())
                .unwrap_or(Decimal::ONE);
            (rate, weight)
        });
        let (bid, ask) = weighted_mean(rule, weighted)?;
        derived_rate(rule, Self::ID, bid, ask, inputs)
    }
}

fn weighted_mean<'a>(
    rule: &CalculationRule,
    inputs: impl Iterator<Item = (&'a Rate, Decimal)>,
) -> Option<(Decimal, Decimal)> {
    let mut bid_sum = Decimal::ZERO;
    let mut ask_sum = Decimal::ZERO;
    let mut total_weight = Decimal::ZERO;

    for (rate, weight) in inputs {
        if !is_consistent(rate.bid(), rate.ask()) {
            debug!(
                output = %rule.output_symbol,
                input = %rate.symbol(),
                "Inconsistent input quote, skipping average"
            );
            return None;
        }
        if weight < Decimal::ZERO {
            return None;
        }
        bid_sum = bid_sum.checked_add(rate.bid().checked_mul(weight)?)?;
        ask_sum = ask_sum.checked_add(rate.ask().checked_mul(weight)?)?;
        total_weight += weight;
    }

    if total_weight.is_zero() {
        return None;
    }

    let scale = rule.scale();
    let bid = round_price(bid_sum.checked_div(total_weight)?, scale);
    let ask = round_price(ask_sum.checked_div(total_weight)?, scale);
    is_consistent(bid, ask).then_some((bid, ask))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RateKind, RawRate};
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;

    fn raw(provider: &str, bid: Decimal, ask: Decimal, secs: u32) -> Rate {
        Rate::Raw(RawRate::new(
            provider,
            format!("{}_USDTRY", provider),
            bid,
            ask,
            Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, secs).unwrap(),
        ))
    }

    fn avg_rule() -> CalculationRule {
        CalculationRule::new("USDTRY_AVG", RuleKind::Avg, "AVERAGE")
            .with_raw(["PF1_USDTRY", "PF2_USDTRY"])
    }

    #[test]
    fn test_average_of_two_providers() {
        let mut inputs = RateInputs::new();
        inputs.insert("PF1_USDTRY", raw("PF1", dec!(32.10), dec!(32.20), 0));
        inputs.insert("PF2_USDTRY", raw("PF2", dec!(32.12), dec!(32.26), 2));

        let rate = AverageStrategy.calculate(&avg_rule(), &inputs).unwrap();
        assert_eq!(rate.symbol, "USDTRY_AVG");
        assert_eq!(rate.bid, dec!(32.11));
        assert_eq!(rate.ask, dec!(32.23));
        assert_eq!(rate.source_strategy, "AVERAGE");
        assert_eq!(
            rate.event_timestamp,
            Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 2).unwrap()
        );
        assert_eq!(rate.inputs.len(), 2);
        assert!(rate.inputs.iter().all(|i| i.kind == RateKind::Raw));
    }

    #[test]
    fn test_same_inputs_give_equal_output() {
        let mut inputs = RateInputs::new();
        inputs.insert("PF1_USDTRY", raw("PF1", dec!(32.10), dec!(32.20), 0));
        inputs.insert("PF2_USDTRY", raw("PF2", dec!(32.12), dec!(32.26), 2));

        let first = AverageStrategy.calculate(&avg_rule(), &inputs).unwrap();
        let second = AverageStrategy.calculate(&avg_rule(), &inputs).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.calculated_at, first.event_timestamp);
    }

    #[test]
    fn test_average_rounds_half_away_from_zero() {
        let mut inputs = RateInputs::new();
        inputs.insert("PF1_USDTRY", raw("PF1", dec!(1.0000001), dec!(2), 0));
        inputs.insert("PF2_USDTRY", raw("PF2", dec!(1.0000000), dec!(2), 0));

        let rate = AverageStrategy.calculate(&avg_rule(), &inputs).unwrap();
        // 1.00000005 -> 1.000000 at scale 6, 1.0000001 at scale 7
        assert_eq!(rate.bid, dec!(1.000000));

        let rule = avg_rule().with_parameter("scale", "7");
        let rate = AverageStrategy.calculate(&rule, &inputs).unwrap();
        assert_eq!(rate.bid, dec!(1.0000001));
    }

    #[test]
    fn test_average_rejects_crossed_input() {
        let mut inputs = RateInputs::new();
        inputs.insert("PF1_USDTRY", raw("PF1", dec!(32.30), dec!(32.20), 0));
        inputs.insert("PF2_USDTRY", raw("PF2", dec!(32.10), dec!(32.20), 0));
        assert!(AverageStrategy.calculate(&avg_rule(), &inputs).is_none());
    }

    #[test]
    fn test_average_of_nothing_is_none() {
        assert!(AverageStrategy
            .calculate(&avg_rule(), &RateInputs::new())
            .is_none());
    }

    #[test]
    fn test_weighted_average() {
        let rule = avg_rule()
            .with_parameter("weight.PF1_USDTRY", "3")
            .with_parameter("weight.PF2_USDTRY", "1");
        let mut inputs = RateInputs::new();
        inputs.insert("PF1_USDTRY", raw("PF1", dec!(10), dec!(12), 0));
        inputs.insert("PF2_USDTRY", raw("PF2", dec!(14), dec!(16), 0));

        let rate = WeightedAverageStrategy.calculate(&rule, &inputs).unwrap();
        assert_eq!(rate.bid, dec!(11));
        assert_eq!(rate.ask, dec!(13));
        assert_eq!(rate.source_strategy, "WEIGHTED_AVERAGE");
    }

    #[test]
    fn test_weighted_average_zero_weights_is_none() {
        let rule = avg_rule()
            .with_parameter("weight.PF1_USDTRY", "0")
            .with_parameter("weight.PF2_USDTRY", "0");
        let mut inputs = RateInputs::new();
        inputs.insert("PF1_USDTRY", raw("PF1", dec!(10), dec!(12), 0));
        inputs.insert("PF2_USDTRY", raw("PF2", dec!(14), dec!(16), 0));
        assert!(WeightedAverageStrategy.calculate(&rule, &inputs).is_none());
    }
}
