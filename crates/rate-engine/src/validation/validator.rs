//! Raw tick validation.
//!
//! Checks a tick before it touches any shared state:
//! - Prices positive and above a floor
//! - Bid not above ask
//! - Prices below a sanity ceiling
//! - Event time not in the future beyond a clock allowance
//! - Spread and age warnings

use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::warn;

use crate::errors::EngineError;
use crate::models::RawRate;

/// Validation severity levels.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ValidationSeverity {
    /// Reject the tick; the run fails.
    Hard,
    /// Accept the tick but log a warning.
    Soft,
}

/// A single finding.
#[derive(Clone, Debug)]
pub struct ValidationIssue {
    pub severity: ValidationSeverity,
    pub message: String,
}

impl ValidationIssue {
    fn hard(message: String) -> Self {
        Self {
            severity: ValidationSeverity::Hard,
            message,
        }
    }

    fn soft(message: String) -> Self {
        Self {
            severity: ValidationSeverity::Soft,
            message,
        }
    }
}

/// Validator thresholds.
#[derive(Clone, Debug, PartialEq)]
pub struct ValidatorConfig {
    /// Smallest accepted bid or ask.
    pub min_price: Decimal,
    /// Largest accepted bid or ask.
    pub max_price: Option<Decimal>,
    /// Spread relative to bid above which a warning is logged.
    pub max_spread_ratio: Option<Decimal>,
    /// How far in the future an event time may be.
    pub max_future_drift: Duration,
    /// Age beyond which a warning is logged.
    pub max_age: Duration,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        Self {
            min_price: Decimal::new(1, 6),
            max_price: Some(Decimal::from(1_000_000_000i64)),
            max_spread_ratio: Some(Decimal::new(5, 2)),
            max_future_drift: Duration::from_secs(10),
            max_age: Duration::from_secs(300),
        }
    }
}

/// Raw rate validator.
#[derive(Clone, Debug, Default)]
pub struct RateValidator {
    config: ValidatorConfig,
}

impl RateValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: ValidatorConfig) -> Self {
        Self { config }
    }

    /// Validate against the wall clock.
    pub fn validate(&self, rate: &RawRate) -> Result<(), EngineError> {
        self.validate_at(rate, Utc::now())
    }

    /// Validate as of `now`.
    ///
    /// Hard findings are joined into one error; soft findings are logged.
    pub fn validate_at(&self, rate: &RawRate, now: DateTime<Utc>) -> Result<(), EngineError> {
        let issues = self.inspect(rate, now);

        let hard: Vec<&str> = issues
            .iter()
            .filter(|i| i.severity == ValidationSeverity::Hard)
            .map(|i| i.message.as_str())
            .collect();
        if !hard.is_empty() {
            return Err(EngineError::Validation {
                symbol: rate.symbol.clone(),
                message: hard.join("; "),
            });
        }

        for issue in issues.iter().filter(|i| i.severity == ValidationSeverity::Soft) {
            warn!(
                symbol = %rate.symbol,
                provider = %rate.provider,
                "Rate validation warning: {}", issue.message
            );
        }
        Ok(())
    }

    /// All findings for `rate`, hard and soft.
    pub fn inspect(&self, rate: &RawRate, now: DateTime<Utc>) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();

        if rate.symbol.trim().is_empty() {
            issues.push(ValidationIssue::hard("Empty symbol".to_string()));
        }
        if rate.provider.trim().is_empty() {
            issues.push(ValidationIssue::hard("Empty provider".to_string()));
        }

        self.check_prices(rate, &mut issues);
        self.check_spread(rate, &mut issues);
        self.check_timestamp(rate, now, &mut issues);

        issues
    }

    fn check_prices(&self, rate: &RawRate, issues: &mut Vec<ValidationIssue>) {
        for (side, price) in [("Bid", rate.bid), ("Ask", rate.ask)] {
            if price < self.config.min_price {
                issues.push(ValidationIssue::hard(format!(
                    "{} ({}) is below minimum {}",
                    side, price, self.config.min_price
                )));
            }
            if let Some(max) = self.config.max_price {
                if price > max {
                    issues.push(ValidationIssue::hard(format!(
                        "{} ({}) exceeds maximum {}",
                        side, price, max
                    )));
                }
            }
        }

        if rate.bid > rate.ask {
            issues.push(ValidationIssue::hard(format!(
                "Bid ({}) is greater than ask ({})",
                rate.bid, rate.ask
            )));
        }
    }

    fn check_spread(&self, rate: &RawRate, issues: &mut Vec<ValidationIssue>) {
        let Some(max_ratio) = self.config.max_spread_ratio else {
            return;
        };
        if rate.bid <= Decimal::ZERO {
            return;
        }
        if let Some(ratio) = rate.spread().checked_div(rate.bid) {
            if ratio > max_ratio {
                issues.push(ValidationIssue::soft(format!(
                    "Spread ratio {} exceeds {}",
                    ratio.round_dp(6),
                    max_ratio
                )));
            }
        }
    }

    fn check_timestamp(&self, rate: &RawRate, now: DateTime<Utc>, issues: &mut Vec<ValidationIssue>) {
        let ahead_ms = (rate.event_timestamp - now).num_milliseconds();
        if ahead_ms > self.config.max_future_drift.as_millis() as i64 {
            issues.push(ValidationIssue::hard(format!(
                "Event time {} is {} ms in the future",
                rate.event_timestamp, ahead_ms
            )));
        }

        let age_ms = -ahead_ms;
        if age_ms > self.config.max_age.as_millis() as i64 {
            issues.push(ValidationIssue::soft(format!(
                "Event time {} is {} ms old",
                rate.event_timestamp, age_ms
            )));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn rate(bid: Decimal, ask: Decimal) -> RawRate {
        RawRate::new("PF1", "PF1_USDTRY", bid, ask, now())
    }

    fn hard_count(issues: &[ValidationIssue]) -> usize {
        issues
            .iter()
            .filter(|i| i.severity == ValidationSeverity::Hard)
            .count()
    }

    #[test]
    fn test_valid_rate_passes() {
        let validator = RateValidator::new();
        assert!(validator.validate_at(&rate(dec!(32.10), dec!(32.20)), now()).is_ok());
    }

    #[test]
    fn test_bid_above_ask_rejected() {
        let validator = RateValidator::new();
        let err = validator
            .validate_at(&rate(dec!(32.30), dec!(32.20)), now())
            .unwrap_err();
        assert!(err.to_string().contains("greater than ask"));
    }

    #[test]
    fn test_equal_bid_ask_accepted() {
        let validator = RateValidator::new();
        assert!(validator.validate_at(&rate(dec!(1.5), dec!(1.5)), now()).is_ok());
    }

    #[test]
    fn test_non_positive_prices_rejected() {
        let validator = RateValidator::new();
        let issues = validator.inspect(&rate(dec!(0), dec!(-1)), now());
        // below floor (x2) and bid above ask
        assert_eq!(hard_count(&issues), 3);
    }

    #[test]
    fn test_max_price_rejected() {
        let validator = RateValidator::with_config(ValidatorConfig {
            max_price: Some(dec!(100)),
            ..Default::default()
        });
        assert!(validator.validate_at(&rate(dec!(99), dec!(101)), now()).is_err());
    }

    #[test]
    fn test_wide_spread_is_soft() {
        let validator = RateValidator::new();
        let issues = validator.inspect(&rate(dec!(1.00), dec!(1.10)), now());
        assert_eq!(hard_count(&issues), 0);
        assert_eq!(issues.len(), 1);
        assert!(validator.validate_at(&rate(dec!(1.00), dec!(1.10)), now()).is_ok());
    }

    #[test]
    fn test_future_timestamp_rejected() {
        let validator = RateValidator::new();
        let ahead = rate(dec!(1.0), dec!(1.01));
        let issues = validator.inspect(&ahead, now() - chrono::Duration::seconds(11));
        assert_eq!(hard_count(&issues), 1);

        let issues = validator.inspect(&ahead, now() - chrono::Duration::seconds(9));
        assert!(issues.is_empty());
    }

    #[test]
    fn test_old_timestamp_is_soft() {
        let validator = RateValidator::new();
        let issues = validator.inspect(&rate(dec!(1.0), dec!(1.01)), now() + chrono::Duration::minutes(6));
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].severity, ValidationSeverity::Soft);
    }

    #[test]
    fn test_empty_identity_rejected() {
        let validator = RateValidator::new();
        let mut r = rate(dec!(1.0), dec!(1.01));
        r.provider = " ".into();
        assert!(validator.validate_at(&r, now()).is_err());
    }
}
