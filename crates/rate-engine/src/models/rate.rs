//! Raw and derived rate models.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::symbol::{base_instrument, raw_key};

/// Whether a rate came straight from a provider or was calculated.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RateKind {
    Raw,
    Calculated,
}

/// A single provider's bid/ask tick for one instrument.
///
/// Identity is `(provider, instrument)`; a newer tick for the same identity
/// replaces the older one in every store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawRate {
    /// Symbol as published by the provider (e.g. `PF1_USDTRY`, `USD/TRY`).
    pub symbol: String,
    pub provider: String,
    pub bid: Decimal,
    pub ask: Decimal,
    /// Provider-side time of the quote.
    #[serde(alias = "timestamp")]
    pub event_timestamp: DateTime<Utc>,
    /// Local time the tick entered the engine.
    #[serde(default = "Utc::now")]
    pub received_at: DateTime<Utc>,
}

impl RawRate {
    /// Creates a rate received now.
    pub fn new(
        provider: impl Into<String>,
        symbol: impl Into<String>,
        bid: Decimal,
        ask: Decimal,
        event_timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            provider: provider.into(),
            bid,
            ask,
            event_timestamp,
            received_at: Utc::now(),
        }
    }

    /// Overrides the local receive time.
    pub fn received_at(mut self, at: DateTime<Utc>) -> Self {
        self.received_at = at;
        self
    }

    /// Base instrument with any provider prefix stripped.
    pub fn instrument(&self) -> String {
        base_instrument(&self.symbol)
    }

    /// `<provider>_<INSTRUMENT>` key used by rule dependencies.
    pub fn raw_key(&self) -> String {
        raw_key(&self.provider, &self.symbol)
    }

    /// True when bid and ask are identical to `other`.
    pub fn same_quote(&self, other: &RawRate) -> bool {
        self.bid == other.bid && self.ask == other.ask
    }

    pub fn spread(&self) -> Decimal {
        self.ask - self.bid
    }
}

/// Audit record of one input that fed a calculation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputRate {
    /// Dependency key the input satisfied.
    pub key: String,
    pub symbol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    pub kind: RateKind,
    pub bid: Decimal,
    pub ask: Decimal,
    pub event_timestamp: DateTime<Utc>,
}

/// A rate computed by a strategy from other rates.
///
/// Identity is `symbol`; a recomputation overwrites the previous value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DerivedRate {
    pub symbol: String,
    pub bid: Decimal,
    pub ask: Decimal,
    /// Latest event time among the inputs.
    pub event_timestamp: DateTime<Utc>,
    /// Id of the strategy that produced the value.
    pub source_strategy: String,
    #[serde(default)]
    pub inputs: Vec<InputRate>,
    /// When the engine accepted the value.
    pub calculated_at: DateTime<Utc>,
}

impl DerivedRate {
    pub fn mid(&self) -> Decimal {
        (self.bid + self.ask) / Decimal::TWO
    }
}

/// Any rate flowing through the engine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Rate {
    Raw(RawRate),
    Calculated(DerivedRate),
}

impl Rate {
    pub fn kind(&self) -> RateKind {
        match self {
            Self::Raw(_) => RateKind::Raw,
            Self::Calculated(_) => RateKind::Calculated,
        }
    }

    pub fn symbol(&self) -> &str {
        match self {
            Self::Raw(r) => &r.symbol,
            Self::Calculated(r) => &r.symbol,
        }
    }

    pub fn bid(&self) -> Decimal {
        match self {
            Self::Raw(r) => r.bid,
            Self::Calculated(r) => r.bid,
        }
    }

    pub fn ask(&self) -> Decimal {
        match self {
            Self::Raw(r) => r.ask,
            Self::Calculated(r) => r.ask,
        }
    }

    pub fn event_timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::Raw(r) => r.event_timestamp,
            Self::Calculated(r) => r.event_timestamp,
        }
    }

    pub fn provider(&self) -> Option<&str> {
        match self {
            Self::Raw(r) => Some(&r.provider),
            Self::Calculated(_) => None,
        }
    }

    pub fn as_raw(&self) -> Option<&RawRate> {
        match self {
            Self::Raw(r) => Some(r),
            Self::Calculated(_) => None,
        }
    }

    /// Builds the audit record for this rate used under `key`.
    pub fn to_input(&self, key: &str) -> InputRate {
        InputRate {
            key: key.to_string(),
            symbol: self.symbol().to_string(),
            provider: self.provider().map(str::to_string),
            kind: self.kind(),
            bid: self.bid(),
            ask: self.ask(),
            event_timestamp: self.event_timestamp(),
        }
    }
}

impl From<RawRate> for Rate {
    fn from(rate: RawRate) -> Self {
        Self::Raw(rate)
    }
}

impl From<DerivedRate> for Rate {
    fn from(rate: DerivedRate) -> Self {
        Self::Calculated(rate)
    }
}
