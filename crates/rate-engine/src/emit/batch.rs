//! Per-run output batch.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::models::{DerivedRate, RawRate};

/// Everything one pipeline run produced, handed to the sink in one message.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateBatch {
    pub pipeline_id: String,
    pub trigger: RawRate,
    /// Latest raw rates of the trigger's instrument from the other providers.
    pub peers: Vec<RawRate>,
    /// Rates calculated during the run, in production order.
    pub derived: Vec<DerivedRate>,
    pub assembled_at: DateTime<Utc>,
}

impl RateBatch {
    /// Number of rates in the batch, trigger included.
    pub fn rate_count(&self) -> usize {
        1 + self.peers.len() + self.derived.len()
    }

    /// Compact line format used by legacy consumers.
    ///
    /// One `SOURCE-SYMBOL|BID|ASK|EPOCH_MILLIS` record per rate, records
    /// joined by `|`. Raw rates use the provider as source, calculated rates
    /// the strategy id.
    pub fn to_delimited(&self) -> String {
        let raw = std::iter::once(&self.trigger)
            .chain(self.peers.iter())
            .map(|r| record(&r.provider, &r.symbol, r));
        let derived = self.derived.iter().map(|d| {
            format!(
                "{}-{}|{}|{}|{}",
                d.source_strategy,
                d.symbol,
                d.bid,
                d.ask,
                d.event_timestamp.timestamp_millis()
            )
        });
        raw.chain(derived).collect::<Vec<_>>().join("|")
    }
}

fn record(source: &str, symbol: &str, rate: &RawRate) -> String {
    format!(
        "{}-{}|{}|{}|{}",
        source,
        symbol,
        rate.bid,
        rate.ask,
        rate.event_timestamp.timestamp_millis()
    )
}
