//! Cross-provider tick synchronization.
//!
//! Each base instrument has a window holding the latest raw rate from every
//! expected provider. A window completes when all expected providers have
//! reported and their event timestamps lie within the skew tolerance:
//!
//! ```text
//!   PF1  ──●────────────●──────────        ● = tick (event time)
//!   PF2  ────────●──────────────●───
//!                ├──────┤
//!              ≤ skew → complete
//! ```
//!
//! Windows are never cleared on completion; the next tick from any provider
//! replaces that provider's slot and is checked again. A sweep evicts slots
//! that have not been refreshed within the staleness threshold so an old
//! tick cannot pair with a fresh one.
//!
//! Windows live in a sharded map; each instrument is updated under its own
//! shard lock and never under a global one.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, trace};

use crate::models::{Rate, RawRate};

/// Settings for [`WindowSynchronizer`].
#[derive(Clone, Debug, PartialEq)]
pub struct WindowSettings {
    /// Expected providers per base instrument.
    pub expected_providers: HashMap<String, BTreeSet<String>>,
    /// Max event-time spread across providers for a window to complete.
    pub skew_tolerance: Duration,
    /// Age (by receive time) after which a provider slot is evicted.
    pub staleness_threshold: Duration,
}

impl Default for WindowSettings {
    fn default() -> Self {
        Self {
            expected_providers: HashMap::new(),
            skew_tolerance: Duration::from_millis(3_000),
            staleness_threshold: Duration::from_millis(30_000),
        }
    }
}

/// Identity of one completion, used to fire once per completing set.
type Fingerprint = Vec<(String, DateTime<Utc>, Decimal, Decimal)>;

#[derive(Debug, Default)]
struct Window {
    latest: HashMap<String, RawRate>,
    last_updated: Option<DateTime<Utc>>,
    last_fired: Option<Fingerprint>,
}

impl Window {
    fn fingerprint(&self) -> Fingerprint {
        let mut fp: Fingerprint = self
            .latest
            .values()
            .map(|r| (r.provider.clone(), r.event_timestamp, r.bid, r.ask))
            .collect();
        fp.sort();
        fp
    }

    /// Event-time spread across the stored rates, in milliseconds.
    fn spread_ms(&self) -> i64 {
        let times = self.latest.values().map(|r| r.event_timestamp);
        match (times.clone().min(), times.max()) {
            (Some(min), Some(max)) => (max - min).num_milliseconds(),
            _ => 0,
        }
    }

    fn evict_received_before(&mut self, cutoff: DateTime<Utc>) -> usize {
        let before = self.latest.len();
        self.latest.retain(|_, rate| rate.received_at >= cutoff);
        let evicted = before - self.latest.len();
        if evicted > 0 {
            self.last_fired = None;
        }
        evicted
    }
}

/// A window whose providers all reported within the skew tolerance.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedWindow {
    pub instrument: String,
    /// Provider → latest rate.
    pub rates: BTreeMap<String, RawRate>,
    /// Event-time spread across providers.
    pub skew_ms: i64,
}

impl CompletedWindow {
    /// Rate for a raw key (`<provider>_<INSTRUMENT>`), if it belongs to this window.
    pub fn rate_for_key(&self, raw_key: &str) -> Option<&RawRate> {
        self.rates.values().find(|rate| rate.raw_key() == raw_key)
    }
}

/// Read-only view of a window for diagnostics.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowSnapshot {
    pub instrument: String,
    pub providers: Vec<String>,
    pub missing: Vec<String>,
    pub last_updated: Option<DateTime<Utc>>,
}

/// Result of one sweep.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SweepStats {
    pub evicted_rates: usize,
    pub dropped_windows: usize,
}

/// Per-instrument latest-tick buffers with skew-checked completion.
pub struct WindowSynchronizer {
    windows: DashMap<String, Window>,
    settings: WindowSettings,
}

impl WindowSynchronizer {
    pub fn new(settings: WindowSettings) -> Self {
        Self {
            windows: DashMap::new(),
            settings,
        }
    }

    pub fn settings(&self) -> &WindowSettings {
        &self.settings
    }

    /// Expected providers for `instrument`, if the instrument is configured.
    pub fn expected_providers(&self, instrument: &str) -> Option<&BTreeSet<String>> {
        self.settings.expected_providers.get(instrument)
    }

    /// Record a tick and report whether its window is now complete.
    ///
    /// Calculated rates, unconfigured instruments and unexpected providers
    /// are ignored and leave no state behind. A completion fires once per
    /// distinct set of provider ticks.
    pub fn accept(&self, rate: &Rate) -> Option<CompletedWindow> {
        let raw = match rate {
            Rate::Raw(raw) => raw,
            Rate::Calculated(derived) => {
                debug!(symbol = %derived.symbol, "Ignoring calculated rate in window synchronizer");
                return None;
            }
        };

        let instrument = raw.instrument();
        let Some(expected) = self.settings.expected_providers.get(&instrument) else {
            debug!(instrument = %instrument, "No window configured for instrument");
            return None;
        };
        if !expected.contains(&raw.provider) {
            debug!(
                instrument = %instrument,
                provider = %raw.provider,
                "Provider not expected for instrument"
            );
            return None;
        }

        let mut window = self.windows.entry(instrument.clone()).or_default();
        window.latest.insert(raw.provider.clone(), raw.clone());
        window.last_updated = Some(raw.received_at);

        if window.latest.len() < expected.len() {
            trace!(
                instrument = %instrument,
                have = window.latest.len(),
                want = expected.len(),
                "Window waiting for providers"
            );
            return None;
        }

        let skew_ms = window.spread_ms();
        if skew_ms > self.settings.skew_tolerance.as_millis() as i64 {
            trace!(instrument = %instrument, skew_ms, "Window outside skew tolerance");
            return None;
        }

        let fingerprint = window.fingerprint();
        if window.last_fired.as_ref() == Some(&fingerprint) {
            trace!(instrument = %instrument, "Window already fired for these ticks");
            return None;
        }
        window.last_fired = Some(fingerprint);

        let rates = window
            .latest
            .iter()
            .map(|(provider, rate)| (provider.clone(), rate.clone()))
            .collect();
        debug!(instrument = %instrument, skew_ms, "Window complete");

        Some(CompletedWindow {
            instrument,
            rates,
            skew_ms,
        })
    }

    /// Evict provider slots not refreshed within the staleness threshold
    /// and drop windows left empty.
    pub fn sweep(&self) -> SweepStats {
        self.sweep_at(Utc::now())
    }

    /// [`sweep`](Self::sweep) against an explicit clock.
    pub fn sweep_at(&self, now: DateTime<Utc>) -> SweepStats {
        let staleness = chrono::Duration::from_std(self.settings.staleness_threshold)
            .unwrap_or(chrono::Duration::MAX);
        let cutoff = now.checked_sub_signed(staleness).unwrap_or(DateTime::<Utc>::MIN_UTC);

        let mut stats = SweepStats::default();
        self.windows.retain(|_, window| {
            stats.evicted_rates += window.evict_received_before(cutoff);
            let keep = !window.latest.is_empty();
            if !keep {
                stats.dropped_windows += 1;
            }
            keep
        });

        if stats.evicted_rates > 0 {
            debug!(
                evicted = stats.evicted_rates,
                dropped = stats.dropped_windows,
                "Window sweep evicted stale rates"
            );
        }
        stats
    }

    pub fn snapshot(&self, instrument: &str) -> Option<WindowSnapshot> {
        let window = self.windows.get(instrument)?;
        let mut providers: Vec<String> = window.latest.keys().cloned().collect();
        providers.sort();
        let missing = self
            .settings
            .expected_providers
            .get(instrument)
            .map(|expected| {
                expected
                    .iter()
                    .filter(|p| !window.latest.contains_key(*p))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        Some(WindowSnapshot {
            instrument: instrument.to_string(),
            providers,
            missing,
            last_updated: window.last_updated,
        })
    }

    pub fn window_count(&self) -> usize {
        self.windows.len()
    }
}
