//! Typed rate cache over a [`CacheBackend`].
//!
//! Raw and calculated rates live in separate key namespaces with independent
//! TTLs:
//!
//! ```text
//! raw_rate:<provider>:<INSTRUMENT>   -> RawRate JSON      (raw TTL)
//! calc_rate:<SYMBOL>                 -> DerivedRate JSON  (calculated TTL)
//! ```
//!
//! Every backend call runs under the cache's circuit breaker with an
//! operation timeout. Reads that fail come back as `None`; writes that fail
//! are logged and dropped. The pipeline never sees a cache error.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use super::backend::CacheBackend;
use crate::errors::{BackendError, EngineError};
use crate::models::symbol::{base_instrument, calculated_symbol};
use crate::models::{DerivedRate, RawRate};
use crate::resilience::{CircuitBreaker, CircuitBreakerConfig, CircuitMetrics};

const RAW_KEY_PREFIX: &str = "raw_rate:";
const CALCULATED_KEY_PREFIX: &str = "calc_rate:";

/// Breaker name used in logs and health output.
pub const CACHE_BREAKER_NAME: &str = "rate-cache";

/// TTL and timeout settings for [`RateCache`].
#[derive(Clone, Debug, PartialEq)]
pub struct CacheSettings {
    pub raw_ttl: Duration,
    pub calculated_ttl: Duration,
    pub operation_timeout: Duration,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            raw_ttl: Duration::from_secs(3600),
            calculated_ttl: Duration::from_secs(1800),
            operation_timeout: Duration::from_millis(250),
        }
    }
}

/// What a write did to the backend.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WriteOutcome {
    /// Value stored with a fresh TTL.
    Written,
    /// Bid and ask were unchanged; only the TTL was refreshed.
    Refreshed,
    /// The backend rejected the write or the circuit was open.
    Dropped,
}

pub fn raw_cache_key(provider: &str, symbol: &str) -> String {
    format!("{}{}:{}", RAW_KEY_PREFIX, provider.trim(), base_instrument(symbol))
}

pub fn calculated_cache_key(symbol: &str) -> String {
    format!("{}{}", CALCULATED_KEY_PREFIX, calculated_symbol(symbol))
}

/// Latest raw and calculated rates, guarded by a circuit breaker.
pub struct RateCache {
    backend: Arc<dyn CacheBackend>,
    breaker: CircuitBreaker,
    settings: CacheSettings,
}

impl RateCache {
    pub fn new(
        backend: Arc<dyn CacheBackend>,
        settings: CacheSettings,
        breaker_config: CircuitBreakerConfig,
    ) -> Self {
        Self {
            backend,
            breaker: CircuitBreaker::with_config(CACHE_BREAKER_NAME, breaker_config),
            settings,
        }
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    /// Runs a backend call with timeout under the breaker.
    async fn guarded<T, F, Fut>(&self, op: F) -> Result<T, EngineError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, BackendError>>,
    {
        let timeout = self.settings.operation_timeout;
        self.breaker
            .execute(|| async move {
                match tokio::time::timeout(timeout, op()).await {
                    Ok(result) => result,
                    Err(_) => Err(BackendError::Timeout(timeout.as_millis() as u64)),
                }
            })
            .await
            .map_err(EngineError::from)
    }

    async fn read<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let stored = match self.guarded(|| self.backend.get(key)).await {
            Ok(stored) => stored?,
            Err(e) => {
                debug!(key, error = %e, "Cache read failed, treating as absent");
                return None;
            }
        };

        match serde_json::from_str(&stored) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key, error = %e, "Undecodable cache value, treating as absent");
                None
            }
        }
    }

    async fn write(&self, key: &str, value: String, ttl: Duration) -> WriteOutcome {
        match self
            .guarded(|| self.backend.set_with_ttl(key, value, ttl))
            .await
        {
            Ok(()) => WriteOutcome::Written,
            Err(e) => {
                warn!(key, error = %e, "Cache write dropped");
                WriteOutcome::Dropped
            }
        }
    }

    /// Store the latest raw rate for its provider and instrument.
    ///
    /// If the stored value has the same bid and ask, only its TTL is
    /// refreshed and the stored bytes stay as they were.
    pub async fn put_raw(&self, rate: &RawRate) -> WriteOutcome {
        let key = raw_cache_key(&rate.provider, &rate.symbol);
        let ttl = self.settings.raw_ttl;

        if let Some(existing) = self.read::<RawRate>(&key).await {
            if existing.same_quote(rate) {
                match self.guarded(|| self.backend.expire(&key, ttl)).await {
                    Ok(true) => {
                        debug!(key = %key, "Raw rate unchanged, TTL refreshed");
                        return WriteOutcome::Refreshed;
                    }
                    // Key expired between the read and the refresh
                    Ok(false) => {}
                    Err(e) => {
                        warn!(key = %key, error = %e, "Cache TTL refresh dropped");
                        return WriteOutcome::Dropped;
                    }
                }
            }
        }

        match serde_json::to_string(rate) {
            Ok(value) => self.write(&key, value, ttl).await,
            Err(e) => {
                warn!(key = %key, error = %e, "Could not encode raw rate");
                WriteOutcome::Dropped
            }
        }
    }

    /// Store the latest calculated rate, overwriting any previous value.
    pub async fn put_calculated(&self, rate: &DerivedRate) -> WriteOutcome {
        let key = calculated_cache_key(&rate.symbol);
        match serde_json::to_string(rate) {
            Ok(value) => self.write(&key, value, self.settings.calculated_ttl).await,
            Err(e) => {
                warn!(key = %key, error = %e, "Could not encode calculated rate");
                WriteOutcome::Dropped
            }
        }
    }

    /// Latest raw rate for `symbol` from `provider`.
    pub async fn get_raw(&self, symbol: &str, provider: &str) -> Option<RawRate> {
        self.read(&raw_cache_key(provider, symbol)).await
    }

    /// Latest calculated rate for `symbol`.
    pub async fn get_calculated(&self, symbol: &str) -> Option<DerivedRate> {
        self.read(&calculated_cache_key(symbol)).await
    }

    /// True when the breaker permits calls and the backend answers a ping.
    pub async fn is_available(&self) -> bool {
        self.guarded(|| self.backend.ping()).await.is_ok()
    }

    pub fn breaker_metrics(&self) -> CircuitMetrics {
        self.breaker.metrics()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryBackend;
    use crate::models::{InputRate, RateKind};
    use crate::resilience::CircuitState;
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone, Utc};
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Counts backend calls and can be switched into failure mode.
    #[derive(Default)]
    struct SpyBackend {
        inner: InMemoryBackend,
        sets: AtomicUsize,
        expires: AtomicUsize,
        gets: AtomicUsize,
        failing: AtomicBool,
    }

    impl SpyBackend {
        fn check(&self) -> Result<(), BackendError> {
            if self.failing.load(Ordering::SeqCst) {
                Err(BackendError::Unavailable("connection refused".into()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl CacheBackend for SpyBackend {
        async fn get(&self, key: &str) -> Result<Option<String>, BackendError> {
            self.gets.fetch_add(1, Ordering::SeqCst);
            self.check()?;
            self.inner.get(key).await
        }

        async fn set_with_ttl(
            &self,
            key: &str,
            value: String,
            ttl: Duration,
        ) -> Result<(), BackendError> {
            self.sets.fetch_add(1, Ordering::SeqCst);
            self.check()?;
            self.inner.set_with_ttl(key, value, ttl).await
        }

        async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, BackendError> {
            self.expires.fetch_add(1, Ordering::SeqCst);
            self.check()?;
            self.inner.expire(key, ttl).await
        }

        async fn ping(&self) -> Result<(), BackendError> {
            self.check()
        }
    }

    struct SlowBackend;

    #[async_trait]
    impl CacheBackend for SlowBackend {
        async fn get(&self, _key: &str) -> Result<Option<String>, BackendError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(None)
        }
        async fn set_with_ttl(&self, _: &str, _: String, _: Duration) -> Result<(), BackendError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        }
        async fn expire(&self, _: &str, _: Duration) -> Result<bool, BackendError> {
            Ok(false)
        }
        async fn ping(&self) -> Result<(), BackendError> {
            Ok(())
        }
    }

    fn ts(secs: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, secs).unwrap()
    }

    fn cache_over(backend: Arc<dyn CacheBackend>, failures: u32) -> RateCache {
        RateCache::new(
            backend,
            CacheSettings::default(),
            CircuitBreakerConfig {
                failure_threshold: failures,
                recovery_timeout: Duration::from_secs(60),
                half_open_success_threshold: 1,
            },
        )
    }

    fn derived(symbol: &str) -> DerivedRate {
        DerivedRate {
            symbol: symbol.to_string(),
            bid: dec!(35.1),
            ask: dec!(35.3),
            event_timestamp: ts(0),
            source_strategy: "CROSS".into(),
            inputs: vec![InputRate {
                key: "EURUSD_AVG".into(),
                symbol: "EURUSD_AVG".into(),
                provider: None,
                kind: RateKind::Calculated,
                bid: dec!(1.08),
                ask: dec!(1.09),
                event_timestamp: ts(0),
            }],
            calculated_at: ts(1),
        }
    }

    #[test]
    fn test_key_namespaces() {
        assert_eq!(raw_cache_key("PF1", "PF1_USDTRY"), "raw_rate:PF1:USDTRY");
        assert_eq!(raw_cache_key("PF1", "usd/try"), "raw_rate:PF1:USDTRY");
        assert_eq!(calculated_cache_key("usdtry_avg"), "calc_rate:USDTRY_AVG");
    }

    #[tokio::test]
    async fn test_unchanged_raw_rate_only_refreshes_ttl() {
        let spy = Arc::new(SpyBackend::default());
        let cache = cache_over(spy.clone(), 5);

        let first = RawRate::new("PF1", "PF1_USDTRY", dec!(32.10), dec!(32.20), ts(0));
        let again = RawRate::new("PF1", "PF1_USDTRY", dec!(32.10), dec!(32.20), ts(7));

        assert_eq!(cache.put_raw(&first).await, WriteOutcome::Written);
        let stored_before = spy.inner.get("raw_rate:PF1:USDTRY").await.unwrap();

        assert_eq!(cache.put_raw(&again).await, WriteOutcome::Refreshed);
        let stored_after = spy.inner.get("raw_rate:PF1:USDTRY").await.unwrap();

        assert_eq!(spy.sets.load(Ordering::SeqCst), 1);
        assert_eq!(spy.expires.load(Ordering::SeqCst), 1);
        assert_eq!(stored_before, stored_after);
    }

    #[tokio::test]
    async fn test_changed_raw_rate_is_rewritten() {
        let spy = Arc::new(SpyBackend::default());
        let cache = cache_over(spy.clone(), 5);

        cache
            .put_raw(&RawRate::new("PF1", "USDTRY", dec!(32.10), dec!(32.20), ts(0)))
            .await;
        let outcome = cache
            .put_raw(&RawRate::new("PF1", "USDTRY", dec!(32.11), dec!(32.20), ts(1)))
            .await;

        assert_eq!(outcome, WriteOutcome::Written);
        assert_eq!(spy.sets.load(Ordering::SeqCst), 2);
        assert_eq!(spy.expires.load(Ordering::SeqCst), 0);
        let cached = cache.get_raw("USDTRY", "PF1").await.unwrap();
        assert_eq!(cached.bid, dec!(32.11));
    }

    #[tokio::test]
    async fn test_calculated_round_trip() {
        let cache = cache_over(Arc::new(InMemoryBackend::new()), 5);
        assert!(cache.get_calculated("EURTRY").await.is_none());

        assert_eq!(cache.put_calculated(&derived("EURTRY")).await, WriteOutcome::Written);
        let cached = cache.get_calculated("eurtry").await.unwrap();
        assert_eq!(cached, derived("EURTRY"));
    }

    #[tokio::test]
    async fn test_backend_failure_reads_absent_and_drops_writes() {
        let spy = Arc::new(SpyBackend::default());
        let cache = cache_over(spy.clone(), 10);
        cache.put_calculated(&derived("EURTRY")).await;

        spy.failing.store(true, Ordering::SeqCst);

        assert!(cache.get_calculated("EURTRY").await.is_none());
        assert_eq!(cache.put_calculated(&derived("EURTRY")).await, WriteOutcome::Dropped);
        assert!(!cache.is_available().await);
    }

    #[tokio::test]
    async fn test_open_circuit_skips_backend() {
        let spy = Arc::new(SpyBackend::default());
        let cache = cache_over(spy.clone(), 2);
        spy.failing.store(true, Ordering::SeqCst);

        cache.get_calculated("A").await;
        cache.get_calculated("B").await;
        assert_eq!(cache.breaker_metrics().state, CircuitState::Open);

        let calls_before = spy.gets.load(Ordering::SeqCst);
        assert!(cache.get_calculated("C").await.is_none());
        assert_eq!(spy.gets.load(Ordering::SeqCst), calls_before);
    }

    #[tokio::test]
    async fn test_undecodable_value_is_absent() {
        let backend = Arc::new(InMemoryBackend::new());
        backend
            .set_with_ttl("calc_rate:EURTRY", "not json".into(), Duration::from_secs(60))
            .await
            .unwrap();
        let cache = cache_over(backend, 5);
        assert!(cache.get_calculated("EURTRY").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_backend_times_out_as_failure() {
        let cache = cache_over(Arc::new(SlowBackend), 1);
        assert!(cache.get_calculated("EURTRY").await.is_none());
        assert_eq!(cache.breaker_metrics().state, CircuitState::Open);
    }
}
