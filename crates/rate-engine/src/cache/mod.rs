//! Latest-value rate cache.

mod backend;
mod rate_cache;

pub use backend::{CacheBackend, InMemoryBackend};
pub use rate_cache::{
    calculated_cache_key, raw_cache_key, CacheSettings, RateCache, WriteOutcome,
    CACHE_BREAKER_NAME,
};
