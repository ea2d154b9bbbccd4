//! Symbol conventions shared by the window, the rule graph and the cache.
//!
//! Providers publish instrument symbols in several shapes:
//!
//! | Shape | Example | Base instrument |
//! |-------|---------|-----------------|
//! | Provider-prefixed | `RESTProvider1_USDTRY` | `USDTRY` |
//! | Derived suffix | `USDTRY_AVG`, `EURUSD_CROSS` | `USDTRY`, `EURUSD` |
//! | Slash separated | `USD/TRY` | `USDTRY` |
//! | Cache-key form | `CALC_RATE:USDTRY_AVG` | `USDTRY` |
//!
//! Raw dependencies in rules are written as `<provider>_<INSTRUMENT>`
//! (a "raw key"). The provider part keeps its case; the instrument part is
//! always normalized.

/// Suffixes marking a derived symbol.
const DERIVED_SUFFIXES: [&str; 3] = ["AVG", "CROSS", "CALC"];

/// Prefix some producers leave on calculated symbols.
const CALCULATED_KEY_PREFIX: &str = "CALC_RATE:";

/// Upper-cases, trims and removes `/` separators.
pub fn normalize(symbol: &str) -> String {
    symbol.trim().to_uppercase().replace('/', "")
}

/// Derives the base instrument of any symbol shape.
///
/// Returns an empty string for blank input.
///
/// ```
/// use ratefeed_engine::models::symbol::base_instrument;
///
/// assert_eq!(base_instrument("RESTProvider1_USDTRY"), "USDTRY");
/// assert_eq!(base_instrument("USDTRY_AVG"), "USDTRY");
/// assert_eq!(base_instrument("USD/TRY"), "USDTRY");
/// ```
pub fn base_instrument(symbol: &str) -> String {
    let normalized = normalize(symbol);
    let stripped = normalized
        .strip_prefix(CALCULATED_KEY_PREFIX)
        .unwrap_or(&normalized);

    let parts: Vec<&str> = stripped.split('_').filter(|p| !p.is_empty()).collect();
    match parts.as_slice() {
        [] => String::new(),
        [only] => (*only).to_string(),
        [.., before, last] if DERIVED_SUFFIXES.contains(last) => (*before).to_string(),
        [.., last] => (*last).to_string(),
    }
}

/// Normalizes a calculated symbol as used for rule outputs and cache keys.
pub fn calculated_symbol(symbol: &str) -> String {
    let normalized = normalize(symbol);
    normalized
        .strip_prefix(CALCULATED_KEY_PREFIX)
        .map(str::to_string)
        .unwrap_or(normalized)
}

/// Builds the raw key identifying one provider's feed for an instrument.
pub fn raw_key(provider: &str, instrument: &str) -> String {
    format!("{}_{}", provider.trim(), base_instrument(instrument))
}

/// Splits a raw key into `(provider, instrument)`.
///
/// The split happens at the last `_`, so provider names may contain
/// underscores themselves.
pub fn split_raw_key(key: &str) -> Option<(String, String)> {
    let (provider, instrument) = key.trim().rsplit_once('_')?;
    if provider.is_empty() || instrument.is_empty() {
        return None;
    }
    Some((provider.to_string(), normalize(instrument)))
}

/// Re-normalizes the instrument half of a raw key.
pub fn normalize_raw_key(key: &str) -> Option<String> {
    split_raw_key(key).map(|(provider, instrument)| raw_key(&provider, &instrument))
}
