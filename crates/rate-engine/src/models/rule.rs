//! Calculation rule model.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Default decimal places for calculated prices.
pub const DEFAULT_SCALE: u32 = 6;

/// Family of calculation a rule asks for.
///
/// Used as the fallback key when no strategy is registered under the
/// rule's exact strategy id.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RuleKind {
    /// Average across providers of one instrument.
    Avg,
    /// Cross rate built from two other rates.
    Cross,
    /// Anything else; only resolvable by exact strategy id.
    Custom,
}

impl fmt::Display for RuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Avg => write!(f, "AVG"),
            Self::Cross => write!(f, "CROSS"),
            Self::Custom => write!(f, "CUSTOM"),
        }
    }
}

/// A configured derivation: which inputs produce which output, and how.
///
/// Rules are loaded once at startup and never mutated afterwards.
/// Lower `priority` values are evaluated first.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalculationRule {
    pub output_symbol: String,
    pub kind: RuleKind,
    /// Exact strategy id; empty means "resolve by kind".
    #[serde(default)]
    pub strategy_id: String,
    /// Raw keys (`<provider>_<INSTRUMENT>`).
    #[serde(default)]
    pub depends_on_raw: Vec<String>,
    /// Calculated symbols (e.g. `USDTRY_AVG`).
    #[serde(default)]
    pub depends_on_calculated: Vec<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, String>,
}

impl CalculationRule {
    pub fn new(output_symbol: impl Into<String>, kind: RuleKind, strategy_id: impl Into<String>) -> Self {
        Self {
            output_symbol: output_symbol.into(),
            kind,
            strategy_id: strategy_id.into(),
            depends_on_raw: Vec::new(),
            depends_on_calculated: Vec::new(),
            priority: 0,
            description: None,
            parameters: BTreeMap::new(),
        }
    }

    pub fn with_raw<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on_raw.extend(keys.into_iter().map(Into::into));
        self
    }

    pub fn with_calculated<I, S>(mut self, symbols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on_calculated
            .extend(symbols.into_iter().map(Into::into));
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn parameter(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).map(String::as_str)
    }

    /// Decimal places for the output, from the `scale` parameter.
    pub fn scale(&self) -> u32 {
        self.parameter("scale")
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(DEFAULT_SCALE)
    }

    /// Every dependency key, raw first.
    pub fn dependencies(&self) -> impl Iterator<Item = &str> {
        self.depends_on_raw
            .iter()
            .chain(self.depends_on_calculated.iter())
            .map(String::as_str)
    }

    pub fn has_dependencies(&self) -> bool {
        !self.depends_on_raw.is_empty() || !self.depends_on_calculated.is_empty()
    }
}
