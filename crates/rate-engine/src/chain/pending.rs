//! Outputs waiting on calculated inputs.

use dashmap::DashSet;

/// Output symbols whose rule was blocked on a missing calculated input.
///
/// Membership is only a hint that a re-check is worthwhile; every
/// re-evaluation validates all inputs again.
#[derive(Debug, Default)]
pub struct PendingSet {
    symbols: DashSet<String>,
}

impl PendingSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if the symbol was not already pending.
    pub fn add(&self, symbol: &str) -> bool {
        self.symbols.insert(symbol.to_string())
    }

    /// Returns `true` if the symbol was pending.
    pub fn remove(&self, symbol: &str) -> bool {
        self.symbols.remove(symbol).is_some()
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.symbols.contains(symbol)
    }

    /// Sorted copy of the current members.
    pub fn snapshot(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.symbols.iter().map(|s| s.key().clone()).collect();
        symbols.sort();
        symbols
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_remove() {
        let pending = PendingSet::new();
        assert!(pending.add("EURTRY"));
        assert!(!pending.add("EURTRY"));
        assert!(pending.contains("EURTRY"));
        assert_eq!(pending.len(), 1);

        assert!(pending.remove("EURTRY"));
        assert!(!pending.remove("EURTRY"));
        assert!(pending.is_empty());
    }

    #[test]
    fn test_snapshot_is_sorted() {
        let pending = PendingSet::new();
        pending.add("GBPTRY");
        pending.add("EURTRY");
        assert_eq!(pending.snapshot(), vec!["EURTRY", "GBPTRY"]);
    }
}
