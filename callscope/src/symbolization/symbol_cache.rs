//! Interval cache of resolved symbols for one address space.
//!
//! One instance covers the kernel; each process gets its own for user-space.
//! Entries are keyed by their begin address and cover `[begin, end)`.
//! Resolvers produce non-overlapping ranges, so the entry with the greatest
//! begin address at or below a query is the only candidate.

use crate::symbol::Symbol;
use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

#[derive(Debug, Default)]
pub struct SymbolCache {
    entries: RwLock<BTreeMap<u64, Symbol>>,
}

impl SymbolCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Find the cached symbol whose range contains `address`.
    #[must_use]
    pub fn lookup(&self, address: u64) -> Option<Symbol> {
        if address == 0 {
            return None;
        }

        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .range(..=address)
            .next_back()
            .filter(|(_, symbol)| address < symbol.end_address())
            .map(|(_, symbol)| symbol.clone())
    }

    /// Insert `symbol` unless an entry already starts at the same address.
    ///
    /// Symbols with an empty or zero-based range are rejected. Returns
    /// whether the symbol was stored.
    pub fn insert(&self, symbol: Symbol) -> bool {
        let begin = symbol.begin_address();
        let end = symbol.end_address();

        if begin == 0 || end == 0 || begin >= end {
            return false;
        }

        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        match entries.entry(begin) {
            std::collections::btree_map::Entry::Occupied(_) => false,
            std::collections::btree_map::Entry::Vacant(slot) => {
                slot.insert(symbol);
                true
            }
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every cached symbol in address order.
    #[must_use]
    pub fn symbols(&self) -> Vec<Symbol> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strings::Strings;
    use crate::symbol::SymbolKind;

    fn sym(strings: &Strings, name: &str, begin: u64, end: u64) -> Symbol {
        Symbol::new(strings.get(name), None, None, begin, end, SymbolKind::User)
    }

    #[test]
    fn test_lookup_respects_half_open_range() {
        let strings = Strings::new();
        let cache = SymbolCache::new();
        assert!(cache.insert(sym(&strings, "foo", 0x1000, 0x1010)));

        assert!(cache.lookup(0x0fff).is_none());
        assert_eq!(cache.lookup(0x1000).unwrap().name().as_str(), "foo");
        assert_eq!(cache.lookup(0x100f).unwrap().name().as_str(), "foo");
        assert!(cache.lookup(0x1010).is_none());
    }

    #[test]
    fn test_rejects_degenerate_ranges() {
        let strings = Strings::new();
        let cache = SymbolCache::new();

        assert!(!cache.insert(sym(&strings, "zero", 0, 0x10)));
        assert!(!cache.insert(sym(&strings, "empty", 0x10, 0x10)));
        assert!(cache.is_empty());
        assert!(cache.lookup(0).is_none());
    }

    #[test]
    fn test_first_insert_wins() {
        let strings = Strings::new();
        let cache = SymbolCache::new();

        assert!(cache.insert(sym(&strings, "first", 0x2000, 0x2010)));
        assert!(!cache.insert(sym(&strings, "second", 0x2000, 0x2020)));
        assert_eq!(cache.lookup(0x2008).unwrap().name().as_str(), "first");
        assert!(cache.lookup(0x2018).is_none());
    }

    #[test]
    fn test_neighbouring_ranges() {
        let strings = Strings::new();
        let cache = SymbolCache::new();
        cache.insert(sym(&strings, "a", 0x100, 0x200));
        cache.insert(sym(&strings, "b", 0x200, 0x300));
        cache.insert(sym(&strings, "c", 0x400, 0x401));

        assert_eq!(cache.lookup(0x1ff).unwrap().name().as_str(), "a");
        assert_eq!(cache.lookup(0x200).unwrap().name().as_str(), "b");
        assert!(cache.lookup(0x350).is_none());
        assert_eq!(cache.lookup(0x400).unwrap().name().as_str(), "c");
        assert_eq!(cache.symbols().len(), 3);
    }
}
