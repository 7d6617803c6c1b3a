//! Names for JIT-compiled code, recorded by the runtime in the capture.
//!
//! JIT addresses are synthetic: the top 32 bits are `0xE0000000` and the low
//! 16 bits are the 1-based position of the entry in the map, which makes the
//! common lookup a single index.

use super::process_info::ProcessInfo;
use super::Symbolizer;
use crate::document::{Document, JitEntry};
use crate::domain::{AddressContext, SymbolizeError};
use crate::progress::Progress;
use crate::strings::Strings;
use crate::symbol::{Symbol, SymbolKind};
use log::debug;
use std::sync::OnceLock;
use tokio_util::sync::CancellationToken;

pub const JIT_ADDRESS_MASK: u64 = 0xFFFF_FFFF_0000_0000;
pub const JIT_ADDRESS_TAG: u64 = 0xE000_0000_0000_0000;

/// Whether `address` falls in the synthetic JIT range.
#[must_use]
pub fn is_jit_address(address: u64) -> bool {
    address & JIT_ADDRESS_MASK == JIT_ADDRESS_TAG
}

#[derive(Debug, Default)]
pub struct JitmapSymbolizer {
    entries: OnceLock<Vec<JitEntry>>,
}

impl JitmapSymbolizer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `entries` directly instead of reading them from a document.
    #[must_use]
    pub fn with_entries(mut entries: Vec<JitEntry>) -> Self {
        entries.sort_by_key(|e| e.address);
        Self { entries: OnceLock::from(entries) }
    }

    fn find(&self, address: u64) -> Option<&JitEntry> {
        let entries = self.entries.get()?;

        #[allow(clippy::cast_possible_truncation)]
        let guess = ((address & 0xFFFF) as usize).checked_sub(1);
        if let Some(entry) = guess.and_then(|i| entries.get(i)) {
            if entry.address == address {
                return Some(entry);
            }
        }

        let index = entries.binary_search_by_key(&address, |e| e.address).ok()?;
        entries.get(index)
    }
}

impl Symbolizer for JitmapSymbolizer {
    fn name(&self) -> &'static str {
        "jitmap"
    }

    fn prepare(
        &self,
        document: &Document,
        _progress: &dyn Progress,
        _cancel: &CancellationToken,
    ) -> Result<(), SymbolizeError> {
        let mut entries = document.jitmap().to_vec();
        entries.sort_by_key(|e| e.address);
        debug!("JIT map: {} entries", entries.len());
        let _ = self.entries.set(entries);
        Ok(())
    }

    fn symbolize(
        &self,
        strings: &Strings,
        _process_info: Option<&ProcessInfo>,
        context: AddressContext,
        address: u64,
    ) -> Option<Symbol> {
        if !context.is_user_space() || !is_jit_address(address) {
            return None;
        }

        let entry = self.find(address)?;
        Some(Symbol::new(strings.get(&entry.name), None, None, address, address + 1, SymbolKind::User))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(address: u64, name: &str) -> JitEntry {
        JitEntry { address, name: name.to_string() }
    }

    #[test]
    fn test_is_jit_address() {
        assert!(is_jit_address(0xE000_0000_0000_0001));
        assert!(!is_jit_address(0xE000_0001_0000_0001));
        assert!(!is_jit_address(0x7f00_0000_1000));
    }

    #[test]
    fn test_lookup_by_index_and_search() {
        let strings = Strings::new();
        let jit = JitmapSymbolizer::with_entries(vec![
            entry(0xE000_0000_0000_0002, "second"),
            entry(0xE000_0000_0000_0001, "first"),
            // Index hint does not match its position
            entry(0xE000_0000_0000_0009, "ninth"),
        ]);

        let sym = jit.symbolize(&strings, None, AddressContext::User, 0xE000_0000_0000_0001).unwrap();
        assert_eq!(sym.name().as_str(), "first");
        assert_eq!(sym.end_address(), 0xE000_0000_0000_0002);

        let sym = jit.symbolize(&strings, None, AddressContext::None, 0xE000_0000_0000_0009).unwrap();
        assert_eq!(sym.name().as_str(), "ninth");
    }

    #[test]
    fn test_rejects_kernel_and_unknown() {
        let strings = Strings::new();
        let jit = JitmapSymbolizer::with_entries(vec![entry(0xE000_0000_0000_0001, "first")]);

        assert!(jit.symbolize(&strings, None, AddressContext::Kernel, 0xE000_0000_0000_0001).is_none());
        assert!(jit.symbolize(&strings, None, AddressContext::User, 0xE000_0000_0000_0005).is_none());
        assert!(jit.symbolize(&strings, None, AddressContext::User, 0x1000).is_none());
    }
}
