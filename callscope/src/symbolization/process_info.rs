//! Everything known about one traced process.

use super::address_layout::AddressLayout;
use super::mount_namespace::MountNamespace;
use super::symbol_cache::SymbolCache;
use crate::domain::Pid;
use crate::strings::Strings;
use crate::symbol::{Symbol, SymbolKind};
use std::fmt;
use std::sync::Arc;

pub struct ProcessInfo {
    pid: Pid,
    address_layout: AddressLayout,
    mount_namespace: Arc<dyn MountNamespace>,
    symbol_cache: SymbolCache,
    /// Full command line, distinct per pid
    symbol: Symbol,
    /// First word of the command line, shared across pids
    shared_symbol: Symbol,
    fallback_symbol: Symbol,
}

impl ProcessInfo {
    /// Build the process record and its display symbols.
    ///
    /// Without a command line every symbol is `Process <pid>`.
    pub fn new(
        strings: &Strings,
        pid: Pid,
        cmdline: Option<&str>,
        address_layout: AddressLayout,
        mount_namespace: Arc<dyn MountNamespace>,
    ) -> Self {
        let nick = strings.get(&format!("({})", pid.0));
        let fallback_symbol = Symbol::new(
            strings.get(&format!("Process {}", pid.0)),
            None,
            Some(nick.clone()),
            0,
            0,
            SymbolKind::Process,
        );

        let cmdline = cmdline.map(str::trim).filter(|c| !c.is_empty());

        let symbol = cmdline.map_or_else(
            || fallback_symbol.clone(),
            |cmdline| Symbol::new(strings.get(cmdline), None, Some(nick), 0, 0, SymbolKind::Process),
        );

        let shared_symbol = cmdline
            .and_then(|cmdline| cmdline.split_whitespace().next())
            .map_or_else(
                || fallback_symbol.clone(),
                |command| Symbol::new(strings.get(command), None, None, 0, 0, SymbolKind::Process),
            );

        Self {
            pid,
            address_layout,
            mount_namespace,
            symbol_cache: SymbolCache::new(),
            symbol,
            shared_symbol,
            fallback_symbol,
        }
    }

    #[must_use]
    pub fn pid(&self) -> Pid {
        self.pid
    }

    #[must_use]
    pub fn address_layout(&self) -> &AddressLayout {
        &self.address_layout
    }

    #[must_use]
    pub fn mount_namespace(&self) -> &dyn MountNamespace {
        self.mount_namespace.as_ref()
    }

    #[must_use]
    pub fn symbol_cache(&self) -> &SymbolCache {
        &self.symbol_cache
    }

    #[must_use]
    pub fn symbol(&self) -> &Symbol {
        &self.symbol
    }

    #[must_use]
    pub fn shared_symbol(&self) -> &Symbol {
        &self.shared_symbol
    }

    #[must_use]
    pub fn fallback_symbol(&self) -> &Symbol {
        &self.fallback_symbol
    }
}

impl fmt::Debug for ProcessInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessInfo")
            .field("pid", &self.pid)
            .field("symbol", &self.symbol.name())
            .field("maps", &self.address_layout.maps().len())
            .field("cached_symbols", &self.symbol_cache.len())
            .finish_non_exhaustive()
    }
}
