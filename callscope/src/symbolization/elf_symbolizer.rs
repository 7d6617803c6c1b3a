//! Resolves user-space addresses against the ELF files a process mapped.

use super::address_layout::MemoryMap;
use super::elf::{Elf, ElfMatch};
use super::elf_loader::ElfLoader;
use super::jitmap::is_jit_address;
use super::process_info::ProcessInfo;
use super::Symbolizer;
use crate::domain::AddressContext;
use crate::strings::Strings;
use crate::symbol::{Symbol, SymbolKind};
use std::sync::Arc;

#[derive(Debug)]
pub struct ElfSymbolizer {
    loader: Arc<ElfLoader>,
}

impl ElfSymbolizer {
    #[must_use]
    pub fn new(loader: Arc<ElfLoader>) -> Self {
        Self { loader }
    }

    #[must_use]
    pub fn loader(&self) -> &ElfLoader {
        &self.loader
    }
}

impl Symbolizer for ElfSymbolizer {
    fn name(&self) -> &'static str {
        "elf"
    }

    fn symbolize(
        &self,
        strings: &Strings,
        process_info: Option<&ProcessInfo>,
        context: AddressContext,
        address: u64,
    ) -> Option<Symbol> {
        if !context.is_user_space() || is_jit_address(address) {
            return None;
        }

        let info = process_info?;
        let map = info.address_layout().lookup(address)?;
        let relative = map.file_relative(address);

        let elf = self.loader.load(
            Some(info.mount_namespace()),
            &map.file,
            map.build_id.as_deref(),
            map.inode,
        )?;
        let found = elf.symbol_at(relative)?;

        Some(symbol_for_match(strings, map, &elf, &found))
    }
}

/// Turn a file-offset match into a runtime-address symbol for `map`.
///
/// The range is clamped to the mapping so it can never claim addresses that
/// belong to a neighbouring map, and is at least one byte wide.
pub(crate) fn symbol_for_match(
    strings: &Strings,
    map: &MemoryMap,
    elf: &Elf,
    found: &ElfMatch,
) -> Symbol {
    let low = map.file_offset;
    let high = map.file_offset + (map.end - map.begin);

    let begin = found.begin.clamp(low, high);
    let mut end = found.end.clamp(low, high);
    if end <= begin {
        end = begin + 1;
    }

    Symbol::new(
        strings.get(&found.name),
        Some(strings.get(&map.file)),
        elf.nick().map(|nick| strings.get(nick)),
        map.begin + (begin - low),
        map.begin + (end - low),
        SymbolKind::User,
    )
}
