//! Kernel symbols from `/proc/kallsyms`-format text.
//!
//! Captures embed the text as `/proc/kallsyms` or gzip-compressed as
//! `/proc/kallsyms.gz`. Each line is `<hex address> <type> <name>`, with an
//! optional trailing `[module]` that is ignored.

use super::process_info::ProcessInfo;
use super::{demangle, Symbolizer};
use crate::document::Document;
use crate::domain::{AddressContext, SymbolizeError};
use crate::progress::Progress;
use crate::strings::{IStr, Strings};
use crate::symbol::{Symbol, SymbolKind};
use flate2::read::GzDecoder;
use log::{debug, info};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::sync::OnceLock;
use tokio_util::sync::CancellationToken;

/// Size assumed for the last symbol, and how far past it lookups may reach.
pub const KALLSYMS_SLACK: u64 = 0xFFFF;

pub const KALLSYMS_FILE: &str = "/proc/kallsyms";
pub const KALLSYMS_GZ_FILE: &str = "/proc/kallsyms.gz";

const KERNEL_NICK: &str = "Linux";

/// Sorted kernel symbols with the address window they cover.
#[derive(Debug)]
pub struct KernelSymbolTable {
    entries: Vec<(u64, IStr)>,
    low: u64,
    high: u64,
    nick: IStr,
}

impl KernelSymbolTable {
    /// Parse kallsyms text. Malformed lines are skipped.
    ///
    /// Entries are sorted by address; when several share an address the
    /// first one listed wins.
    ///
    /// # Errors
    /// Returns an error if reading fails (including decompression errors).
    pub fn parse<R: BufRead>(strings: &Strings, mut reader: R) -> std::io::Result<Self> {
        let mut entries: Vec<(u64, IStr)> = Vec::new();
        let mut line = Vec::new();

        loop {
            line.clear();
            if reader.read_until(b'\n', &mut line)? == 0 {
                break;
            }

            let text = String::from_utf8_lossy(&line);
            if let Some((address, name)) = parse_line(&text) {
                let name = if name.starts_with("_R") { demangle(name) } else { name.to_string() };
                entries.push((address, strings.get(&name)));
            }
        }

        entries.sort_by_key(|(address, _)| *address);
        entries.dedup_by_key(|(address, _)| *address);

        let low = entries.first().map_or(0, |(address, _)| *address);
        let high = entries.last().map_or(0, |(address, _)| address.saturating_add(KALLSYMS_SLACK));

        Ok(Self { entries, low, high, nick: strings.get(KERNEL_NICK) })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Find the symbol containing `address`.
    ///
    /// A symbol ends where the next one begins; the last one is assumed to
    /// span [`KALLSYMS_SLACK`] bytes. Addresses outside the table's window
    /// return `None`.
    #[must_use]
    pub fn lookup(&self, address: u64) -> Option<Symbol> {
        if self.entries.is_empty() || address < self.low || address >= self.high {
            return None;
        }

        let index = self.entries.partition_point(|(begin, _)| *begin <= address);
        let (begin, name) = self.entries.get(index.checked_sub(1)?)?;
        let end = self.entries.get(index).map_or(begin.saturating_add(KALLSYMS_SLACK), |(next, _)| *next);

        Some(Symbol::new(name.clone(), None, Some(self.nick.clone()), *begin, end, SymbolKind::Kernel))
    }
}

/// Placeholder for a kernel address no table entry covers.
fn kernel_fallback(nick: &IStr, address: u64, strings: &Strings) -> Symbol {
    Symbol::new_fallback(
        strings.get(&format!("In Kernel+0x{address:x}")),
        None,
        Some(nick.clone()),
        address,
        address.saturating_add(1),
        SymbolKind::Kernel,
    )
}

fn parse_line(line: &str) -> Option<(u64, &str)> {
    let mut fields = line.split_whitespace();
    let address = u64::from_str_radix(fields.next()?, 16).ok()?;
    let kind = fields.next()?;
    if kind.len() != 1 {
        return None;
    }
    let name = fields.next()?;
    Some((address, name))
}

/// Resolves addresses in kernel context.
#[derive(Debug, Default)]
pub struct KernelSymbolizer {
    table: OnceLock<KernelSymbolTable>,
}

impl KernelSymbolizer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Use an already-parsed table.
    #[must_use]
    pub fn with_table(table: KernelSymbolTable) -> Self {
        Self { table: OnceLock::from(table) }
    }

    /// Read the analyzing machine's own `/proc/kallsyms`.
    ///
    /// Only meaningful when analyzing a capture taken on the same boot.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read.
    pub fn from_host(strings: &Strings) -> Result<Self, SymbolizeError> {
        let file = File::open(KALLSYMS_FILE)
            .map_err(|error| SymbolizeError::KernelSymbols { name: KALLSYMS_FILE.into(), error })?;
        let table = KernelSymbolTable::parse(strings, BufReader::new(file))
            .map_err(|error| SymbolizeError::KernelSymbols { name: KALLSYMS_FILE.into(), error })?;
        Ok(Self::with_table(table))
    }

    #[must_use]
    pub fn table(&self) -> Option<&KernelSymbolTable> {
        self.table.get()
    }
}

impl Symbolizer for KernelSymbolizer {
    fn name(&self) -> &'static str {
        "kernel"
    }

    fn prepare(
        &self,
        document: &Document,
        progress: &dyn Progress,
        cancel: &CancellationToken,
    ) -> Result<(), SymbolizeError> {
        if self.table.get().is_some() {
            return Ok(());
        }

        let (name, parsed) = if let Some(data) = document.lookup_file(KALLSYMS_GZ_FILE) {
            progress.report(0.0, "Decompressing kernel symbols");
            let reader = BufReader::new(GzDecoder::new(data));
            (KALLSYMS_GZ_FILE, KernelSymbolTable::parse(document.strings(), reader))
        } else if let Some(data) = document.lookup_file(KALLSYMS_FILE) {
            (KALLSYMS_FILE, KernelSymbolTable::parse(document.strings(), data))
        } else {
            debug!("Capture carries no kernel symbols");
            return Ok(());
        };

        if cancel.is_cancelled() {
            return Err(SymbolizeError::Cancelled);
        }

        let table =
            parsed.map_err(|error| SymbolizeError::KernelSymbols { name: name.to_string(), error })?;
        info!("Loaded {} kernel symbols from {name}", table.len());
        progress.report(1.0, "Decompressing kernel symbols");

        let _ = self.table.set(table);
        Ok(())
    }

    fn symbolize(
        &self,
        strings: &Strings,
        _process_info: Option<&ProcessInfo>,
        context: AddressContext,
        address: u64,
    ) -> Option<Symbol> {
        if context != AddressContext::Kernel {
            return None;
        }

        let table = self.table.get()?;
        Some(table.lookup(address).unwrap_or_else(|| kernel_fallback(&table.nick, address, strings)))
    }
}
