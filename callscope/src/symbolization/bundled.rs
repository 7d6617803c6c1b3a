//! Symbol tables bundled into a capture, and the writer that produces them.
//!
//! # Layout
//!
//! The blob starts with fixed 32-byte records in the capture's byte order:
//!
//! ```text
//! u64 begin | u64 end | u32 pid | u32 name offset | u32 tag offset | 4 bytes padding
//! ```
//!
//! sorted by `(pid, begin)` and terminated by an all-zero record. NUL
//! terminated strings follow; offsets are measured from the start of the
//! blob. Offset 0 means "no string". The tag is shown as the binary nick.

use super::process_info::ProcessInfo;
use super::Symbolizer;
use crate::document::{Document, Endianness};
use crate::domain::{AddressContext, ExportError, SymbolizeError};
use crate::progress::Progress;
use crate::strings::Strings;
use crate::symbol::{Symbol, SymbolKind};
use byteorder::{BigEndian, ByteOrder, LittleEndian};
use log::{debug, info};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::OnceLock;
use tokio_util::sync::CancellationToken;

/// Name the bundle is stored under inside a capture.
pub const BUNDLED_SYMBOLS_FILE: &str = "__symbols__";

/// Size of one packed record.
pub const PACKED_SYMBOL_SIZE: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PackedSymbol {
    pub addr_begin: u64,
    pub addr_end: u64,
    pub pid: u32,
    pub name_offset: u32,
    pub tag_offset: u32,
}

impl PackedSymbol {
    fn is_terminator(&self) -> bool {
        *self == Self::default()
    }

    fn read<B: ByteOrder>(record: &[u8]) -> Self {
        Self {
            addr_begin: B::read_u64(&record[0..8]),
            addr_end: B::read_u64(&record[8..16]),
            pid: B::read_u32(&record[16..20]),
            name_offset: B::read_u32(&record[20..24]),
            tag_offset: B::read_u32(&record[24..28]),
        }
    }

    fn write<B: ByteOrder>(&self, out: &mut Vec<u8>) {
        let mut record = [0u8; PACKED_SYMBOL_SIZE];
        B::write_u64(&mut record[0..8], self.addr_begin);
        B::write_u64(&mut record[8..16], self.addr_end);
        B::write_u32(&mut record[16..20], self.pid);
        B::write_u32(&mut record[20..24], self.name_offset);
        B::write_u32(&mut record[24..28], self.tag_offset);
        out.extend_from_slice(&record);
    }
}

/// A parsed bundle: records plus the raw blob the string offsets point into.
#[derive(Debug)]
pub struct BundledTable {
    records: Vec<PackedSymbol>,
    blob: Vec<u8>,
}

impl BundledTable {
    /// Parse a bundle.
    ///
    /// # Errors
    /// Returns an error if the records run off the end of the blob without
    /// a terminator.
    pub fn parse(blob: Vec<u8>, endianness: Endianness) -> Result<Self, SymbolizeError> {
        let mut records = Vec::new();
        let mut chunks = blob.chunks_exact(PACKED_SYMBOL_SIZE);

        loop {
            let Some(chunk) = chunks.next() else {
                return Err(SymbolizeError::MalformedBundle(format!(
                    "no terminator after {} records",
                    records.len()
                )));
            };

            let record = match endianness {
                Endianness::Little => PackedSymbol::read::<LittleEndian>(chunk),
                Endianness::Big => PackedSymbol::read::<BigEndian>(chunk),
            };

            if record.is_terminator() {
                break;
            }
            records.push(record);
        }

        records.sort_by_key(|r| (r.pid, r.addr_begin));

        Ok(Self { records, blob })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn lookup(&self, pid: u32, address: u64) -> Option<&PackedSymbol> {
        let index = self
            .records
            .binary_search_by(|r| {
                r.pid.cmp(&pid).then_with(|| {
                    if address < r.addr_begin {
                        Ordering::Greater
                    } else if address >= r.addr_end {
                        Ordering::Less
                    } else {
                        Ordering::Equal
                    }
                })
            })
            .ok()?;
        self.records.get(index)
    }

    fn string_at(&self, offset: u32) -> Option<&str> {
        if offset == 0 {
            return None;
        }
        let tail = self.blob.get(offset as usize..)?;
        let end = tail.iter().position(|b| *b == 0)?;
        std::str::from_utf8(&tail[..end]).ok()
    }
}

/// Resolves addresses from a bundle embedded in the capture.
#[derive(Debug, Default)]
pub struct BundledSymbolizer {
    table: OnceLock<BundledTable>,
}

impl BundledSymbolizer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Symbolizer for BundledSymbolizer {
    fn name(&self) -> &'static str {
        "bundled"
    }

    fn prepare(
        &self,
        document: &Document,
        _progress: &dyn Progress,
        _cancel: &CancellationToken,
    ) -> Result<(), SymbolizeError> {
        let Some(blob) = document.lookup_file(BUNDLED_SYMBOLS_FILE) else {
            debug!("Capture carries no bundled symbols");
            return Ok(());
        };

        let table = BundledTable::parse(blob.to_vec(), document.endianness())?;
        info!("Loaded {} bundled symbols", table.len());
        let _ = self.table.set(table);
        Ok(())
    }

    fn symbolize(
        &self,
        strings: &Strings,
        process_info: Option<&ProcessInfo>,
        context: AddressContext,
        address: u64,
    ) -> Option<Symbol> {
        let table = self.table.get()?;
        let pid = process_info.map_or(0, |info| u32::try_from(info.pid().0).unwrap_or(0));
        let record = table.lookup(pid, address)?;

        let name = table.string_at(record.name_offset)?;
        let tag = table.string_at(record.tag_offset).map(|t| strings.get(t));

        let kind = if name.starts_with("- -") {
            SymbolKind::ContextSwitch
        } else if context == AddressContext::Kernel {
            SymbolKind::Kernel
        } else if name.starts_with('[') {
            SymbolKind::Process
        } else {
            SymbolKind::User
        };

        Some(Symbol::new(strings.get(name), None, tag, record.addr_begin, record.addr_end, kind))
    }
}

/// Builds a bundle from resolved symbols so a capture can be shared without
/// the binaries it references.
#[derive(Debug)]
pub struct BundleWriter {
    records: Vec<PackedSymbol>,
    strings: Vec<u8>,
    offsets: HashMap<String, u32>,
}

impl Default for BundleWriter {
    fn default() -> Self {
        // Offset 0 is reserved for the empty string.
        Self { records: Vec::new(), strings: vec![0], offsets: HashMap::from([(String::new(), 0)]) }
    }
}

impl BundleWriter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `symbol` for `pid`. Fallback symbols and empty ranges are
    /// skipped. Returns whether the symbol was added.
    pub fn add(&mut self, pid: u32, symbol: &Symbol) -> bool {
        if symbol.is_fallback() || symbol.begin_address() >= symbol.end_address() {
            return false;
        }

        let name_offset = self.intern(symbol.name());
        let tag_offset = self.intern(symbol.binary_nick().map_or("", |n| n.as_str()));

        self.records.push(PackedSymbol {
            addr_begin: symbol.begin_address(),
            addr_end: symbol.end_address(),
            pid,
            name_offset,
            tag_offset,
        });
        true
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Offset of `text` within the string section (not yet relocated).
    fn intern(&mut self, text: &str) -> u32 {
        if let Some(offset) = self.offsets.get(text) {
            return *offset;
        }
        // Truncation is caught by the size check in `finish`.
        #[allow(clippy::cast_possible_truncation)]
        let offset = self.strings.len() as u32;
        self.strings.extend_from_slice(text.as_bytes());
        self.strings.push(0);
        self.offsets.insert(text.to_string(), offset);
        offset
    }

    /// Serialize the bundle in `endianness`.
    ///
    /// # Errors
    /// Returns an error if string offsets would not fit in 32 bits.
    pub fn finish(mut self, endianness: Endianness) -> Result<Vec<u8>, ExportError> {
        self.records.sort_by_key(|r| (r.pid, r.addr_begin));
        self.records.dedup_by_key(|r| (r.pid, r.addr_begin));

        let packed_len = (self.records.len() + 1) * PACKED_SYMBOL_SIZE;
        let total = packed_len + self.strings.len();
        let base = u32::try_from(packed_len).map_err(|_| ExportError::BundleTooLarge(total))?;
        if u32::try_from(total).is_err() {
            return Err(ExportError::BundleTooLarge(total));
        }

        let relocate = |offset: u32| if offset == 0 { 0 } else { offset + base };

        let mut out = Vec::with_capacity(total);
        for record in self.records.iter().chain(std::iter::once(&PackedSymbol::default())) {
            let record = if record.is_terminator() {
                *record
            } else {
                PackedSymbol {
                    name_offset: relocate(record.name_offset),
                    tag_offset: relocate(record.tag_offset),
                    ..*record
                }
            };
            match endianness {
                Endianness::Little => record.write::<LittleEndian>(&mut out),
                Endianness::Big => record.write::<BigEndian>(&mut out),
            }
        }
        out.extend_from_slice(&self.strings);

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(strings: &Strings, name: &str, nick: Option<&str>, begin: u64, end: u64) -> Symbol {
        Symbol::new(strings.get(name), None, strings.get_non_empty(nick), begin, end, SymbolKind::User)
    }

    fn parsed(writer: BundleWriter, endianness: Endianness) -> BundledTable {
        BundledTable::parse(writer.finish(endianness).unwrap(), endianness).unwrap()
    }

    #[test]
    fn test_lookup_by_pid_and_range() {
        let strings = Strings::new();
        let mut writer = BundleWriter::new();
        writer.add(7, &user(&strings, "beta", Some("GLib"), 0x2000, 0x2100));
        writer.add(7, &user(&strings, "alpha", None, 0x1000, 0x1100));
        writer.add(9, &user(&strings, "other", None, 0x1000, 0x1100));

        let table = parsed(writer, Endianness::Big);
        assert_eq!(table.len(), 3);

        let hit = table.lookup(7, 0x2050).unwrap();
        assert_eq!(table.string_at(hit.name_offset), Some("beta"));
        assert_eq!(table.string_at(hit.tag_offset), Some("GLib"));

        let hit = table.lookup(9, 0x1000).unwrap();
        assert_eq!(table.string_at(hit.name_offset), Some("other"));
        assert_eq!(table.string_at(hit.tag_offset), None);

        assert!(table.lookup(7, 0x1100).is_none());
        assert!(table.lookup(8, 0x1000).is_none());
    }

    #[test]
    fn test_writer_skips_fallbacks() {
        let strings = Strings::new();
        let mut writer = BundleWriter::new();
        let fallback =
            Symbol::new_fallback(strings.get("In File /x+0x10"), None, None, 0x10, 0x11, SymbolKind::User);
        assert!(!writer.add(1, &fallback));
        assert!(writer.is_empty());
    }

    #[test]
    fn test_missing_terminator_is_malformed() {
        let blob = vec![1u8; PACKED_SYMBOL_SIZE * 2];
        let err = BundledTable::parse(blob, Endianness::Little).unwrap_err();
        assert!(matches!(err, SymbolizeError::MalformedBundle(_)));
    }

    #[test]
    fn test_symbol_kinds() {
        let strings = Strings::new();
        let mut writer = BundleWriter::new();
        writer.add(0, &user(&strings, "- - Kernel - -", None, 0x10, 0x20));
        writer.add(0, &user(&strings, "[heap]", None, 0x20, 0x30));
        writer.add(0, &user(&strings, "main", None, 0x30, 0x40));

        let bundled = BundledSymbolizer::new();
        let _ = bundled.table.set(parsed(writer, Endianness::Little));

        let kind = |context, address| bundled.symbolize(&strings, None, context, address).unwrap().kind();
        assert_eq!(kind(AddressContext::User, 0x10), SymbolKind::ContextSwitch);
        assert_eq!(kind(AddressContext::User, 0x20), SymbolKind::Process);
        assert_eq!(kind(AddressContext::User, 0x30), SymbolKind::User);
        assert_eq!(kind(AddressContext::Kernel, 0x30), SymbolKind::Kernel);

        let main = bundled.symbolize(&strings, None, AddressContext::User, 0x35).unwrap();
        assert_eq!(main.binary_path(), None);
        assert_eq!((main.begin_address(), main.end_address()), (0x30, 0x40));
    }
}
