//! A parsed ELF file: function symbols, `.text` placement, build-id and
//! debug link.
//!
//! Lookups take *file offsets* (what a process mapping gives us) and return
//! ranges in file-offset space. A file loaded from a separate debug file is
//! attached through [`Elf::set_debug_link_elf`] and consulted first, using
//! the outer file's `.text` offset since debug files carry `.text` as
//! `NOBITS`.

use super::demangle;
use addr2line::Context;
use gimli::{EndianArcSlice, RunTimeEndian};
use object::{Object, ObjectSection, ObjectSymbol, SymbolKind};
use std::borrow::Cow;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

/// How many attached debug files a lookup will descend through.
pub const MAX_DEBUG_LINK_DEPTH: usize = 8;

/// Short display names for well-known shared libraries, keyed by the file
/// name up to and including `.so`.
const LIBRARY_NICKS: &[(&str, &str)] = &[
    ("libc.so", "libc"),
    ("libstdc++.so", "libc"),
    ("libm.so", "libc"),
    ("libpthread.so", "libc"),
    ("libdl.so", "libc"),
    ("ld-linux-x86-64.so", "glibc"),
    ("ld-linux-aarch64.so", "glibc"),
    ("libglib-2.0.so", "GLib"),
    ("libgobject-2.0.so", "GObject"),
    ("libgio-2.0.so", "Gio"),
    ("libgirepository-1.0.so", "Introspection"),
    ("libgtk-4.so", "GTK 4"),
    ("libgtk-3.so", "GTK 3"),
    ("libgdk-3.so", "GTK 3"),
    ("libadwaita-1.so", "Adwaita"),
    ("libcairo.so", "Cairo"),
    ("libpixman-1.so", "Pixman"),
    ("libpango-1.0.so", "Pango"),
    ("libpangocairo-1.0.so", "Pango"),
    ("libpangoft2-1.0.so", "Pango"),
    ("libharfbuzz.so", "Harfbuzz"),
    ("libfreetype.so", "FreeType"),
    ("libfontconfig.so", "Fontconfig"),
    ("libmozjs-115.so", "JS"),
    ("libmozjs-128.so", "JS"),
    ("libgjs.so", "GJS"),
    ("libEGL.so", "EGL"),
    ("libEGL_mesa.so", "EGL"),
    ("libGLX.so", "GLX"),
    ("libGLX_mesa.so", "GLX"),
    ("libvulkan.so", "Vulkan"),
    ("libX11.so", "X11"),
    ("libxcb.so", "X11"),
    ("libwayland-client.so", "Wayland"),
    ("libwayland-server.so", "Wayland"),
    ("libdbus-1.so", "D-Bus"),
    ("libsystemd.so", "systemd"),
    ("libffi.so", "libffi"),
    ("libz.so", "Zlib"),
    ("libzstd.so", "Zstd"),
    ("liblzma.so", "LZMA"),
    ("libssl.so", "OpenSSL"),
    ("libcrypto.so", "OpenSSL"),
    ("libxul.so", "XUL"),
    ("libpython3.so", "Python"),
    ("libLLVM.so", "LLVM"),
];

/// A symbol match, in file-offset space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElfMatch {
    pub name: String,
    pub begin: u64,
    pub end: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TextSection {
    address: u64,
    offset: u64,
    size: u64,
}

#[derive(Debug, Clone)]
struct ElfSymbol {
    address: u64,
    size: u64,
    name: String,
}

type DwarfContext = Context<EndianArcSlice<RunTimeEndian>>;

pub struct Elf {
    file: String,
    inode: u64,
    build_id: Option<String>,
    debug_link: Option<String>,
    nick: Option<&'static str>,
    text: Option<TextSection>,
    /// Function symbols sorted by address
    symbols: Vec<ElfSymbol>,
    /// Only built when the symbol tables are empty
    dwarf: Option<Mutex<DwarfContext>>,
    debug_link_elf: RwLock<Option<Arc<Elf>>>,
    annotated: AtomicBool,
}

impl Elf {
    /// Parse `data` as an ELF object. `file` is the path it was read from.
    ///
    /// # Errors
    /// Returns an error if `data` is not a parseable object file.
    pub fn parse(file: &str, data: &[u8], inode: u64) -> Result<Self, object::Error> {
        let obj = object::File::parse(data)?;

        let build_id = obj.build_id().ok().flatten().map(hex_string);
        let debug_link = obj
            .gnu_debuglink()
            .ok()
            .flatten()
            .map(|(name, _crc)| String::from_utf8_lossy(name).into_owned())
            .filter(|name| !name.is_empty());

        let text = obj.section_by_name(".text").map(|section| TextSection {
            address: section.address(),
            offset: section.file_range().map_or(0, |(offset, _)| offset),
            size: section.size(),
        });

        let mut symbols = collect_functions(obj.symbols());
        if symbols.is_empty() {
            symbols = collect_functions(obj.dynamic_symbols());
        }

        let dwarf = if symbols.is_empty() { load_dwarf(&obj).map(Mutex::new) } else { None };

        Ok(Self {
            file: file.to_string(),
            inode,
            build_id,
            debug_link,
            nick: guess_nick(file),
            text,
            symbols,
            dwarf,
            debug_link_elf: RwLock::new(None),
            annotated: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub fn file(&self) -> &str {
        &self.file
    }

    #[must_use]
    pub fn inode(&self) -> u64 {
        self.inode
    }

    /// Lowercase hex build-id from `.note.gnu.build-id`
    #[must_use]
    pub fn build_id(&self) -> Option<&str> {
        self.build_id.as_deref()
    }

    /// File name from `.gnu_debuglink`
    #[must_use]
    pub fn debug_link(&self) -> Option<&str> {
        self.debug_link.as_deref()
    }

    #[must_use]
    pub fn nick(&self) -> Option<&'static str> {
        self.nick
    }

    #[must_use]
    pub fn symbol_count(&self) -> usize {
        self.symbols.len()
    }

    /// Whether this file is the one a mapping expects.
    ///
    /// Build-ids (compared case-insensitively) must agree when both sides
    /// have one; inodes must agree when both are nonzero.
    #[must_use]
    pub fn matches(&self, build_id: Option<&str>, inode: u64) -> bool {
        if let (Some(want), Some(have)) = (build_id, self.build_id.as_deref()) {
            if !want.eq_ignore_ascii_case(have) {
                return false;
            }
        }

        inode == 0 || self.inode == 0 || inode == self.inode
    }

    #[must_use]
    pub fn debug_link_elf(&self) -> Option<Arc<Elf>> {
        self.debug_link_elf.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn set_debug_link_elf(&self, elf: Arc<Elf>) {
        *self.debug_link_elf.write().unwrap_or_else(PoisonError::into_inner) = Some(elf);
    }

    /// Claim the one-time debug-link search. Returns `false` if it was
    /// already claimed.
    pub(crate) fn begin_annotation(&self) -> bool {
        !self.annotated.swap(true, Ordering::AcqRel)
    }

    /// Find the function containing `file_offset`.
    #[must_use]
    pub fn symbol_at(&self, file_offset: u64) -> Option<ElfMatch> {
        let text_offset = self.text?.offset;
        self.symbol_at_depth(file_offset, text_offset, 0)
    }

    fn symbol_at_depth(&self, file_offset: u64, text_offset: u64, depth: usize) -> Option<ElfMatch> {
        if depth < MAX_DEBUG_LINK_DEPTH {
            if let Some(found) = self
                .debug_link_elf()
                .and_then(|debug| debug.symbol_at_depth(file_offset, text_offset, depth + 1))
            {
                return Some(found);
            }
        }

        let text = self.text?;
        let vaddr = file_offset.wrapping_sub(text_offset).wrapping_add(text.address);

        if let Some(symbol) = self.lookup_symbol(text, vaddr) {
            let begin = symbol.address.wrapping_sub(text.address).wrapping_add(text_offset);
            return Some(ElfMatch {
                name: demangle(&symbol.name),
                begin,
                end: begin.wrapping_add(symbol.size),
            });
        }

        let context = self.dwarf.as_ref()?.lock().unwrap_or_else(PoisonError::into_inner);
        let name = dwarf_function(&context, vaddr)?;
        Some(ElfMatch { name: demangle(&name), begin: file_offset, end: file_offset + 1 })
    }

    fn lookup_symbol(&self, text: TextSection, vaddr: u64) -> Option<&ElfSymbol> {
        if vaddr > text.address.wrapping_add(text.size) {
            return None;
        }

        let index = self.symbols.partition_point(|s| s.address <= vaddr);
        let symbol = self.symbols.get(index.checked_sub(1)?)?;

        if symbol.size > 0 && symbol.address + symbol.size <= vaddr {
            return None;
        }

        Some(symbol)
    }
}

impl fmt::Debug for Elf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Elf")
            .field("file", &self.file)
            .field("build_id", &self.build_id)
            .field("debug_link", &self.debug_link)
            .field("symbols", &self.symbols.len())
            .field("dwarf", &self.dwarf.is_some())
            .finish_non_exhaustive()
    }
}

fn collect_functions<'data, S: ObjectSymbol<'data>>(
    symbols: impl Iterator<Item = S>,
) -> Vec<ElfSymbol> {
    let mut functions: Vec<ElfSymbol> = symbols
        .filter(|s| s.kind() == SymbolKind::Text && !s.is_undefined() && s.address() != 0)
        .filter_map(|s| {
            let name = s.name().ok()?;
            (!name.is_empty()).then(|| ElfSymbol {
                address: s.address(),
                size: s.size(),
                name: name.to_string(),
            })
        })
        .collect();

    functions.sort_by_key(|s| s.address);
    functions.dedup_by_key(|s| s.address);
    functions
}

fn load_dwarf(obj: &object::File<'_>) -> Option<DwarfContext> {
    obj.section_by_name(".debug_info")?;

    let endian = if obj.is_little_endian() { RunTimeEndian::Little } else { RunTimeEndian::Big };

    let load_section = |id: gimli::SectionId| -> Result<EndianArcSlice<RunTimeEndian>, gimli::Error> {
        let data = obj
            .section_by_name(id.name())
            .and_then(|section| section.uncompressed_data().ok())
            .unwrap_or(Cow::Borrowed(&[][..]));
        Ok(EndianArcSlice::new(Arc::from(&*data), endian))
    };

    let dwarf = gimli::Dwarf::load(&load_section).ok()?;
    Context::from_dwarf(dwarf).ok()
}

/// Name of the outermost (non-inlined) function at `vaddr`.
fn dwarf_function(context: &DwarfContext, vaddr: u64) -> Option<String> {
    let mut frames = context.find_frames(vaddr).skip_all_loads().ok()?;
    let mut outermost = None;

    while let Ok(Some(frame)) = frames.next() {
        if let Some(name) = frame.function.as_ref().and_then(|f| f.raw_name().ok()) {
            outermost = Some(name.into_owned());
        }
    }

    outermost
}

fn hex_string(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}

/// Guess a short library name from a path like `/usr/lib64/libc.so.6`.
#[must_use]
pub fn guess_nick(path: &str) -> Option<&'static str> {
    let base = &path[path.rfind('/')? + 1..];
    let index = base.find(".so")?;
    let rest = &base[index + 3..];

    if !rest.is_empty() && !rest.starts_with('.') {
        return None;
    }

    let key = &base[..index + 3];
    LIBRARY_NICKS.iter().find(|(library, _)| *library == key).map(|(_, nick)| *nick)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guess_nick() {
        assert_eq!(guess_nick("/usr/lib64/libc.so.6"), Some("libc"));
        assert_eq!(guess_nick("/usr/lib/libgtk-4.so.1.1200.0"), Some("GTK 4"));
        assert_eq!(guess_nick("/usr/lib64/libglib-2.0.so"), Some("GLib"));
        assert_eq!(guess_nick("/usr/lib64/ld-linux-x86-64.so.2"), Some("glibc"));
    }

    #[test]
    fn test_guess_nick_rejects_non_libraries() {
        assert_eq!(guess_nick("libc.so.6"), None);
        assert_eq!(guess_nick("/usr/bin/bash"), None);
        assert_eq!(guess_nick("/usr/lib/libc.sox"), None);
        assert_eq!(guess_nick("/usr/lib/libunknown.so.3"), None);
    }

    #[test]
    fn test_hex_string() {
        assert_eq!(hex_string(&[0xde, 0xad, 0x01]), "dead01");
        assert_eq!(hex_string(&[]), "");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(Elf::parse("/tmp/garbage", b"definitely not an object file", 0).is_err());
    }
}
