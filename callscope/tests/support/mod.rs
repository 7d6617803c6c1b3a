//! Shared fixtures: synthetic ELF files and capture documents.

#![allow(dead_code)]

use callscope::document::Document;
use callscope::domain::Pid;
use callscope::symbol::{Symbol, SymbolKind};
use callscope::symbolization::AddressLayout;
use object::read::{Object as _, ObjectSection as _};
use object::write::{Object, StandardSection, Symbol as ObjectSymbol, SymbolSection};
use object::{Architecture, BinaryFormat, Endianness, SectionKind, SymbolFlags, SymbolScope};
use std::fs;
use std::path::Path;
use std::sync::Arc;

/// Every synthetic function spans this many bytes.
pub const FUNCTION_SIZE: u64 = 0x100;

/// Offset of the first function within `.text`. Address zero marks
/// undefined symbols, so nothing is placed there.
pub const FIRST_FUNCTION: u64 = 0x100;

/// A relocatable x86-64 ELF with one function per name, laid out back to
/// back in `.text`.
#[derive(Debug, Default, Clone)]
pub struct ElfBuilder {
    functions: Vec<String>,
    build_id: Option<Vec<u8>>,
    debug_link: Option<String>,
}

impl ElfBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn function(mut self, name: &str) -> Self {
        self.functions.push(name.to_string());
        self
    }

    pub fn build_id(mut self, id: &[u8]) -> Self {
        self.build_id = Some(id.to_vec());
        self
    }

    pub fn debug_link(mut self, name: &str) -> Self {
        self.debug_link = Some(name.to_string());
        self
    }

    pub fn bytes(&self) -> Vec<u8> {
        let mut obj = Object::new(BinaryFormat::Elf, Architecture::X86_64, Endianness::Little);

        let text = obj.section_id(StandardSection::Text);
        let text_len = FIRST_FUNCTION + FUNCTION_SIZE * self.functions.len() as u64;
        obj.append_section_data(text, &vec![0x90; text_len as usize], 16);

        for (index, name) in self.functions.iter().enumerate() {
            obj.add_symbol(ObjectSymbol {
                name: name.as_bytes().to_vec(),
                value: function_offset(index),
                size: FUNCTION_SIZE,
                kind: object::SymbolKind::Text,
                scope: SymbolScope::Linkage,
                weak: false,
                section: SymbolSection::Section(text),
                flags: SymbolFlags::None,
            });
        }

        if let Some(id) = &self.build_id {
            let section = obj.add_section(Vec::new(), b".note.gnu.build-id".to_vec(), SectionKind::Note);
            obj.append_section_data(section, &build_id_note(id), 4);
        }

        if let Some(link) = &self.debug_link {
            let mut data = link.as_bytes().to_vec();
            data.push(0);
            while data.len() % 4 != 0 {
                data.push(0);
            }
            data.extend_from_slice(&0x1234_5678u32.to_le_bytes());

            let section = obj.add_section(Vec::new(), b".gnu_debuglink".to_vec(), SectionKind::Debug);
            obj.append_section_data(section, &data, 4);
        }

        obj.write().expect("Failed to write synthetic ELF")
    }

    /// Write the file to `path`, creating parent directories.
    pub fn write(&self, path: &Path) -> Vec<u8> {
        let data = self.bytes();
        fs::create_dir_all(path.parent().expect("path has a parent")).expect("Failed to create directory");
        fs::write(path, &data).expect("Failed to write ELF");
        data
    }
}

/// `.text` offset of function `index`.
pub fn function_offset(index: usize) -> u64 {
    FIRST_FUNCTION + FUNCTION_SIZE * index as u64
}

/// File offset of `.text` in `data`.
pub fn text_offset(data: &[u8]) -> u64 {
    let file = object::File::parse(data).expect("Failed to parse synthetic ELF");
    let text = file.section_by_name(".text").expect("synthetic ELF has .text");
    text.file_range().expect(".text occupies file space").0
}

/// Lowercase hex, the way build-ids are displayed.
pub fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn build_id_note(id: &[u8]) -> Vec<u8> {
    let mut note = Vec::new();
    note.extend_from_slice(&4u32.to_le_bytes());
    note.extend_from_slice(&(id.len() as u32).to_le_bytes());
    note.extend_from_slice(&object::elf::NT_GNU_BUILD_ID.to_le_bytes());
    note.extend_from_slice(b"GNU\0");
    note.extend_from_slice(id);
    while note.len() % 4 != 0 {
        note.push(0);
    }
    note
}

/// One `/proc/<pid>/maps` line mapping `path` from file offset zero.
pub fn maps_line(begin: u64, end: u64, path: &Path) -> String {
    format!("{begin:x}-{end:x} r-xp 00000000 00:00 0 {}", path.display())
}

/// Where [`document_with_functions`] places function `index`.
pub fn function_address(index: usize) -> u64 {
    0x1000 + 0x100 * index as u64
}

/// A document for pid 1 (`app`) whose cache already knows one symbol per
/// name, and one sample per stack (names listed leaf first).
pub fn document_with_functions(names: &[&str], stacks: &[Vec<&str>]) -> Arc<Document> {
    let mut builder = Document::builder().process(Pid(1), Some("app"), AddressLayout::default());
    for stack in stacks {
        let addresses = stack
            .iter()
            .map(|name| {
                let index = names.iter().position(|n| n == name).expect("stack names a known function");
                function_address(index) + 0x10
            })
            .collect();
        builder = builder.sample(1, addresses);
    }

    let document = builder.build();
    let cache = document.process_info(Pid(1)).expect("pid 1 is declared").symbol_cache();
    for (index, name) in names.iter().enumerate() {
        let begin = function_address(index);
        cache.insert(Symbol::new(
            document.strings().get(name),
            Some(document.strings().get("/usr/bin/app")),
            None,
            begin,
            begin + 0x100,
            SymbolKind::User,
        ));
    }

    Arc::new(document)
}
