//! Address-to-symbol resolution.
//!
//! A [`Symbolizer`] turns `(process, context, address)` into a [`Symbol`].
//! Several sources are chained by [`MultiSymbolizer`]; the first one that
//! answers wins. The default chain is bundled table, kernel symbols, ELF
//! files, JIT map and (if configured) debuginfod.
//!
//! Resolvers are shared across worker threads and must be `Send + Sync`.
//! Anything they load lazily sits behind a lock or a `OnceLock`.

pub mod address_layout;
pub mod bundled;
pub mod debuginfod;
pub mod elf;
pub mod elf_loader;
pub mod elf_symbolizer;
pub mod jitmap;
pub mod kallsyms;
pub mod mount_namespace;
pub mod multi;
pub mod process_info;
pub mod symbol_cache;

pub use address_layout::{AddressLayout, MemoryMap};
pub use bundled::{BundleWriter, BundledSymbolizer};
pub use debuginfod::{DebuginfodClient, DebuginfodSymbolizer, HttpDebuginfodClient};
pub use elf::Elf;
pub use elf_loader::ElfLoader;
pub use elf_symbolizer::ElfSymbolizer;
pub use jitmap::JitmapSymbolizer;
pub use kallsyms::{KernelSymbolTable, KernelSymbolizer};
pub use mount_namespace::{HostNamespace, MountNamespace, RootedNamespace};
pub use multi::MultiSymbolizer;
pub use process_info::ProcessInfo;
pub use symbol_cache::SymbolCache;

use crate::config::SymbolizerConfig;
use crate::document::Document;
use crate::domain::{AddressContext, SymbolizeError};
use crate::progress::Progress;
use crate::strings::Strings;
use crate::symbol::Symbol;
use log::info;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A source of symbol names.
pub trait Symbolizer: Send + Sync {
    /// Short name used in log messages.
    fn name(&self) -> &'static str;

    /// Load whatever the resolver needs from `document` before lookups
    /// start. Called once, off the async runtime.
    ///
    /// # Errors
    /// Returns an error if required data is present but unusable, or if
    /// `cancel` fires.
    fn prepare(
        &self,
        _document: &Document,
        _progress: &dyn Progress,
        _cancel: &CancellationToken,
    ) -> Result<(), SymbolizeError> {
        Ok(())
    }

    /// Resolve one address, or `None` if this source does not know it.
    fn symbolize(
        &self,
        strings: &Strings,
        process_info: Option<&ProcessInfo>,
        context: AddressContext,
        address: u64,
    ) -> Option<Symbol>;
}

/// Build the standard resolver chain for `config`.
///
/// `progress` and `cancel` are handed to the debuginfod resolver, which may
/// download while symbolizing.
#[must_use]
pub fn default_symbolizer(
    config: &SymbolizerConfig,
    progress: Arc<dyn Progress>,
    cancel: CancellationToken,
) -> MultiSymbolizer {
    let loader = Arc::new(ElfLoader::new(config));

    let mut chain = MultiSymbolizer::new();
    chain.push(BundledSymbolizer::new());
    chain.push(KernelSymbolizer::new());
    chain.push(ElfSymbolizer::new(Arc::clone(&loader)));
    chain.push(JitmapSymbolizer::new());

    if let Some(client) = HttpDebuginfodClient::new(config) {
        info!("debuginfod enabled: {}", config.debuginfod_urls.join(" "));
        chain.push(DebuginfodSymbolizer::new(loader, Box::new(client), progress, cancel));
    }

    chain
}

/// Demangle Rust names (legacy `_ZN…E` and v0 `_R…`). Anything that fails
/// to demangle, C++ names included, is returned unchanged.
#[must_use]
pub fn demangle(name: &str) -> String {
    if name.starts_with("_Z") || name.starts_with("_R") {
        if let Ok(demangled) = rustc_demangle::try_demangle(name) {
            return format!("{demangled:#}");
        }
    }
    name.to_string()
}
