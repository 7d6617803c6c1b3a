//! Filling the symbol caches and reading stacks back as symbols.
//!
//! Symbolization splits the traceables into contiguous partitions and walks
//! each on a blocking worker. Workers only ever add to the caches; the first
//! symbol cached for a range wins. Afterwards, [`Document::lookup_symbol`]
//! is a pure cache read.

use super::traceable::Traceable;
use super::{Document, Endianness};
use crate::domain::{AddressContext, DocumentError, ExportError, Pid};
use crate::progress::Progress;
use crate::symbol::{Symbol, SymbolKind};
use crate::symbolization::{BundleWriter, ProcessInfo, Symbolizer};
use log::{debug, info};
use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Traceables processed between progress reports.
pub const PROGRESS_INTERVAL: usize = 100;

const SYMBOLIZING_MESSAGE: &str = "Symbolizing stack traces";

/// Partition count used when the caller does not choose one.
#[must_use]
pub fn default_partitions() -> usize {
    num_cpus::get() / 2 + 1
}

impl Document {
    /// Resolve every address of every traceable into the caches.
    ///
    /// `partitions` defaults to half the CPUs plus one and is clamped to
    /// `1..=traceables`. Results do not depend on the partition count.
    ///
    /// # Errors
    /// Returns [`DocumentError::Cancelled`] if `cancel` fired (the caches keep
    /// whatever was resolved), or an error if a worker panicked.
    pub async fn symbolize(
        self: &Arc<Self>,
        symbolizer: Arc<dyn Symbolizer>,
        progress: Arc<dyn Progress>,
        cancel: CancellationToken,
        partitions: Option<usize>,
    ) -> Result<(), DocumentError> {
        let total = self.traceables.len();
        let partitions = partitions.unwrap_or_else(default_partitions).clamp(1, total.max(1));
        let chunk = total.div_ceil(partitions).max(1);
        let done = Arc::new(AtomicUsize::new(0));

        info!("Symbolizing {total} traceables in {partitions} partitions");

        let mut workers = Vec::with_capacity(partitions);
        for start in (0..total).step_by(chunk) {
            let range = start..(start + chunk).min(total);
            let document = Arc::clone(self);
            let symbolizer = Arc::clone(&symbolizer);
            let progress = Arc::clone(&progress);
            let cancel = cancel.clone();
            let done = Arc::clone(&done);

            workers.push(tokio::task::spawn_blocking(move || {
                document.symbolize_range(range, symbolizer.as_ref(), progress.as_ref(), &cancel, &done);
            }));
        }

        for worker in workers {
            worker.await.map_err(|e| DocumentError::WorkerFailed(e.to_string()))?;
        }

        if cancel.is_cancelled() {
            return Err(DocumentError::Cancelled);
        }

        progress.report(1.0, SYMBOLIZING_MESSAGE);
        self.mark_symbolized();
        debug!("Kernel cache holds {} symbols", self.kernel_cache.len());
        Ok(())
    }

    #[allow(clippy::cast_precision_loss)]
    fn symbolize_range(
        &self,
        range: Range<usize>,
        symbolizer: &dyn Symbolizer,
        progress: &dyn Progress,
        cancel: &CancellationToken,
        done: &AtomicUsize,
    ) {
        let total = self.traceables.len();

        for traceable in &self.traceables[range] {
            if cancel.is_cancelled() {
                return;
            }

            self.resolve_traceable(traceable, symbolizer);

            let finished = done.fetch_add(1, Ordering::Relaxed) + 1;
            if finished % PROGRESS_INTERVAL == 0 {
                progress.report(finished as f64 / total as f64, SYMBOLIZING_MESSAGE);
            }
        }
    }

    fn resolve_traceable(&self, traceable: &Traceable, symbolizer: &dyn Symbolizer) {
        let info = self.processes.get(&traceable.pid);
        let mut context = AddressContext::None;

        for &address in &traceable.addresses {
            if let Some(next) = AddressContext::from_marker(address) {
                context = next;
                continue;
            }

            let cache = if context == AddressContext::Kernel {
                &self.kernel_cache
            } else if let Some(info) = info {
                info.symbol_cache()
            } else {
                continue;
            };

            if cache.lookup(address).is_some() {
                continue;
            }

            if let Some(symbol) = self.resolve_address(symbolizer, info, context, address) {
                cache.insert(symbol);
            }
        }
    }

    /// Ask the resolver chain, falling back to a file-relative placeholder
    /// when the address is inside a known mapping.
    fn resolve_address(
        &self,
        symbolizer: &dyn Symbolizer,
        info: Option<&ProcessInfo>,
        context: AddressContext,
        address: u64,
    ) -> Option<Symbol> {
        if let Some(symbol) = symbolizer.symbolize(&self.strings, info, context, address) {
            return Some(symbol);
        }

        let map = info?.address_layout().lookup(address)?;
        let name = format!("In File {}+0x{:x}", map.file, map.file_relative(address));

        Some(Symbol::new_fallback(
            self.strings.get(&name),
            Some(self.strings.get(&map.file)),
            None,
            address,
            address.saturating_add(1),
            SymbolKind::User,
        ))
    }

    /// Cached symbol for one address.
    ///
    /// A `None` context is treated as user space. Context markers resolve to
    /// their pseudo-frame.
    #[must_use]
    pub fn lookup_symbol(&self, pid: Pid, context: AddressContext, address: u64) -> Option<Symbol> {
        if let Some(marker) = AddressContext::from_marker(address) {
            return Some(self.context_switch_symbol(marker));
        }

        if context == AddressContext::Kernel {
            return self.kernel_cache.lookup(address);
        }

        self.processes.get(&pid)?.symbol_cache().lookup(address)
    }

    /// Read the first `limit` addresses of `traceable` back as symbols into
    /// `symbols` (cleared first), leaf first.
    ///
    /// Unresolved addresses are skipped and runs of equal symbols collapse to
    /// one. Returns the context in force after the last address.
    pub fn symbolize_traceable(
        &self,
        traceable: &Traceable,
        symbols: &mut Vec<Symbol>,
        limit: usize,
    ) -> AddressContext {
        symbols.clear();
        let mut context = AddressContext::None;

        for &address in traceable.addresses.iter().take(limit) {
            let symbol = self.lookup_symbol(traceable.pid, context, address);

            if let Some(next) = AddressContext::from_marker(address) {
                context = next;
            }

            let Some(symbol) = symbol else { continue };
            if symbols.last() == Some(&symbol) {
                continue;
            }
            symbols.push(symbol);
        }

        context
    }

    /// Serialize every resolved user-space symbol as a bundle that can be
    /// embedded in a capture.
    ///
    /// # Errors
    /// Returns an error if the bundle would exceed 32-bit offsets.
    pub fn export_symbols(&self, endianness: Endianness) -> Result<Vec<u8>, ExportError> {
        let mut writer = BundleWriter::new();

        let mut pids: Vec<_> = self.processes.keys().copied().collect();
        pids.sort_unstable();

        for pid in pids {
            let Some(info) = self.processes.get(&pid) else { continue };
            let Ok(bundle_pid) = u32::try_from(pid.0) else { continue };
            for symbol in info.symbol_cache().symbols() {
                writer.add(bundle_pid, &symbol);
            }
        }

        info!("Exporting {} symbols", writer.len());
        writer.finish(endianness)
    }
}
