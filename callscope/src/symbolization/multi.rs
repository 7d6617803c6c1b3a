//! Ordered chain of resolvers; the first answer wins.

use super::process_info::ProcessInfo;
use super::Symbolizer;
use crate::document::Document;
use crate::domain::{AddressContext, SymbolizeError};
use crate::progress::Progress;
use crate::strings::Strings;
use crate::symbol::Symbol;
use log::{debug, warn};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Default, Clone)]
pub struct MultiSymbolizer {
    children: Vec<Arc<dyn Symbolizer>>,
}

impl MultiSymbolizer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a resolver; it is consulted after every existing one.
    pub fn push(&mut self, symbolizer: impl Symbolizer + 'static) {
        self.children.push(Arc::new(symbolizer));
    }

    /// Append an already shared resolver.
    pub fn push_shared(&mut self, symbolizer: Arc<dyn Symbolizer>) {
        self.children.push(symbolizer);
    }

    #[must_use]
    pub fn with(mut self, symbolizer: impl Symbolizer + 'static) -> Self {
        self.push(symbolizer);
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.children.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Names of the resolvers in lookup order.
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.children.iter().map(|child| child.name()).collect()
    }
}

impl std::fmt::Debug for MultiSymbolizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

impl Symbolizer for MultiSymbolizer {
    fn name(&self) -> &'static str {
        "multi"
    }

    /// Prepare every child concurrently. A child that fails is logged and
    /// left unprepared; the others still run.
    fn prepare(
        &self,
        document: &Document,
        progress: &dyn Progress,
        cancel: &CancellationToken,
    ) -> Result<(), SymbolizeError> {
        std::thread::scope(|scope| {
            let handles: Vec<_> = self
                .children
                .iter()
                .map(|child| {
                    let name = child.name();
                    (name, scope.spawn(move || child.prepare(document, progress, cancel)))
                })
                .collect();

            for (name, handle) in handles {
                match handle.join() {
                    Ok(Ok(())) => debug!("Prepared {name} symbolizer"),
                    Ok(Err(SymbolizeError::Cancelled)) => {}
                    Ok(Err(e)) => warn!("Symbolizer {name} unavailable: {e}"),
                    Err(_) => warn!("Symbolizer {name} panicked while preparing"),
                }
            }
        });

        if cancel.is_cancelled() {
            return Err(SymbolizeError::Cancelled);
        }
        Ok(())
    }

    fn symbolize(
        &self,
        strings: &Strings,
        process_info: Option<&ProcessInfo>,
        context: AddressContext,
        address: u64,
    ) -> Option<Symbol> {
        self.children
            .iter()
            .find_map(|child| child.symbolize(strings, process_info, context, address))
    }
}
