//! One-call capture loading: parse, prepare resolvers, symbolize.

use super::capture::Capture;
use super::Document;
use crate::config::SymbolizerConfig;
use crate::domain::{DocumentError, SymbolizeError};
use crate::progress::{NoProgress, Progress};
use crate::symbolization::{default_symbolizer, KernelSymbolizer, Symbolizer};
use log::{info, warn};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

pub struct DocumentLoader {
    config: SymbolizerConfig,
    symbolizer: Option<Arc<dyn Symbolizer>>,
    progress: Arc<dyn Progress>,
    cancel: CancellationToken,
    partitions: Option<usize>,
    host_kernel_symbols: bool,
}

impl DocumentLoader {
    #[must_use]
    pub fn new(config: SymbolizerConfig) -> Self {
        Self {
            config,
            symbolizer: None,
            progress: Arc::new(NoProgress),
            cancel: CancellationToken::new(),
            partitions: None,
            host_kernel_symbols: false,
        }
    }

    /// Replace the default resolver chain.
    #[must_use]
    pub fn with_symbolizer(mut self, symbolizer: Arc<dyn Symbolizer>) -> Self {
        self.symbolizer = Some(symbolizer);
        self
    }

    #[must_use]
    pub fn with_progress(mut self, progress: Arc<dyn Progress>) -> Self {
        self.progress = progress;
        self
    }

    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    #[must_use]
    pub fn with_partitions(mut self, partitions: usize) -> Self {
        self.partitions = Some(partitions);
        self
    }

    /// Fall back to this machine's `/proc/kallsyms` when the capture carries
    /// no kernel symbols.
    #[must_use]
    pub fn with_host_kernel_symbols(mut self, enabled: bool) -> Self {
        self.host_kernel_symbols = enabled;
        self
    }

    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Read, parse and symbolize a capture file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed, if preparing
    /// resolvers fails outright, or on cancellation.
    pub async fn load_file(&self, path: impl AsRef<Path>) -> Result<Arc<Document>, DocumentError> {
        let path = path.as_ref().to_path_buf();
        let document = tokio::task::spawn_blocking(move || Capture::from_file(&path)?.into_document())
            .await
            .map_err(|e| DocumentError::WorkerFailed(e.to_string()))??;
        self.load(document).await
    }

    /// Prepare resolvers for `document` and symbolize it.
    ///
    /// # Errors
    /// Returns an error if preparing resolvers fails outright or on
    /// cancellation.
    pub async fn load(&self, document: Document) -> Result<Arc<Document>, DocumentError> {
        let started = Instant::now();
        let document = Arc::new(document);
        let symbolizer = self.symbolizer_for(&document);

        let prepared = {
            let document = Arc::clone(&document);
            let symbolizer = Arc::clone(&symbolizer);
            let progress = Arc::clone(&self.progress);
            let cancel = self.cancel.clone();
            tokio::task::spawn_blocking(move || {
                symbolizer.prepare(&document, progress.as_ref(), &cancel)
            })
            .await
            .map_err(|e| DocumentError::WorkerFailed(e.to_string()))?
        };

        match prepared {
            Ok(()) => {}
            Err(SymbolizeError::Cancelled) => return Err(DocumentError::Cancelled),
            Err(e) => return Err(e.into()),
        }

        document
            .symbolize(symbolizer, Arc::clone(&self.progress), self.cancel.clone(), self.partitions)
            .await?;

        info!("Loaded {} traceables in {:.2?}", document.len(), started.elapsed());
        Ok(document)
    }

    fn symbolizer_for(&self, document: &Document) -> Arc<dyn Symbolizer> {
        if let Some(symbolizer) = &self.symbolizer {
            return Arc::clone(symbolizer);
        }

        let mut chain = default_symbolizer(&self.config, Arc::clone(&self.progress), self.cancel.clone());

        // Host symbols go last so symbols embedded in the capture win.
        if self.host_kernel_symbols {
            match KernelSymbolizer::from_host(document.strings()) {
                Ok(host) => chain.push(host),
                Err(e) => warn!("Host kernel symbols unavailable: {e}"),
            }
        }

        Arc::new(chain)
    }
}

impl std::fmt::Debug for DocumentLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentLoader")
            .field("config", &self.config)
            .field("partitions", &self.partitions)
            .field("host_kernel_symbols", &self.host_kernel_symbols)
            .finish_non_exhaustive()
    }
}
