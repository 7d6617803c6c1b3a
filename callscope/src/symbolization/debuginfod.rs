//! Last-resort resolution by downloading debug info from debuginfod servers.
//!
//! Only consulted after every local source failed. A downloaded file is
//! attached to the local ELF as its debug file, and concurrent requests for
//! one build-id share a single fetch. Paths that could not be helped are
//! remembered and never retried.

use super::elf::Elf;
use super::elf_loader::ElfLoader;
use super::elf_symbolizer::symbol_for_match;
use super::jitmap::is_jit_address;
use super::process_info::ProcessInfo;
use super::Symbolizer;
use crate::config::SymbolizerConfig;
use crate::domain::{AddressContext, SymbolizeError};
use crate::progress::Progress;
use crate::strings::Strings;
use crate::symbol::Symbol;
use log::{debug, info, warn};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio_util::sync::CancellationToken;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(90);

/// Fetches the debug file for a build-id.
pub trait DebuginfodClient: Send + Sync + fmt::Debug {
    /// Download (or find already downloaded) debug info for `build_id` and
    /// return its local path.
    ///
    /// # Errors
    /// Returns an error if no server has the file or the transfer fails.
    fn fetch_debuginfo(
        &self,
        build_id: &str,
        progress: &dyn Progress,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, SymbolizeError>;
}

/// debuginfod over HTTP, caching downloads under
/// `<cache>/<build-id>/debuginfo`.
#[derive(Debug)]
pub struct HttpDebuginfodClient {
    urls: Vec<String>,
    cache_dir: PathBuf,
    client: OnceLock<reqwest::blocking::Client>,
}

impl HttpDebuginfodClient {
    /// Returns `None` when no server or cache directory is configured.
    #[must_use]
    pub fn new(config: &SymbolizerConfig) -> Option<Self> {
        if config.debuginfod_urls.is_empty() {
            return None;
        }
        Some(Self {
            urls: config.debuginfod_urls.clone(),
            cache_dir: config.debuginfod_cache.clone()?,
            client: OnceLock::new(),
        })
    }

    #[must_use]
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    // Built on first use so it is created on a blocking worker thread.
    fn client(&self) -> Result<&reqwest::blocking::Client, SymbolizeError> {
        if let Some(client) = self.client.get() {
            return Ok(client);
        }
        let client = reqwest::blocking::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("callscope/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(self.client.get_or_init(|| client))
    }

    #[allow(clippy::cast_precision_loss)]
    fn download(
        &self,
        server: &str,
        build_id: &str,
        target: &Path,
        progress: &dyn Progress,
        cancel: &CancellationToken,
    ) -> Result<(), SymbolizeError> {
        let url = format!("{}/buildid/{build_id}/debuginfo", server.trim_end_matches('/'));
        debug!("GET {url}");

        let mut response = self.client()?.get(&url).send()?.error_for_status()?;
        let total = response.content_length().filter(|len| *len > 0);

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        // Each transfer gets its own file; the rename into place is atomic.
        let mut file = NamedTempFile::new_in(target.parent().unwrap_or(&self.cache_dir))?;

        let message = format!("Downloading debug info for {build_id}");
        let mut buffer = vec![0u8; 64 * 1024];
        let mut received = 0u64;

        loop {
            if cancel.is_cancelled() {
                return Err(SymbolizeError::Cancelled);
            }

            let n = response.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            file.write_all(&buffer[..n])?;
            received += n as u64;

            if let Some(total) = total {
                progress.report(received as f64 / total as f64, &message);
            }
        }

        file.flush()?;
        file.persist(target).map_err(|e| e.error)?;
        info!("Fetched debug info for {build_id} ({received} bytes)");
        Ok(())
    }
}

impl DebuginfodClient for HttpDebuginfodClient {
    fn fetch_debuginfo(
        &self,
        build_id: &str,
        progress: &dyn Progress,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, SymbolizeError> {
        if build_id.is_empty() || !build_id.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(SymbolizeError::DebuginfodFailed {
                build_id: build_id.to_string(),
                error: "not a hex build-id".to_string(),
            });
        }

        let target = self.cache_dir.join(build_id).join("debuginfo");
        if target.is_file() {
            return Ok(target);
        }

        let mut last_error = String::from("no servers configured");
        for server in &self.urls {
            match self.download(server, build_id, &target, progress, cancel) {
                Ok(()) => return Ok(target),
                Err(SymbolizeError::Cancelled) => return Err(SymbolizeError::Cancelled),
                Err(e) if target.is_file() => {
                    debug!("{server}: {e}, but {} appeared meanwhile", target.display());
                    return Ok(target);
                }
                Err(e) => {
                    debug!("{server}: {e}");
                    last_error = e.to_string();
                }
            }
        }

        Err(SymbolizeError::DebuginfodFailed { build_id: build_id.to_string(), error: last_error })
    }
}

/// Outcome of one build-id fetch, shared by every worker that asked.
#[derive(Debug)]
enum Fetched {
    Loaded(Arc<Elf>),
    Unusable,
    Cancelled,
    Failed(String),
}

pub struct DebuginfodSymbolizer {
    loader: Arc<ElfLoader>,
    client: Box<dyn DebuginfodClient>,
    fetches: Mutex<HashMap<String, Arc<OnceLock<Fetched>>>>,
    failed: Mutex<HashSet<String>>,
    progress: Arc<dyn Progress>,
    cancel: CancellationToken,
}

impl DebuginfodSymbolizer {
    /// `loader` is shared with the ELF resolver, so a downloaded debug file
    /// is visible to it as well.
    #[must_use]
    pub fn new(
        loader: Arc<ElfLoader>,
        client: Box<dyn DebuginfodClient>,
        progress: Arc<dyn Progress>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            loader,
            client,
            fetches: Mutex::new(HashMap::new()),
            failed: Mutex::new(HashSet::new()),
            progress,
            cancel,
        }
    }

    /// Fetch and load the debug file for `build_id`. Callers racing on the
    /// same build-id block until the first one finishes and share its result.
    fn fetch(&self, build_id: &str) -> Arc<OnceLock<Fetched>> {
        let slot = {
            let mut fetches = self.fetches.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(fetches.entry(build_id.to_ascii_lowercase()).or_default())
        };

        slot.get_or_init(|| match self.client.fetch_debuginfo(build_id, self.progress.as_ref(), &self.cancel) {
            Ok(path) => match self.loader.load(None, &path.to_string_lossy(), Some(build_id), 0) {
                Some(debug) => Fetched::Loaded(debug),
                None => Fetched::Unusable,
            },
            Err(SymbolizeError::Cancelled) => Fetched::Cancelled,
            Err(e) => Fetched::Failed(e.to_string()),
        });
        slot
    }

    /// Build-ids a download was attempted for.
    #[must_use]
    pub fn fetch_count(&self) -> usize {
        self.fetches.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn has_failed(&self, path: &str) -> bool {
        self.failed.lock().unwrap_or_else(PoisonError::into_inner).contains(path)
    }

    fn mark_failed(&self, path: &str) {
        self.failed.lock().unwrap_or_else(PoisonError::into_inner).insert(path.to_string());
    }

    /// Number of mapped files given up on.
    #[must_use]
    pub fn failed_count(&self) -> usize {
        self.failed.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl fmt::Debug for DebuginfodSymbolizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DebuginfodSymbolizer")
            .field("client", &self.client)
            .field("failed", &self.failed_count())
            .finish_non_exhaustive()
    }
}

impl Symbolizer for DebuginfodSymbolizer {
    fn name(&self) -> &'static str {
        "debuginfod"
    }

    fn symbolize(
        &self,
        strings: &Strings,
        process_info: Option<&ProcessInfo>,
        context: AddressContext,
        address: u64,
    ) -> Option<Symbol> {
        if !context.is_user_space() || is_jit_address(address) || self.cancel.is_cancelled() {
            return None;
        }

        let info = process_info?;
        let map = info.address_layout().lookup(address)?;

        if self.has_failed(&map.file) {
            return None;
        }

        let Some(elf) = self.loader.load(
            Some(info.mount_namespace()),
            &map.file,
            map.build_id.as_deref(),
            map.inode,
        ) else {
            self.mark_failed(&map.file);
            return None;
        };

        if elf.debug_link_elf().is_none() {
            let Some(build_id) = elf.build_id() else {
                self.mark_failed(&map.file);
                return None;
            };

            let slot = self.fetch(build_id);
            match slot.get() {
                Some(Fetched::Loaded(debug)) => elf.set_debug_link_elf(Arc::clone(debug)),
                Some(Fetched::Unusable) => {
                    warn!("Downloaded debug info for {} is unusable", map.file);
                    self.mark_failed(&map.file);
                    return None;
                }
                Some(Fetched::Failed(e)) => {
                    debug!("No debug info for {}: {e}", map.file);
                    self.mark_failed(&map.file);
                    return None;
                }
                Some(Fetched::Cancelled) | None => return None,
            }
        }

        let found = elf.symbol_at(map.file_relative(address))?;
        Some(symbol_for_match(strings, map, &elf, &found))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NoProgress;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Default)]
    struct CountingClient {
        calls: AtomicUsize,
    }

    impl DebuginfodClient for Arc<CountingClient> {
        fn fetch_debuginfo(
            &self,
            build_id: &str,
            _progress: &dyn Progress,
            _cancel: &CancellationToken,
        ) -> Result<PathBuf, SymbolizeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(SymbolizeError::DebuginfodFailed {
                build_id: build_id.to_string(),
                error: "404".to_string(),
            })
        }
    }

    #[test]
    fn test_http_client_requires_urls_and_cache() {
        let mut config = SymbolizerConfig::default();
        assert!(HttpDebuginfodClient::new(&config).is_none());

        config.debuginfod_urls = vec!["https://debuginfod.example".to_string()];
        assert!(HttpDebuginfodClient::new(&config).is_none());

        config.debuginfod_cache = Some(PathBuf::from("/tmp/dbg-cache"));
        let client = HttpDebuginfodClient::new(&config).unwrap();
        assert_eq!(client.cache_dir(), Path::new("/tmp/dbg-cache"));
    }

    #[test]
    fn test_rejects_non_hex_build_id() {
        let mut config = SymbolizerConfig::default();
        config.debuginfod_urls = vec!["https://debuginfod.example".to_string()];
        config.debuginfod_cache = Some(PathBuf::from("/tmp/dbg-cache"));
        let client = HttpDebuginfodClient::new(&config).unwrap();

        let err = client
            .fetch_debuginfo("../../etc/passwd", &NoProgress, &CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, SymbolizeError::DebuginfodFailed { .. }));
    }

    #[test]
    fn test_unknown_process_is_skipped_without_fetching() {
        let counting = Arc::new(CountingClient::default());
        let symbolizer = DebuginfodSymbolizer::new(
            Arc::new(ElfLoader::new(&SymbolizerConfig::default())),
            Box::new(Arc::clone(&counting)),
            Arc::new(NoProgress),
            CancellationToken::new(),
        );

        let strings = Strings::new();
        assert!(symbolizer.symbolize(&strings, None, AddressContext::User, 0x1000).is_none());
        assert_eq!(counting.calls.load(Ordering::SeqCst), 0);
    }
}
