//! Symbolizer configuration: debug directories, container detection and
//! debuginfod settings.
//!
//! Precedence is defaults, then environment, then whatever the caller (the
//! CLI) overrides explicitly.

use log::debug;
use std::path::{Path, PathBuf};

/// Local directories searched for separate debug info.
pub const DEFAULT_DEBUG_DIRS: &[&str] = &["/usr/lib/debug", "/app/lib/debug"];

/// Where the host filesystem is mounted inside Flatpak and Podman sandboxes.
const HOST_MOUNT_PREFIX: &str = "/var/run/host";

const FLATPAK_MARKER: &str = "/.flatpak-info";
const PODMAN_MARKER: &str = "/run/.containerenv";

/// The sandbox the analyzer itself runs in, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContainerRuntime {
    #[default]
    Host,
    Flatpak,
    Podman,
}

impl ContainerRuntime {
    /// Detect the runtime from its marker files.
    #[must_use]
    pub fn detect() -> Self {
        if Path::new(FLATPAK_MARKER).exists() {
            Self::Flatpak
        } else if Path::new(PODMAN_MARKER).exists() {
            Self::Podman
        } else {
            Self::Host
        }
    }

    /// Rewrite a host path so it is reachable from inside the sandbox.
    ///
    /// Flatpak shares `/home` directly, so those paths are left alone.
    #[must_use]
    pub fn host_path(self, path: &str) -> String {
        match self {
            Self::Flatpak if !path.starts_with("/home/") => format!("{HOST_MOUNT_PREFIX}{path}"),
            Self::Podman => format!("{HOST_MOUNT_PREFIX}{path}"),
            _ => path.to_string(),
        }
    }
}

/// Knobs consumed by the ELF loader and the debuginfod symbolizer.
#[derive(Debug, Clone)]
pub struct SymbolizerConfig {
    /// Debug directories inside each process's mount namespace
    pub debug_dirs: Vec<PathBuf>,
    /// Debug directories on the host, searched without path translation
    pub external_debug_dirs: Vec<PathBuf>,
    pub container: ContainerRuntime,
    /// debuginfod servers, tried in order
    pub debuginfod_urls: Vec<String>,
    /// Where fetched debug info is stored
    pub debuginfod_cache: Option<PathBuf>,
}

impl Default for SymbolizerConfig {
    fn default() -> Self {
        Self {
            debug_dirs: DEFAULT_DEBUG_DIRS.iter().map(PathBuf::from).collect(),
            external_debug_dirs: Vec::new(),
            container: ContainerRuntime::Host,
            debuginfod_urls: Vec::new(),
            debuginfod_cache: None,
        }
    }
}

impl SymbolizerConfig {
    /// Defaults plus container detection and the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::with_env(|key| std::env::var(key).ok());
        config.container = ContainerRuntime::detect();
        debug!("Container runtime: {:?}", config.container);
        config
    }

    /// Defaults overlaid with variables from `lookup`.
    ///
    /// Reads `DEBUGINFOD_URLS` (whitespace separated), `DEBUGINFOD_CACHE_PATH`,
    /// `XDG_CACHE_HOME` and `HOME`.
    pub fn with_env(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(urls) = lookup("DEBUGINFOD_URLS") {
            config.debuginfod_urls = urls.split_whitespace().map(str::to_string).collect();
        }

        config.debuginfod_cache = lookup("DEBUGINFOD_CACHE_PATH")
            .map(PathBuf::from)
            .or_else(|| lookup("XDG_CACHE_HOME").map(|d| Path::new(&d).join("debuginfod_client")))
            .or_else(|| lookup("HOME").map(|h| Path::new(&h).join(".cache/debuginfod_client")));

        config
    }

    /// Whether a debuginfod symbolizer can be constructed.
    #[must_use]
    pub fn debuginfod_enabled(&self) -> bool {
        !self.debuginfod_urls.is_empty() && self.debuginfod_cache.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = SymbolizerConfig::default();
        assert_eq!(
            config.debug_dirs,
            vec![PathBuf::from("/usr/lib/debug"), PathBuf::from("/app/lib/debug")]
        );
        assert!(config.external_debug_dirs.is_empty());
        assert!(!config.debuginfod_enabled());
    }

    #[test]
    fn test_debuginfod_env() {
        let config = SymbolizerConfig::with_env(env(&[
            ("DEBUGINFOD_URLS", "https://a.example  https://b.example"),
            ("XDG_CACHE_HOME", "/home/me/.cache"),
        ]));

        assert_eq!(config.debuginfod_urls, vec!["https://a.example", "https://b.example"]);
        assert_eq!(
            config.debuginfod_cache,
            Some(PathBuf::from("/home/me/.cache/debuginfod_client"))
        );
        assert!(config.debuginfod_enabled());
    }

    #[test]
    fn test_cache_path_precedence() {
        let config = SymbolizerConfig::with_env(env(&[
            ("DEBUGINFOD_CACHE_PATH", "/var/cache/dbg"),
            ("XDG_CACHE_HOME", "/ignored"),
        ]));
        assert_eq!(config.debuginfod_cache, Some(PathBuf::from("/var/cache/dbg")));
    }

    #[test]
    fn test_container_host_path() {
        assert_eq!(ContainerRuntime::Host.host_path("/usr/lib/libc.so.6"), "/usr/lib/libc.so.6");
        assert_eq!(
            ContainerRuntime::Flatpak.host_path("/usr/lib/libc.so.6"),
            "/var/run/host/usr/lib/libc.so.6"
        );
        assert_eq!(ContainerRuntime::Flatpak.host_path("/home/me/app"), "/home/me/app");
        assert_eq!(ContainerRuntime::Podman.host_path("/home/me/app"), "/var/run/host/home/me/app");
    }
}
