//! Path translation between a traced process's view and the host.
//!
//! Containerized processes see their own root. The ELF loader asks the
//! namespace where a process-visible path lives on the host; `None` or an
//! empty list means the file cannot be found.

use std::path::{Path, PathBuf};

/// Translates process-visible paths into candidate host paths.
pub trait MountNamespace: Send + Sync + std::fmt::Debug {
    /// Candidate host paths for `path`, most preferred first.
    fn translate(&self, path: &str) -> Option<Vec<String>>;
}

/// The process shares the host's filesystem view.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostNamespace;

impl MountNamespace for HostNamespace {
    fn translate(&self, path: &str) -> Option<Vec<String>> {
        path.starts_with('/').then(|| vec![path.to_string()])
    }
}

/// The process sees the host directory `root` as `/` (e.g. `/proc/<pid>/root`).
///
/// The rooted path is tried first, then the plain host path for files that
/// live outside the container image.
#[derive(Debug, Clone)]
pub struct RootedNamespace {
    root: PathBuf,
}

impl RootedNamespace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl MountNamespace for RootedNamespace {
    fn translate(&self, path: &str) -> Option<Vec<String>> {
        let relative = path.strip_prefix('/')?;
        let rooted = self.root.join(relative);
        Some(vec![rooted.to_string_lossy().into_owned(), path.to_string()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_identity() {
        assert_eq!(HostNamespace.translate("/usr/bin/app"), Some(vec!["/usr/bin/app".into()]));
        assert_eq!(HostNamespace.translate("relative"), None);
    }

    #[test]
    fn test_rooted_candidates() {
        let ns = RootedNamespace::new("/proc/42/root");
        assert_eq!(
            ns.translate("/usr/lib/libc.so.6"),
            Some(vec!["/proc/42/root/usr/lib/libc.so.6".into(), "/usr/lib/libc.so.6".into()])
        );
    }
}
