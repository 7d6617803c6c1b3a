//! Locates, parses and caches ELF files, then chases their debug links.
//!
//! Every path ever tried is remembered, including failures, so a missing
//! library costs one `open` per analysis rather than one per address.
//!
//! # Debug-link search
//!
//! For a file at `/usr/lib64/libfoo.so.1` with build-id `abcdef…` and debug
//! link `libfoo.so.1.debug`, each local debug dir `D` is searched for
//!
//! 1. `D/.build-id/ab/cdef….debug`
//! 2. `D/usr/lib64/libfoo.so.1.debug`
//! 3. `D/<dirname without the prefix shared with D>/libfoo.so.1.debug`
//!
//! followed by `/usr/lib64/.debug/libfoo.so.1.debug`. Local paths go through
//! the process's mount namespace. External dirs are then tried with (1) and
//! (2) as plain host paths. Found debug files may carry their own link; the
//! chain is followed for at most [`MAX_DEBUG_LINK_HOPS`] hops and stops on any
//! path seen before.

use super::elf::Elf;
use super::mount_namespace::{HostNamespace, MountNamespace};
use crate::config::{ContainerRuntime, SymbolizerConfig};
use log::{debug, warn};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

/// Upper bound on debug-link hops from one file.
pub const MAX_DEBUG_LINK_HOPS: usize = 8;

#[derive(Debug)]
pub struct ElfLoader {
    debug_dirs: Vec<PathBuf>,
    external_debug_dirs: Vec<PathBuf>,
    container: ContainerRuntime,
    cache: RwLock<HashMap<String, Option<Arc<Elf>>>>,
}

impl ElfLoader {
    #[must_use]
    pub fn new(config: &SymbolizerConfig) -> Self {
        Self {
            debug_dirs: config.debug_dirs.clone(),
            external_debug_dirs: config.external_debug_dirs.clone(),
            container: config.container,
            cache: RwLock::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn debug_dirs(&self) -> &[PathBuf] {
        &self.debug_dirs
    }

    #[must_use]
    pub fn external_debug_dirs(&self) -> &[PathBuf] {
        &self.external_debug_dirs
    }

    /// Number of paths tried so far, successful or not.
    #[must_use]
    pub fn cached_paths(&self) -> usize {
        self.cache.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Load the file a process knows as `file`.
    ///
    /// With a namespace, every translated candidate is tried in order and
    /// the debug-link chain of the accepted file is resolved once. Without
    /// one, `file` is used as-is and no debug links are followed. A candidate
    /// is accepted only if it [`matches`](Elf::matches) `build_id` and
    /// `inode`.
    pub fn load(
        &self,
        namespace: Option<&dyn MountNamespace>,
        file: &str,
        build_id: Option<&str>,
        inode: u64,
    ) -> Option<Arc<Elf>> {
        let elf = self.resolve(namespace, file, build_id, inode)?;

        if let Some(namespace) = namespace {
            if elf.debug_link().is_some() && elf.begin_annotation() {
                self.annotate(namespace, file, &elf);
            }
        }

        Some(elf)
    }

    fn resolve(
        &self,
        namespace: Option<&dyn MountNamespace>,
        file: &str,
        build_id: Option<&str>,
        inode: u64,
    ) -> Option<Arc<Elf>> {
        let candidates = match namespace {
            Some(namespace) => namespace.translate(file)?,
            None => vec![file.to_string()],
        };

        candidates
            .iter()
            .filter(|candidate| !candidate.is_empty())
            .filter_map(|candidate| self.load_path(&self.container.host_path(candidate)))
            .find(|elf| elf.matches(build_id, inode))
    }

    fn load_path(&self, path: &str) -> Option<Arc<Elf>> {
        if let Some(cached) = self.cache.read().unwrap_or_else(PoisonError::into_inner).get(path) {
            return cached.clone();
        }

        let loaded = read_elf(path).map(Arc::new);

        let mut cache = self.cache.write().unwrap_or_else(PoisonError::into_inner);
        cache.entry(path.to_string()).or_insert(loaded).clone()
    }

    /// Resolve and attach the debug-link chain starting at `elf`.
    fn annotate(&self, namespace: &dyn MountNamespace, file: &str, elf: &Arc<Elf>) {
        let host = HostNamespace;
        let mut visited: HashSet<String> = HashSet::from([elf.file().to_string()]);
        let mut current = Arc::clone(elf);
        let mut namespace = namespace;
        let mut visible_path = file.to_string();

        for _ in 0..MAX_DEBUG_LINK_HOPS {
            let Some(link) = current.debug_link() else { break };
            let Some(found) = self.find_debug_link(namespace, &visible_path, &current, link) else {
                debug!("No debug file for {} (link {link})", current.file());
                break;
            };

            if !visited.insert(found.file().to_string()) {
                warn!("Debug link cycle through {}, not following further", found.file());
                break;
            }

            debug!("Attached {} as debug file of {}", found.file(), current.file());
            current.set_debug_link_elf(Arc::clone(&found));

            // A file whose chain was already resolved needs no second pass.
            if !found.begin_annotation() {
                break;
            }

            // Found files are host paths; later hops need no translation.
            namespace = &host;
            visible_path = found.file().to_string();
            current = found;
        }
    }

    fn find_debug_link(
        &self,
        namespace: &dyn MountNamespace,
        visible_path: &str,
        elf: &Elf,
        link: &str,
    ) -> Option<Arc<Elf>> {
        let dirname = Path::new(visible_path).parent().and_then(Path::to_str).unwrap_or("/");
        let dirname = dirname.trim_end_matches('/');
        let build_id = elf.build_id();

        for dir in &self.debug_dirs {
            for candidate in local_candidates(dir, dirname, link, build_id) {
                if let Some(found) = self.resolve(Some(namespace), &candidate, build_id, 0) {
                    return Some(found);
                }
            }
        }

        let sibling = format!("{dirname}/.debug/{link}");
        if let Some(found) = self.resolve(Some(namespace), &sibling, build_id, 0) {
            return Some(found);
        }

        for dir in &self.external_debug_dirs {
            for candidate in external_candidates(dir, dirname, link, build_id) {
                if let Some(found) = self.resolve(None, &candidate, build_id, 0) {
                    return Some(found);
                }
            }
        }

        None
    }
}

fn read_elf(path: &str) -> Option<Elf> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(e) => {
            debug!("Cannot read {path}: {e}");
            return None;
        }
    };

    let inode = fs::metadata(path).map_or(0, |m| m.ino());

    match Elf::parse(path, &data, inode) {
        Ok(elf) => {
            debug!("Loaded {path}: {} symbols", elf.symbol_count());
            Some(elf)
        }
        Err(e) => {
            debug!("Cannot parse {path}: {e}");
            None
        }
    }
}

fn build_id_path(dir: &Path, build_id: &str) -> Option<String> {
    if build_id.len() < 3 || !build_id.is_ascii() {
        return None;
    }
    let (head, rest) = build_id.split_at(2);
    Some(format!("{}/.build-id/{head}/{rest}.debug", dir.display()))
}

fn local_candidates(dir: &Path, dirname: &str, link: &str, build_id: Option<&str>) -> Vec<String> {
    let mut candidates = Vec::with_capacity(3);
    candidates.extend(build_id.and_then(|id| build_id_path(dir, id)));
    candidates.push(format!("{}{dirname}/{link}", dir.display()));

    let trimmed = skip_common_prefix(dirname, dir);
    let fallback = format!("{}/{}/{link}", dir.display(), trimmed).replace("//", "/");
    if !candidates.contains(&fallback) {
        candidates.push(fallback);
    }

    candidates
}

fn external_candidates(dir: &Path, dirname: &str, link: &str, build_id: Option<&str>) -> Vec<String> {
    let mut candidates = Vec::with_capacity(2);
    candidates.extend(build_id.and_then(|id| build_id_path(dir, id)));
    candidates.push(format!("{}{dirname}/{link}", dir.display()));
    candidates
}

/// The part of `dirname` left after removing the leading components it
/// shares with `dir`.
fn skip_common_prefix(dirname: &str, dir: &Path) -> String {
    let ours: Vec<Component<'_>> = Path::new(dirname).components().collect();
    let theirs: Vec<Component<'_>> = dir.components().collect();

    let shared = ours.iter().zip(&theirs).take_while(|(a, b)| a == b).count();

    ours[shared..]
        .iter()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_id_path() {
        assert_eq!(
            build_id_path(Path::new("/usr/lib/debug"), "abcdef12").as_deref(),
            Some("/usr/lib/debug/.build-id/ab/cdef12.debug")
        );
        assert_eq!(build_id_path(Path::new("/usr/lib/debug"), "ab"), None);
    }

    #[test]
    fn test_skip_common_prefix() {
        assert_eq!(skip_common_prefix("/usr/lib64", Path::new("/usr/lib/debug")), "lib64");
        assert_eq!(skip_common_prefix("/app/lib", Path::new("/app/lib/debug")), "");
        assert_eq!(skip_common_prefix("/opt/tool/lib", Path::new("/usr/lib/debug")), "opt/tool/lib");
    }

    #[test]
    fn test_local_candidate_order() {
        let candidates =
            local_candidates(Path::new("/usr/lib/debug"), "/usr/lib64", "libfoo.so.debug", Some("abcd"));
        assert_eq!(
            candidates,
            vec![
                "/usr/lib/debug/.build-id/ab/cd.debug",
                "/usr/lib/debug/usr/lib64/libfoo.so.debug",
                "/usr/lib/debug/lib64/libfoo.so.debug",
            ]
        );
    }

    #[test]
    fn test_local_candidates_without_build_id() {
        let candidates = local_candidates(Path::new("/app/lib/debug"), "/app/lib", "x.debug", None);
        assert_eq!(candidates, vec!["/app/lib/debug/app/lib/x.debug", "/app/lib/debug/x.debug"]);
    }

    #[test]
    fn test_missing_file_is_cached_as_failure() {
        let loader = ElfLoader::new(&SymbolizerConfig::default());
        assert!(loader.load(None, "/nonexistent/libnothing.so", None, 0).is_none());
        assert!(loader.load(None, "/nonexistent/libnothing.so", None, 0).is_none());
        assert_eq!(loader.cached_paths(), 1);
    }
}
