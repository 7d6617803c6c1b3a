//! The immutable symbol value shared by caches, resolvers and callgraph nodes.
//!
//! # Equality
//!
//! Two symbols are equal when they have the same kind, name and binary nick,
//! and, if *both* carry a binary path, the same path. A symbol without a path
//! (bundled tables carry none) matches a path-carrying symbol by name and nick
//! alone, so stacks symbolized from a bundle merge with stacks symbolized from
//! the ELF files they were exported from.
//!
//! The hash only covers kind, name and nick. Including the path would break
//! `a == b ⇒ hash(a) == hash(b)` for the path-less case.

use crate::strings::IStr;
use serde::{Serialize, Serializer};
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// What a symbol stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SymbolKind {
    /// The synthetic "All Processes" root
    Root,
    Process,
    Thread,
    /// A context-switch marker frame (e.g. `- - Kernel - -`)
    ContextSwitch,
    User,
    Kernel,
    /// A stack that could not be unwound or resolved
    Unwindable,
}

/// Process names that identify kernel worker threads.
const KERNEL_PROCESS_PREFIXES: &[&str] =
    &["kworker/", "migration/", "dmcrypt_write/", "hwrng", "irq/", "ksoftirqd/"];

/// Directories whose binaries count as system libraries.
const SYSTEM_LIBRARY_PREFIXES: &[&str] = &["/usr/lib/", "/usr/lib64/", "/lib/", "/lib64/"];

struct SymbolData {
    name: IStr,
    binary_path: Option<IStr>,
    binary_nick: Option<IStr>,
    begin_address: u64,
    end_address: u64,
    kind: SymbolKind,
    is_fallback: bool,
    is_kernel_process: bool,
    hash: u64,
}

/// A resolved symbol. Cloning is cheap (reference counted).
#[derive(Clone)]
pub struct Symbol(Arc<SymbolData>);

impl Symbol {
    /// Create a symbol. Empty paths and nicks are normalized to `None`.
    #[must_use]
    pub fn new(
        name: IStr,
        binary_path: Option<IStr>,
        binary_nick: Option<IStr>,
        begin_address: u64,
        end_address: u64,
        kind: SymbolKind,
    ) -> Self {
        Self::build(name, binary_path, binary_nick, begin_address, end_address, kind, false)
    }

    /// Create a placeholder symbol for an address no resolver recognized.
    #[must_use]
    pub fn new_fallback(
        name: IStr,
        binary_path: Option<IStr>,
        binary_nick: Option<IStr>,
        begin_address: u64,
        end_address: u64,
        kind: SymbolKind,
    ) -> Self {
        Self::build(name, binary_path, binary_nick, begin_address, end_address, kind, true)
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        name: IStr,
        binary_path: Option<IStr>,
        binary_nick: Option<IStr>,
        begin_address: u64,
        end_address: u64,
        kind: SymbolKind,
        is_fallback: bool,
    ) -> Self {
        let binary_path = binary_path.filter(|p| !p.is_empty());
        let binary_nick = binary_nick.filter(|n| !n.is_empty());

        let is_kernel_process = kind == SymbolKind::Process && is_kernel_process_name(&name);

        let mut hasher = DefaultHasher::new();
        kind.hash(&mut hasher);
        name.hash(&mut hasher);
        binary_nick.as_deref().unwrap_or("").hash(&mut hasher);

        Self(Arc::new(SymbolData {
            name,
            binary_path,
            binary_nick,
            begin_address,
            end_address,
            kind,
            is_fallback,
            is_kernel_process,
            hash: hasher.finish(),
        }))
    }

    #[must_use]
    pub fn name(&self) -> &IStr {
        &self.0.name
    }

    #[must_use]
    pub fn binary_path(&self) -> Option<&IStr> {
        self.0.binary_path.as_ref()
    }

    #[must_use]
    pub fn binary_nick(&self) -> Option<&IStr> {
        self.0.binary_nick.as_ref()
    }

    #[must_use]
    pub fn begin_address(&self) -> u64 {
        self.0.begin_address
    }

    #[must_use]
    pub fn end_address(&self) -> u64 {
        self.0.end_address
    }

    #[must_use]
    pub fn kind(&self) -> SymbolKind {
        self.0.kind
    }

    #[must_use]
    pub fn is_fallback(&self) -> bool {
        self.0.is_fallback
    }

    #[must_use]
    pub fn is_kernel_process(&self) -> bool {
        self.0.is_kernel_process
    }

    #[must_use]
    pub fn is_context_switch(&self) -> bool {
        self.0.kind == SymbolKind::ContextSwitch
    }

    /// True when both handles share the same allocation.
    #[must_use]
    pub fn ptr_eq(a: &Symbol, b: &Symbol) -> bool {
        Arc::ptr_eq(&a.0, &b.0)
    }

    /// Heuristic used to hide library frames from a callgraph.
    ///
    /// Kernel frames always count; user frames count when they carry a
    /// library nick or live under a system library directory.
    #[must_use]
    pub fn is_system_library(&self) -> bool {
        match self.0.kind {
            SymbolKind::Kernel => true,
            SymbolKind::User => {
                self.0.binary_nick.is_some()
                    || self.0.binary_path.as_deref().is_some_and(|path| {
                        SYSTEM_LIBRARY_PREFIXES.iter().any(|prefix| path.starts_with(prefix))
                    })
            }
            _ => false,
        }
    }

    /// Text for hover/detail views: `name [path+0xbegin]` for file-backed symbols.
    #[must_use]
    pub fn tooltip(&self) -> String {
        match &self.0.binary_path {
            Some(path) if !self.0.name.starts_with("In File") => {
                format!("{} [{}+0x{:x}]", self.0.name, path, self.0.begin_address)
            }
            _ => self.0.name.to_string(),
        }
    }
}

fn is_kernel_process_name(name: &str) -> bool {
    name == "rcu_preempt" || KERNEL_PROCESS_PREFIXES.iter().any(|prefix| name.starts_with(prefix))
}

impl PartialEq for Symbol {
    fn eq(&self, other: &Self) -> bool {
        if Arc::ptr_eq(&self.0, &other.0) {
            return true;
        }

        let (a, b) = (&*self.0, &*other.0);

        if a.hash != b.hash || a.kind != b.kind {
            return false;
        }

        if a.name != b.name || a.binary_nick != b.binary_nick {
            return false;
        }

        match (&a.binary_path, &b.binary_path) {
            (Some(pa), Some(pb)) => pa == pb,
            _ => true,
        }
    }
}

impl Eq for Symbol {}

impl Hash for Symbol {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.0.hash);
    }
}

impl fmt::Debug for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Symbol")
            .field("name", &self.0.name)
            .field("kind", &self.0.kind)
            .field("nick", &self.0.binary_nick)
            .field("path", &self.0.binary_path)
            .field("range", &format_args!("0x{:x}..0x{:x}", self.0.begin_address, self.0.end_address))
            .finish()
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.name)
    }
}

impl Serialize for Symbol {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;

        let mut state = serializer.serialize_struct("Symbol", 4)?;
        state.serialize_field("name", &self.0.name)?;
        state.serialize_field("nick", &self.0.binary_nick)?;
        state.serialize_field("path", &self.0.binary_path)?;
        state.serialize_field("kind", &self.0.kind)?;
        state.end()
    }
}
