//! The loaded capture: stacks, processes, embedded files, and the symbol
//! caches filled in by symbolization.
//!
//! A [`Document`] is immutable apart from its caches, which are internally
//! synchronized. It is shared as `Arc<Document>` between symbolization
//! workers and callgraph construction.

pub mod capture;
pub mod loader;
pub mod symbols;
pub mod traceable;

pub use capture::Capture;
pub use loader::DocumentLoader;
pub use traceable::{Traceable, TraceableKind, MAX_STACK_DEPTH};

use crate::domain::{AddressContext, Pid, Tid};
use crate::strings::Strings;
use crate::symbol::{Symbol, SymbolKind};
use crate::symbolization::{AddressLayout, HostNamespace, MountNamespace, ProcessInfo, SymbolCache};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

const CONTEXT_SWITCH_NICK: &str = "Context Switch";
const MISSING_PROCESS_NAME: &str = "Unknown Process";

/// Byte order of binary blobs embedded in the capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Endianness {
    Little,
    Big,
}

impl Default for Endianness {
    fn default() -> Self {
        if cfg!(target_endian = "big") {
            Self::Big
        } else {
            Self::Little
        }
    }
}

/// A name for one synthetic JIT address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JitEntry {
    pub address: u64,
    pub name: String,
}

pub struct Document {
    strings: Arc<Strings>,
    endianness: Endianness,
    traceables: Vec<Traceable>,
    processes: HashMap<Pid, ProcessInfo>,
    files: HashMap<String, Vec<u8>>,
    jitmap: Vec<JitEntry>,
    threads: RwLock<HashMap<(Pid, Tid), Symbol>>,
    context_switches: HashMap<AddressContext, Symbol>,
    missing_process: Symbol,
    kernel_cache: SymbolCache,
    symbolized: AtomicBool,
}

impl Document {
    #[must_use]
    pub fn builder() -> DocumentBuilder {
        DocumentBuilder::default()
    }

    #[must_use]
    pub fn strings(&self) -> &Strings {
        &self.strings
    }

    #[must_use]
    pub fn endianness(&self) -> Endianness {
        self.endianness
    }

    #[must_use]
    pub fn traceables(&self) -> &[Traceable] {
        &self.traceables
    }

    #[must_use]
    pub fn traceable(&self, index: usize) -> Option<&Traceable> {
        self.traceables.get(index)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.traceables.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.traceables.is_empty()
    }

    #[must_use]
    pub fn process_info(&self, pid: Pid) -> Option<&ProcessInfo> {
        self.processes.get(&pid)
    }

    /// All processes, in no particular order.
    pub fn processes(&self) -> impl Iterator<Item = &ProcessInfo> {
        self.processes.values()
    }

    /// Contents of a file embedded in the capture.
    #[must_use]
    pub fn lookup_file(&self, name: &str) -> Option<&[u8]> {
        self.files.get(name).map(Vec::as_slice)
    }

    #[must_use]
    pub fn jitmap(&self) -> &[JitEntry] {
        &self.jitmap
    }

    /// Cache of resolved kernel symbols, shared by every process.
    #[must_use]
    pub fn kernel_cache(&self) -> &SymbolCache {
        &self.kernel_cache
    }

    /// Whether [`symbolize`](Self::symbolize) has completed.
    #[must_use]
    pub fn is_symbolized(&self) -> bool {
        self.symbolized.load(Ordering::Acquire)
    }

    pub(crate) fn mark_symbolized(&self) {
        self.symbolized.store(true, Ordering::Release);
    }

    /// The process node symbol for `pid`.
    ///
    /// `shared` selects the per-command symbol so processes running the same
    /// program merge into one node.
    #[must_use]
    pub fn process_symbol(&self, pid: Pid, shared: bool) -> Symbol {
        match self.processes.get(&pid) {
            Some(info) if shared => info.shared_symbol().clone(),
            Some(info) => info.symbol().clone(),
            None => self.missing_process.clone(),
        }
    }

    /// The thread node symbol, created on first request.
    #[must_use]
    pub fn thread_symbol(&self, pid: Pid, tid: Tid) -> Symbol {
        let key = (pid, tid);
        if let Some(symbol) = self.threads.read().unwrap_or_else(PoisonError::into_inner).get(&key) {
            return symbol.clone();
        }

        let mut threads = self.threads.write().unwrap_or_else(PoisonError::into_inner);
        threads
            .entry(key)
            .or_insert_with(|| {
                let name = if pid.0 == tid.0 {
                    format!("Thread-{} (Main)", tid.0)
                } else {
                    format!("Thread-{}", tid.0)
                };
                Symbol::new(
                    self.strings.get(&name),
                    None,
                    Some(self.strings.get(&format!("({})", pid.0))),
                    0,
                    0,
                    SymbolKind::Thread,
                )
            })
            .clone()
    }

    /// The pseudo-frame marking a switch into `context`.
    #[must_use]
    pub fn context_switch_symbol(&self, context: AddressContext) -> Symbol {
        self.context_switches
            .get(&context)
            .cloned()
            .unwrap_or_else(|| context_switch(&self.strings, context))
    }

    /// Frame appended to stacks that end in kernel context.
    #[must_use]
    pub fn kernel_symbol(&self) -> Symbol {
        self.context_switch_symbol(AddressContext::Kernel)
    }
}

impl std::fmt::Debug for Document {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Document")
            .field("traceables", &self.traceables.len())
            .field("processes", &self.processes.len())
            .field("files", &self.files.keys().collect::<Vec<_>>())
            .field("jitmap", &self.jitmap.len())
            .field("symbolized", &self.is_symbolized())
            .finish_non_exhaustive()
    }
}

fn context_switch(strings: &Strings, context: AddressContext) -> Symbol {
    Symbol::new(
        strings.get(context.switch_label()),
        None,
        Some(strings.get(CONTEXT_SWITCH_NICK)),
        0,
        0,
        SymbolKind::ContextSwitch,
    )
}

struct ProcessSpec {
    pid: Pid,
    cmdline: Option<String>,
    layout: AddressLayout,
    namespace: Arc<dyn MountNamespace>,
}

/// Assembles a [`Document`] from parts. Used by the capture reader and by
/// tests that synthesize captures.
#[derive(Default)]
pub struct DocumentBuilder {
    strings: Arc<Strings>,
    endianness: Endianness,
    traceables: Vec<Traceable>,
    processes: Vec<ProcessSpec>,
    files: HashMap<String, Vec<u8>>,
    jitmap: Vec<JitEntry>,
}

impl DocumentBuilder {
    #[must_use]
    pub fn endianness(mut self, endianness: Endianness) -> Self {
        self.endianness = endianness;
        self
    }

    /// Add a process that shares the host's filesystem view.
    #[must_use]
    pub fn process(self, pid: Pid, cmdline: Option<&str>, layout: AddressLayout) -> Self {
        self.process_in_namespace(pid, cmdline, layout, Arc::new(HostNamespace))
    }

    #[must_use]
    pub fn process_in_namespace(
        mut self,
        pid: Pid,
        cmdline: Option<&str>,
        layout: AddressLayout,
        namespace: Arc<dyn MountNamespace>,
    ) -> Self {
        self.processes.push(ProcessSpec {
            pid,
            cmdline: cmdline.map(str::to_string),
            layout,
            namespace,
        });
        self
    }

    #[must_use]
    pub fn traceable(mut self, traceable: Traceable) -> Self {
        self.traceables.push(traceable);
        self
    }

    #[must_use]
    pub fn traceables(mut self, traceables: impl IntoIterator<Item = Traceable>) -> Self {
        self.traceables.extend(traceables);
        self
    }

    /// Shorthand for a CPU sample on the main thread of `pid`.
    #[must_use]
    pub fn sample(self, pid: i32, addresses: Vec<u64>) -> Self {
        self.traceable(Traceable::sample(Pid(pid), Tid(pid), addresses))
    }

    #[must_use]
    pub fn file(mut self, name: &str, contents: Vec<u8>) -> Self {
        self.files.insert(name.to_string(), contents);
        self
    }

    #[must_use]
    pub fn jit_entry(mut self, address: u64, name: &str) -> Self {
        self.jitmap.push(JitEntry { address, name: name.to_string() });
        self
    }

    /// Finish the document. A later process record for the same pid
    /// replaces an earlier one.
    #[must_use]
    pub fn build(self) -> Document {
        let strings = self.strings;

        let processes = self
            .processes
            .into_iter()
            .map(|spec| {
                let info = ProcessInfo::new(
                    &strings,
                    spec.pid,
                    spec.cmdline.as_deref(),
                    spec.layout,
                    spec.namespace,
                );
                (spec.pid, info)
            })
            .collect();

        let context_switches = AddressContext::SWITCHABLE
            .iter()
            .map(|context| (*context, context_switch(&strings, *context)))
            .collect();

        let missing_process = Symbol::new(
            strings.get(MISSING_PROCESS_NAME),
            None,
            None,
            0,
            0,
            SymbolKind::Process,
        );

        Document {
            endianness: self.endianness,
            traceables: self.traceables,
            processes,
            files: self.files,
            jitmap: self.jitmap,
            threads: RwLock::new(HashMap::new()),
            context_switches,
            missing_process,
            kernel_cache: SymbolCache::new(),
            symbolized: AtomicBool::new(false),
            strings,
        }
    }
}
