//! Aggregation of symbolized stacks into a call tree.
//!
//! # Architecture
//!
//! - **Nodes** live in one arena (`Vec<Node>`) and refer to each other by
//!   [`NodeId`]. Node 0 is the "All Processes" root.
//! - **Summaries** hold one entry per distinct [`Symbol`]: the callers seen
//!   for it and the set of samples whose stack passed through it.
//! - **Augmentation** values sit in parallel arenas next to nodes and
//!   summaries (see [`augment`]).
//!
//! ## Data Flow
//!
//! ```text
//! Document (symbolized)
//!     │
//!     ├──► symbolize_traceable()   ← cache reads only
//!     │
//!     ├──► flags: threads, bottom-up, hide libraries, ...
//!     │
//!     └──► insert outermost first ─► summaries ─► augment ─► categorize
//!                                                          │
//!                                            sort children ◄┘
//! ```
//!
//! Construction runs on one thread. A finished [`Callgraph`] is read-only
//! and can be shared freely.

pub mod augment;
pub mod bitset;
pub mod categories;
pub mod descendants;
pub mod query;
pub mod report;

pub use augment::{AllocationSizes, AllocationTotals, AugmentValues, Augmentation, NoAugmentation};
pub use bitset::SampleSet;
pub use categories::{Category, CategoryRules, CategoryTag, NodeClassifier};
pub use descendants::Descendants;
pub use report::NodeReport;

use crate::document::{Document, MAX_STACK_DEPTH};
use crate::domain::{AddressContext, DocumentError};
use crate::symbol::{Symbol, SymbolKind};
use log::{debug, info};
use std::collections::HashMap;
use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

const ROOT_NAME: &str = "All Processes";
const UNWINDABLE_NAME: &str = "Unwindable";

// =============================================================================
// FLAGS
// =============================================================================

/// Options controlling how stacks are shaped before insertion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CallgraphFlags(u32);

impl CallgraphFlags {
    /// Insert a per-thread node under each process
    pub const INCLUDE_THREADS: Self = Self(1 << 0);
    /// Skip frames from system libraries and the kernel
    pub const HIDE_SYSTEM_LIBRARIES: Self = Self(1 << 1);
    /// Leaf functions at the top, callers below
    pub const BOTTOM_UP: Self = Self(1 << 2);
    pub const CATEGORIZE_FRAMES: Self = Self(1 << 3);
    /// Skip samples from the idle process
    pub const IGNORE_PROCESS_0: Self = Self(1 << 4);
    /// Order children by descending count instead of by name
    pub const LEFT_HEAVY: Self = Self(1 << 5);
    /// One node per program instead of per process
    pub const MERGE_SIMILAR_PROCESSES: Self = Self(1 << 6);
    pub const IGNORE_KERNEL_PROCESSES: Self = Self(1 << 7);

    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn set(&mut self, other: Self, enabled: bool) {
        if enabled {
            self.0 |= other.0;
        } else {
            self.0 &= !other.0;
        }
    }
}

impl BitOr for CallgraphFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for CallgraphFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

// =============================================================================
// NODES AND SUMMARIES
// =============================================================================

/// Index of a node in its tree's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) usize);

impl NodeId {
    pub const ROOT: NodeId = NodeId(0);

    #[must_use]
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone)]
pub struct Node {
    pub(crate) summary: usize,
    pub(crate) parent: Option<NodeId>,
    pub(crate) children: Vec<NodeId>,
    pub(crate) count: u64,
    pub(crate) category: Option<CategoryTag>,
    pub(crate) is_toplevel: bool,
}

impl Node {
    fn new(summary: usize, parent: Option<NodeId>) -> Self {
        Self { summary, parent, children: Vec::new(), count: 0, category: None, is_toplevel: false }
    }

    #[must_use]
    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    #[must_use]
    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    /// Samples whose stack passed through this node.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Assigned by the categorize pass; `Uncategorized` before it runs.
    #[must_use]
    pub fn category(&self) -> Category {
        self.category.map(|tag| tag.category).unwrap_or_default()
    }

    /// True when at least one stack ended at this node.
    #[must_use]
    pub fn is_toplevel(&self) -> bool {
        self.is_toplevel
    }
}

/// Everything known about one symbol across the whole tree.
#[derive(Debug, Clone)]
pub struct Summary {
    symbol: Symbol,
    callers: Vec<Symbol>,
    traceables: SampleSet,
}

impl Summary {
    fn new(symbol: Symbol) -> Self {
        Self { symbol, callers: Vec::new(), traceables: SampleSet::new() }
    }

    #[must_use]
    pub fn symbol(&self) -> &Symbol {
        &self.symbol
    }

    #[must_use]
    pub fn callers(&self) -> &[Symbol] {
        &self.callers
    }

    #[must_use]
    pub fn traceables(&self) -> &SampleSet {
        &self.traceables
    }
}

/// The child of `parent` for `summary`, created if missing. Increments the
/// child's count either way.
pub(crate) fn enter_child(nodes: &mut Vec<Node>, parent: NodeId, summary: usize) -> NodeId {
    let existing = nodes[parent.0].children.iter().copied().find(|&child| nodes[child.0].summary == summary);

    let child = existing.unwrap_or_else(|| {
        let id = NodeId(nodes.len());
        nodes.push(Node::new(summary, Some(parent)));
        nodes[parent.0].children.push(id);
        id
    });

    nodes[child.0].count += 1;
    child
}

/// Order every child list by name, or by descending count for left-heavy
/// layouts. Ties keep insertion order.
pub(crate) fn sort_children(nodes: &mut [Node], summaries: &[Summary], left_heavy: bool) {
    for index in 0..nodes.len() {
        let mut children = std::mem::take(&mut nodes[index].children);
        if left_heavy {
            children.sort_by(|a, b| nodes[b.0].count.cmp(&nodes[a.0].count));
        } else {
            children.sort_by(|a, b| {
                let a = summaries[nodes[a.0].summary].symbol.name();
                let b = summaries[nodes[b.0].summary].symbol.name();
                a.as_str().cmp(b.as_str())
            });
        }
        nodes[index].children = children;
    }
}

/// Assign categories to `node` and any uncategorized ancestors, outermost
/// first.
pub(crate) fn categorize(nodes: &mut [Node], summaries: &[Summary], classifier: &dyn NodeClassifier, node: NodeId) {
    let mut pending = Vec::new();
    let mut cursor = Some(node);
    while let Some(id) = cursor {
        if nodes[id.0].category.is_some() {
            break;
        }
        pending.push(id);
        cursor = nodes[id.0].parent;
    }

    for id in pending.into_iter().rev() {
        let symbol = &summaries[nodes[id.0].summary].symbol;
        let tag = match symbol.kind() {
            SymbolKind::Root | SymbolKind::Process | SymbolKind::Thread => CategoryTag::new(Category::Presentation),
            SymbolKind::ContextSwitch => CategoryTag::new(Category::ContextSwitch),
            SymbolKind::Unwindable => CategoryTag::new(Category::Unwindable),
            SymbolKind::User | SymbolKind::Kernel => classifier
                .classify(symbol)
                .filter(|tag| tag.category != Category::Uncategorized)
                .unwrap_or_else(|| inherited(nodes, id)),
        };
        nodes[id.0].category = Some(tag);
    }
}

fn inherited(nodes: &[Node], node: NodeId) -> CategoryTag {
    let mut cursor = nodes[node.0].parent;
    while let Some(id) = cursor {
        if let Some(tag) = nodes[id.0].category.filter(|tag| tag.inherit) {
            return tag;
        }
        cursor = nodes[id.0].parent;
    }
    CategoryTag::new(Category::Uncategorized)
}

// =============================================================================
// BUILDER
// =============================================================================

/// Configures and runs callgraph construction.
pub struct CallgraphBuilder<A: Augmentation = NoAugmentation> {
    flags: CallgraphFlags,
    augmentation: A,
    classifier: Arc<dyn NodeClassifier>,
}

impl CallgraphBuilder<NoAugmentation> {
    #[must_use]
    pub fn new(flags: CallgraphFlags) -> Self {
        Self { flags, augmentation: NoAugmentation, classifier: Arc::new(CategoryRules::builtin()) }
    }
}

impl<A: Augmentation> CallgraphBuilder<A> {
    /// Attach per-node data computed while stacks are inserted.
    #[must_use]
    pub fn augmentation<B: Augmentation>(self, augmentation: B) -> CallgraphBuilder<B> {
        CallgraphBuilder { flags: self.flags, augmentation, classifier: self.classifier }
    }

    /// Replace the built-in category rules.
    #[must_use]
    pub fn classifier(mut self, classifier: Arc<dyn NodeClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    /// Build from the traceables at `selection` (document indices), in order.
    #[must_use]
    pub fn build(self, document: Arc<Document>, selection: impl IntoIterator<Item = usize>) -> Callgraph<A> {
        let mut graph = Callgraph::empty(document, self.flags, self.augmentation, self.classifier);
        graph.populate(selection, None);
        graph
    }

    /// [`Self::build`] on the blocking pool.
    ///
    /// # Errors
    /// Returns [`DocumentError::Cancelled`] if `cancel` fired before every
    /// traceable was inserted; the partial tree is dropped.
    pub async fn build_async(
        self,
        document: Arc<Document>,
        selection: Vec<usize>,
        cancel: CancellationToken,
    ) -> Result<Callgraph<A>, DocumentError>
    where
        A: 'static,
    {
        tokio::task::spawn_blocking(move || {
            let mut graph = Callgraph::empty(document, self.flags, self.augmentation, self.classifier);
            if graph.populate(selection, Some(&cancel)) {
                Ok(graph)
            } else {
                Err(DocumentError::Cancelled)
            }
        })
        .await
        .map_err(|e| DocumentError::WorkerFailed(e.to_string()))?
    }
}

// =============================================================================
// CALLGRAPH
// =============================================================================

pub struct Callgraph<A: Augmentation = NoAugmentation> {
    document: Arc<Document>,
    flags: CallgraphFlags,
    nodes: Vec<Node>,
    node_values: Vec<A::Value>,
    summaries: Vec<Summary>,
    summary_index: HashMap<Symbol, usize>,
    summary_values: Vec<A::Value>,
    augmentation: A,
    classifier: Arc<dyn NodeClassifier>,
    selection: SampleSet,
    height: usize,
    unwindable: Symbol,
}

impl Callgraph<NoAugmentation> {
    /// Build over every traceable in `document`.
    #[must_use]
    pub fn new(document: Arc<Document>, flags: CallgraphFlags) -> Self {
        let all = 0..document.len();
        CallgraphBuilder::new(flags).build(document, all)
    }
}

impl<A: Augmentation> Callgraph<A> {
    fn empty(document: Arc<Document>, flags: CallgraphFlags, augmentation: A, classifier: Arc<dyn NodeClassifier>) -> Self {
        let strings = document.strings();
        let root = Symbol::new(strings.get(ROOT_NAME), None, None, 0, 0, SymbolKind::Root);
        let unwindable = Symbol::new(strings.get(UNWINDABLE_NAME), None, None, 0, 0, SymbolKind::Unwindable);

        let mut graph = Self {
            document,
            flags,
            nodes: Vec::new(),
            node_values: Vec::new(),
            summaries: Vec::new(),
            summary_index: HashMap::new(),
            summary_values: Vec::new(),
            augmentation,
            classifier,
            selection: SampleSet::new(),
            height: 0,
            unwindable,
        };

        let summary = graph.summary_for(&root);
        graph.nodes.push(Node::new(summary, None));
        graph.node_values.push(A::Value::default());
        graph
    }

    /// Insert every selected traceable, then sort. Returns false if cancelled.
    fn populate(&mut self, selection: impl IntoIterator<Item = usize>, cancel: Option<&CancellationToken>) -> bool {
        let started = Instant::now();
        let mut symbols = Vec::new();

        for index in selection {
            if cancel.is_some_and(CancellationToken::is_cancelled) {
                return false;
            }
            self.add_traceable(index, &mut symbols);
        }

        sort_children(&mut self.nodes, &self.summaries, self.flags.contains(CallgraphFlags::LEFT_HEAVY));

        info!(
            "Callgraph built: {} nodes, {} symbols, height {} in {:.2?}",
            self.nodes.len(),
            self.summaries.len(),
            self.height,
            started.elapsed()
        );
        true
    }

    fn summary_for(&mut self, symbol: &Symbol) -> usize {
        if let Some(&index) = self.summary_index.get(symbol) {
            return index;
        }

        let index = self.summaries.len();
        self.summaries.push(Summary::new(symbol.clone()));
        self.summary_values.push(A::Value::default());
        self.summary_index.insert(symbol.clone(), index);
        index
    }

    fn add_traceable(&mut self, index: usize, symbols: &mut Vec<Symbol>) {
        let document = Arc::clone(&self.document);
        let Some(traceable) = document.traceable(index) else {
            debug!("No traceable at index {index}");
            return;
        };

        if traceable.pid.0 == 0 && self.flags.contains(CallgraphFlags::IGNORE_PROCESS_0) {
            return;
        }

        let process = document.process_symbol(traceable.pid, self.flags.contains(CallgraphFlags::MERGE_SIMILAR_PROCESSES));
        if process.is_kernel_process() && self.flags.contains(CallgraphFlags::IGNORE_KERNEL_PROCESSES) {
            return;
        }

        let depth = traceable.depth();
        if depth == 0 || depth > MAX_STACK_DEPTH {
            debug!("Skipping traceable {index} with stack depth {depth}");
            return;
        }

        self.selection.insert(index);
        let context = document.symbolize_traceable(traceable, symbols, depth);

        // A lone "- - User - -" frame means the unwind captured nothing.
        if symbols.len() == 1 && symbols[0].is_context_switch() && context == AddressContext::User {
            symbols[0] = self.unwindable.clone();
        }
        // Nothing resolved. The sample is in the selection, so it still
        // lands somewhere: under "Unwindable".
        if symbols.is_empty() {
            symbols.push(self.unwindable.clone());
        }

        if context == AddressContext::Kernel {
            symbols.push(document.kernel_symbol());
        }

        if symbols[0].is_context_switch() {
            symbols.remove(0);
        }

        if self.flags.contains(CallgraphFlags::BOTTOM_UP) {
            symbols.reverse();
        }

        if self.flags.contains(CallgraphFlags::INCLUDE_THREADS) {
            symbols.push(document.thread_symbol(traceable.pid, traceable.tid));
        }
        symbols.push(process);

        // The root frame is implicit.
        self.height = self.height.max(symbols.len() + 1);

        let node = self.insert(symbols, index);
        self.nodes[node.0].is_toplevel = true;

        let mut values = AugmentValues {
            nodes: &self.nodes,
            node_values: self.node_values.as_mut_slice(),
            summary_values: Some(self.summary_values.as_mut_slice()),
        };
        self.augmentation.augment(&mut values, node, traceable, true);

        if self.flags.contains(CallgraphFlags::CATEGORIZE_FRAMES) {
            categorize(&mut self.nodes, &self.summaries, self.classifier.as_ref(), node);
        }
    }

    /// Insert `symbols` (leaf first, outermost last) below the root and
    /// record `index` on every summary along the path.
    fn insert(&mut self, symbols: &[Symbol], index: usize) -> NodeId {
        let hide = self.flags.contains(CallgraphFlags::HIDE_SYSTEM_LIBRARIES);
        let mut parent = NodeId::ROOT;
        self.nodes[NodeId::ROOT.0].count += 1;

        for symbol in symbols.iter().rev() {
            if hide && symbol.is_system_library() {
                continue;
            }
            let summary = self.summary_for(symbol);
            parent = enter_child(&mut self.nodes, parent, summary);
            if self.node_values.len() < self.nodes.len() {
                self.node_values.push(A::Value::default());
            }
        }

        self.record_path(parent, index);
        parent
    }

    fn record_path(&mut self, leaf: NodeId, index: usize) {
        let mut cursor = Some(leaf);
        while let Some(id) = cursor {
            let node = &self.nodes[id.0];
            self.summaries[node.summary].traceables.insert(index);

            if let Some(parent) = node.parent {
                let caller = self.summaries[self.nodes[parent.0].summary].symbol.clone();
                let callers = &mut self.summaries[node.summary].callers;
                if !matches!(caller.kind(), SymbolKind::Process | SymbolKind::Root) && !callers.contains(&caller) {
                    callers.push(caller);
                }
            }

            cursor = node.parent;
        }
    }

    // -------------------------------------------------------------------------
    // Accessors
    // -------------------------------------------------------------------------

    #[must_use]
    pub fn document(&self) -> &Arc<Document> {
        &self.document
    }

    #[must_use]
    pub fn flags(&self) -> CallgraphFlags {
        self.flags
    }

    #[must_use]
    pub fn root(&self) -> NodeId {
        NodeId::ROOT
    }

    /// # Panics
    /// Panics if `id` did not come from this callgraph.
    #[must_use]
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    #[must_use]
    pub fn get_node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.0)
    }

    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn symbol(&self, id: NodeId) -> &Symbol {
        &self.summaries[self.nodes[id.0].summary].symbol
    }

    /// Samples that ended exactly at `id`.
    #[must_use]
    pub fn self_count(&self, id: NodeId) -> u64 {
        let node = &self.nodes[id.0];
        let below: u64 = node.children.iter().map(|c| self.nodes[c.0].count).sum();
        node.count.saturating_sub(below)
    }

    /// `id` followed by its ancestors up to the root.
    #[must_use]
    pub fn path_to_root(&self, id: NodeId) -> Vec<NodeId> {
        std::iter::successors(Some(id), |n| self.nodes[n.0].parent).collect()
    }

    /// Number of frames in the tallest inserted stack, root included.
    #[must_use]
    pub fn height(&self) -> usize {
        self.height
    }

    #[must_use]
    pub fn summary(&self, symbol: &Symbol) -> Option<&Summary> {
        self.summary_index.get(symbol).map(|&i| &self.summaries[i])
    }

    /// Summary of the symbol `id` stands for.
    #[must_use]
    pub fn node_summary(&self, id: NodeId) -> &Summary {
        &self.summaries[self.nodes[id.0].summary]
    }

    #[must_use]
    pub fn node_value(&self, id: NodeId) -> &A::Value {
        &self.node_values[id.0]
    }

    #[must_use]
    pub fn summary_value(&self, symbol: &Symbol) -> Option<&A::Value> {
        self.summary_index.get(symbol).map(|&i| &self.summary_values[i])
    }

    /// Traceables that were inserted (document indices).
    #[must_use]
    pub fn selection(&self) -> &SampleSet {
        &self.selection
    }

    /// Depth-first search for the first node standing for `symbol`.
    #[must_use]
    pub fn find_node(&self, symbol: &Symbol) -> Option<NodeId> {
        let target = *self.summary_index.get(symbol)?;
        let mut stack = vec![NodeId::ROOT];
        while let Some(id) = stack.pop() {
            let node = &self.nodes[id.0];
            if node.summary == target {
                return Some(id);
            }
            stack.extend(node.children.iter().rev());
        }
        None
    }

    /// Follow children by name from the root, e.g. `["app (42)", "main"]`.
    ///
    /// Names are matched against the symbol name; process and thread nodes
    /// also match their name followed by their nick.
    #[must_use]
    pub fn find_path(&self, names: &[&str]) -> Option<NodeId> {
        names.iter().try_fold(NodeId::ROOT, |parent, name| {
            self.nodes[parent.0].children.iter().copied().find(|&child| {
                let symbol = self.symbol(child);
                symbol.name().as_str() == *name
                    || symbol.binary_nick().is_some_and(|nick| format!("{} {}", symbol.name(), nick) == *name)
            })
        })
    }

    pub(crate) fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub(crate) fn summaries(&self) -> &[Summary] {
        &self.summaries
    }

    pub(crate) fn summary_id(&self, symbol: &Symbol) -> Option<usize> {
        self.summary_index.get(symbol).copied()
    }

    pub(crate) fn augmentation_impl(&self) -> &A {
        &self.augmentation
    }

    pub(crate) fn classifier(&self) -> &dyn NodeClassifier {
        self.classifier.as_ref()
    }
}

impl<A: Augmentation> fmt::Debug for Callgraph<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callgraph")
            .field("flags", &self.flags)
            .field("nodes", &self.nodes.len())
            .field("symbols", &self.summaries.len())
            .field("samples", &self.selection.len())
            .field("height", &self.height)
            .finish_non_exhaustive()
    }
}
