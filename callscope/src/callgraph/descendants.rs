//! A tree of everything called beneath one symbol, merged across every
//! place it appears in the callgraph.

use super::augment::{AugmentValues, Augmentation, NoAugmentation};
use super::{categorize, enter_child, sort_children, Callgraph, CallgraphFlags, Node, NodeId};
use crate::document::MAX_STACK_DEPTH;
use crate::domain::DocumentError;
use crate::symbol::{Symbol, SymbolKind};
use log::debug;
use std::ops::Deref;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Sub-tree rooted at one symbol. Nodes share the parent callgraph's
/// summaries; `G` is how the callgraph is held (a borrow, or an `Arc` for
/// trees built in the background).
pub struct Descendants<G, A = NoAugmentation>
where
    G: Deref<Target = Callgraph<A>>,
    A: Augmentation,
{
    graph: G,
    nodes: Vec<Node>,
    values: Vec<A::Value>,
}

impl<A: Augmentation> Callgraph<A> {
    /// Build the descendants tree of `symbol`, or `None` if the symbol does
    /// not appear in this callgraph.
    #[must_use]
    pub fn descendants(&self, symbol: &Symbol) -> Option<Descendants<&Self, A>> {
        self.descendants_cancellable(symbol, &CancellationToken::new()).ok().flatten()
    }

    /// [`Self::descendants`], checking `cancel` between traceables.
    ///
    /// # Errors
    /// Returns [`DocumentError::Cancelled`] if `cancel` fired.
    pub fn descendants_cancellable(
        &self,
        symbol: &Symbol,
        cancel: &CancellationToken,
    ) -> Result<Option<Descendants<&Self, A>>, DocumentError> {
        Descendants::build(self, symbol, cancel)
    }

    /// [`Self::descendants`] on the blocking pool.
    ///
    /// # Errors
    /// Returns [`DocumentError::Cancelled`] if `cancel` fired before every
    /// traceable was added; the partial tree is dropped.
    pub async fn descendants_async(
        self: Arc<Self>,
        symbol: Symbol,
        cancel: CancellationToken,
    ) -> Result<Option<Descendants<Arc<Self>, A>>, DocumentError>
    where
        A: 'static,
    {
        tokio::task::spawn_blocking(move || Descendants::build(self, &symbol, &cancel))
            .await
            .map_err(|e| DocumentError::WorkerFailed(e.to_string()))?
    }
}

impl<G, A> Descendants<G, A>
where
    G: Deref<Target = Callgraph<A>>,
    A: Augmentation,
{
    fn build(graph: G, symbol: &Symbol, cancel: &CancellationToken) -> Result<Option<Self>, DocumentError> {
        let Some(summary) = graph.summary_id(symbol) else { return Ok(None) };

        let from = graph.summaries()[summary].symbol().clone();
        let traceables = graph.summaries()[summary].traceables().clone();
        let mut tree = Self { graph, nodes: vec![Node::new(summary, None)], values: vec![A::Value::default()] };

        let mut symbols = Vec::new();
        for index in traceables.iter() {
            if cancel.is_cancelled() {
                return Err(DocumentError::Cancelled);
            }
            tree.add_traceable(index, &from, &mut symbols);
        }

        let left_heavy = tree.graph.flags().contains(CallgraphFlags::LEFT_HEAVY);
        sort_children(&mut tree.nodes, tree.graph.summaries(), left_heavy);
        debug!("Descendants of {}: {} nodes", from.name(), tree.nodes.len());
        Ok(Some(tree))
    }

    /// Stacks with nothing beneath `from` leave the tree untouched, root
    /// count included.
    fn add_traceable(&mut self, index: usize, from: &Symbol, symbols: &mut Vec<Symbol>) {
        let graph: &Callgraph<A> = &self.graph;
        let document = graph.document();
        let flags = graph.flags();
        let Some(traceable) = document.traceable(index) else { return };

        document.symbolize_traceable(traceable, symbols, MAX_STACK_DEPTH);

        if matches!(from.kind(), SymbolKind::Process | SymbolKind::Thread) {
            if flags.contains(CallgraphFlags::INCLUDE_THREADS) {
                symbols.push(document.thread_symbol(traceable.pid, traceable.tid));
            }
            let merge = flags.contains(CallgraphFlags::MERGE_SIMILAR_PROCESSES);
            symbols.push(document.process_symbol(traceable.pid, merge));
        }

        // Drop everything from the outermost frame down to `from`.
        let Some(position) = symbols.iter().rposition(|s| s == from) else { return };
        symbols.truncate(position);
        if symbols.is_empty() {
            return;
        }

        self.nodes[NodeId::ROOT.0].count += 1;

        let mut parent = NodeId::ROOT;
        for symbol in symbols.iter().rev() {
            let Some(summary) = graph.summary_id(symbol) else { continue };
            parent = enter_child(&mut self.nodes, parent, summary);
            if self.values.len() < self.nodes.len() {
                self.values.push(A::Value::default());
            }
        }

        self.nodes[parent.0].is_toplevel = true;

        let mut values =
            AugmentValues { nodes: &self.nodes, node_values: self.values.as_mut_slice(), summary_values: None };
        graph.augmentation_impl().augment(&mut values, parent, traceable, false);

        if flags.contains(CallgraphFlags::CATEGORIZE_FRAMES) {
            categorize(&mut self.nodes, graph.summaries(), graph.classifier(), parent);
        }
    }

    #[must_use]
    pub fn root(&self) -> NodeId {
        NodeId::ROOT
    }

    #[must_use]
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn symbol(&self, id: NodeId) -> &Symbol {
        self.graph.summaries()[self.nodes[id.0].summary].symbol()
    }

    #[must_use]
    pub fn value(&self, id: NodeId) -> &A::Value {
        &self.values[id.0]
    }

    /// Follow children by symbol name from the root.
    #[must_use]
    pub fn find_path(&self, names: &[&str]) -> Option<NodeId> {
        names.iter().try_fold(NodeId::ROOT, |parent, name| {
            self.nodes[parent.0].children.iter().copied().find(|&child| self.symbol(child).name().as_str() == *name)
        })
    }
}

impl<G, A> std::fmt::Debug for Descendants<G, A>
where
    G: Deref<Target = Callgraph<A>>,
    A: Augmentation,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Descendants")
            .field("root", &self.symbol(NodeId::ROOT).name())
            .field("nodes", &self.nodes.len())
            .finish_non_exhaustive()
    }
}
