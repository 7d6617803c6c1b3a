//! Per-node and per-symbol data attached while a callgraph is built.
//!
//! An [`Augmentation`] sees every inserted stack together with the node it
//! ended at, and may update values stored alongside nodes and summaries.
//! Values start as `Default::default()`.

use super::{Node, NodeId};
use crate::document::Traceable;
use serde::Serialize;

pub trait Augmentation: Send + Sync {
    type Value: Default + Send + Sync;

    /// Called once per inserted stack with the node it ended at.
    ///
    /// `summarize` is false while building descendants trees, where summary
    /// values are not available.
    fn augment(&self, values: &mut AugmentValues<'_, Self::Value>, node: NodeId, traceable: &Traceable, summarize: bool);
}

/// No extra data.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoAugmentation;

impl Augmentation for NoAugmentation {
    type Value = ();

    fn augment(&self, _values: &mut AugmentValues<'_, ()>, _node: NodeId, _traceable: &Traceable, _summarize: bool) {}
}

/// Mutable access to augmentation values during insertion.
pub struct AugmentValues<'a, V> {
    pub(super) nodes: &'a [Node],
    pub(super) node_values: &'a mut [V],
    pub(super) summary_values: Option<&'a mut [V]>,
}

impl<V> AugmentValues<'_, V> {
    /// Count of the node as of this insertion.
    #[must_use]
    pub fn count(&self, node: NodeId) -> u64 {
        self.nodes[node.0].count
    }

    pub fn node(&mut self, node: NodeId) -> &mut V {
        &mut self.node_values[node.0]
    }

    /// Value of the symbol summary `node` belongs to, when available.
    pub fn summary(&mut self, node: NodeId) -> Option<&mut V> {
        let summary = self.nodes[node.0].summary;
        self.summary_values.as_deref_mut().map(|values| &mut values[summary])
    }

    #[must_use]
    pub fn parent(&self, node: NodeId) -> Option<NodeId> {
        self.nodes[node.0].parent
    }

    /// `node` followed by each of its ancestors up to the root.
    pub fn ancestors(&self, node: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        std::iter::successors(Some(node), |n| self.nodes[n.0].parent)
    }
}

/// Totals for allocation captures.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AllocationTotals {
    /// Sum of allocation sizes (frees are negative)
    pub size: i64,
    /// Number of allocation events
    pub count: u64,
}

/// Sums allocation sizes along each stack's path to the root.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllocationSizes;

impl Augmentation for AllocationSizes {
    type Value = AllocationTotals;

    fn augment(
        &self,
        values: &mut AugmentValues<'_, AllocationTotals>,
        node: NodeId,
        traceable: &Traceable,
        summarize: bool,
    ) {
        let Some(size) = traceable.allocation_size() else { return };

        let path: Vec<NodeId> = values.ancestors(node).collect();
        for id in path {
            let totals = values.node(id);
            totals.size += size;
            totals.count += 1;

            if summarize {
                if let Some(totals) = values.summary(id) {
                    totals.size += size;
                    totals.count += 1;
                }
            }
        }
    }
}
