//! Rendering a callgraph for people (indented text) and for tools (JSON).

// Percentage calculations intentionally convert u64 to f64
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::format_push_string)]

use super::augment::Augmentation;
use super::{Callgraph, Category, NodeId};
use crate::domain::ExportError;
use crate::symbol::SymbolKind;
use serde::Serialize;
use std::io::Write;

/// One node of an exported tree.
#[derive(Debug, Clone, Serialize)]
pub struct NodeReport {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nick: Option<String>,
    pub kind: SymbolKind,
    pub category: Category,
    /// Samples through this node
    pub total: u64,
    /// Samples ending at this node
    #[serde(rename = "count")]
    pub self_count: u64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<NodeReport>,
}

impl<A: Augmentation> Callgraph<A> {
    /// Owned copy of the subtree at `id`.
    ///
    /// # Errors
    /// Returns [`ExportError::UnknownNode`] if `id` is not in this callgraph.
    pub fn report(&self, id: NodeId) -> Result<NodeReport, ExportError> {
        if self.get_node(id).is_none() {
            return Err(ExportError::UnknownNode(id.index()));
        }
        Ok(self.report_node(id))
    }

    fn report_node(&self, id: NodeId) -> NodeReport {
        let node = self.node(id);
        let symbol = self.symbol(id);
        NodeReport {
            name: symbol.name().to_string(),
            nick: symbol.binary_nick().map(ToString::to_string),
            kind: symbol.kind(),
            category: node.category(),
            total: node.count(),
            self_count: self.self_count(id),
            children: node.children().iter().map(|&child| self.report_node(child)).collect(),
        }
    }

    /// Write the whole tree as pretty-printed JSON.
    ///
    /// # Errors
    /// Returns an error if serialization or the writer fails.
    pub fn write_json<W: Write>(&self, writer: W) -> Result<(), ExportError> {
        serde_json::to_writer_pretty(writer, &self.report_node(NodeId::ROOT))?;
        Ok(())
    }

    /// Indented text tree, one node per line:
    ///
    /// ```text
    /// All Processes                              6  100.00%
    ///   app --flag (1)                           6  100.00%
    ///     main                                   4   66.67%
    /// ```
    ///
    /// Nodes deeper than `max_depth` or below `min_fraction` of the root's
    /// count are left out.
    #[must_use]
    pub fn format_tree(&self, max_depth: usize, min_fraction: f64) -> String {
        let mut output = String::new();
        let total = self.node(NodeId::ROOT).count().max(1);
        let mut stack = vec![(NodeId::ROOT, 0usize)];

        while let Some((id, depth)) = stack.pop() {
            let node = self.node(id);
            let fraction = node.count() as f64 / total as f64;
            if fraction < min_fraction {
                continue;
            }

            let symbol = self.symbol(id);
            let label = match symbol.binary_nick() {
                Some(nick) if matches!(symbol.kind(), SymbolKind::Process | SymbolKind::Thread) => {
                    format!("{} {}", symbol.name(), nick)
                }
                Some(nick) => format!("{} [{}]", symbol.name(), nick),
                None => symbol.name().to_string(),
            };

            let indent = "  ".repeat(depth);
            output.push_str(&format!(
                "{:<width$} {:>8} {:>7.2}%\n",
                format!("{indent}{label}"),
                node.count(),
                fraction * 100.0,
                width = 60
            ));

            if depth < max_depth {
                stack.extend(node.children().iter().rev().map(|&child| (child, depth + 1)));
            }
        }

        output
    }
}
