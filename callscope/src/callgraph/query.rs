//! Read-side questions over a finished callgraph.

use super::augment::Augmentation;
use super::{Callgraph, CallgraphFlags, NodeId, SampleSet};
use crate::document::{Document, MAX_STACK_DEPTH};
use crate::domain::DocumentError;
use crate::symbol::{Symbol, SymbolKind};
use log::{debug, warn};
use regex::Regex;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Default cap on [`Callgraph::samples_for_node_path`] results.
pub const MAX_NODE_PATH_SAMPLES: usize = 1000;

/// Symbols along a node's path plus the samples each one touched.
#[derive(Debug, Clone)]
pub struct NodePath {
    prefix: Vec<Symbol>,
    candidates: SampleSet,
}

impl<A: Augmentation> Callgraph<A> {
    /// Distinct callers of `symbol` (process and root frames excluded).
    #[must_use]
    pub fn list_callers(&self, symbol: &Symbol) -> Vec<Symbol> {
        self.summary(symbol).map(|s| s.callers().to_vec()).unwrap_or_default()
    }

    /// Sample indices whose stack contains `symbol`, ascending.
    #[must_use]
    pub fn samples_for_symbol(&self, symbol: &Symbol) -> Vec<usize> {
        self.summary(symbol).map(|s| s.traceables().to_vec()).unwrap_or_default()
    }

    /// Every symbol in the tree, in the order first seen.
    #[must_use]
    pub fn list_symbols(&self) -> Vec<Symbol> {
        self.summaries().iter().map(|s| s.symbol().clone()).collect()
    }

    /// Samples containing any symbol whose name matches the glob `pattern`
    /// (`*` and `?` wildcards). An empty pattern matches every sample.
    #[must_use]
    pub fn list_samples_matching(&self, pattern: &str) -> SampleSet {
        if pattern.is_empty() {
            return self.selection().clone();
        }

        let regex = match glob_to_regex(pattern) {
            Ok(regex) => regex,
            Err(e) => {
                warn!("Bad symbol pattern '{pattern}': {e}");
                return SampleSet::new();
            }
        };

        let mut matched = SampleSet::new();
        for summary in self.summaries() {
            if regex.is_match(summary.symbol().name()) {
                matched.union_with(summary.traceables());
            }
        }
        matched
    }

    /// Collect the user and kernel frames from `node` to the root, in stack
    /// order, and intersect their sample sets.
    #[must_use]
    pub fn node_path(&self, node: NodeId) -> NodePath {
        let mut prefix = Vec::new();
        let mut sets: Vec<&SampleSet> = Vec::new();

        for id in self.path_to_root(node) {
            let summary = self.node_summary(id);
            if matches!(summary.symbol().kind(), SymbolKind::User | SymbolKind::Kernel) {
                prefix.push(summary.symbol().clone());
                sets.push(summary.traceables());
            }
        }

        // Stacks are leaf first. Top-down paths already walk leaf to root.
        if self.flags().contains(CallgraphFlags::BOTTOM_UP) {
            prefix.reverse();
        }

        sets.sort_by_key(|set| set.len());
        let mut sets = sets.into_iter();
        let candidates = match sets.next() {
            Some(first) => sets.fold(first.clone(), |mut acc, set| {
                acc.intersect_with(set);
                acc
            }),
            None => SampleSet::new(),
        };

        NodePath { prefix, candidates }
    }

    /// Samples whose stack contains the user and kernel frames on the path
    /// from the root to `node`, in order. At most `max` results, ascending.
    #[must_use]
    pub fn samples_for_node_path(&self, node: NodeId, max: usize) -> Vec<usize> {
        self.node_path(node).matching_samples(self.document(), max, &CancellationToken::new())
    }

    /// [`Self::samples_for_node_path`] on the blocking pool.
    ///
    /// # Errors
    /// Returns [`DocumentError::Cancelled`] if `cancel` fired before the scan
    /// finished.
    pub async fn samples_for_node_path_async(
        &self,
        node: NodeId,
        max: usize,
        cancel: CancellationToken,
    ) -> Result<Vec<usize>, DocumentError> {
        let path = self.node_path(node);
        let document = Arc::clone(self.document());

        tokio::task::spawn_blocking(move || {
            let found = path.matching_samples(&document, max, &cancel);
            if cancel.is_cancelled() {
                Err(DocumentError::Cancelled)
            } else {
                Ok(found)
            }
        })
        .await
        .map_err(|e| DocumentError::WorkerFailed(e.to_string()))?
    }
}

impl NodePath {
    #[must_use]
    pub fn prefix(&self) -> &[Symbol] {
        &self.prefix
    }

    /// Samples containing every prefix symbol somewhere, before ordering is
    /// checked.
    #[must_use]
    pub fn candidates(&self) -> &SampleSet {
        &self.candidates
    }

    fn matching_samples(&self, document: &Document, max: usize, cancel: &CancellationToken) -> Vec<usize> {
        let mut found = Vec::new();
        if self.prefix.is_empty() {
            return found;
        }

        let mut symbols = Vec::new();
        for index in self.candidates.iter() {
            if found.len() >= max || cancel.is_cancelled() {
                break;
            }
            let Some(traceable) = document.traceable(index) else { continue };
            if traceable.depth() > MAX_STACK_DEPTH {
                continue;
            }

            document.symbolize_traceable(traceable, &mut symbols, MAX_STACK_DEPTH);
            if is_ordered_subsequence(&self.prefix, &symbols) {
                found.push(index);
            }
        }

        debug!("{} of {} candidate samples matched the node path", found.len(), self.candidates.len());
        found
    }
}

/// True if every `needle` appears in `haystack` in the same order.
fn is_ordered_subsequence(needle: &[Symbol], haystack: &[Symbol]) -> bool {
    let mut rest = haystack.iter();
    needle.iter().all(|wanted| rest.any(|symbol| symbol == wanted))
}

/// Anchored regex for a shell-style glob (`*` and `?` wildcards).
///
/// # Errors
/// Returns an error if the resulting expression is too large.
pub fn glob_to_regex(pattern: &str) -> Result<Regex, regex::Error> {
    let mut source = String::with_capacity(pattern.len() + 8);
    source.push('^');
    for c in pattern.chars() {
        match c {
            '*' => source.push_str(".*"),
            '?' => source.push('.'),
            c => source.push_str(&regex::escape(c.encode_utf8(&mut [0; 4]))),
        }
    }
    source.push('$');
    Regex::new(&source)
}
