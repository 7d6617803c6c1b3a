mod support;

use callscope::callgraph::{Augmentation, Callgraph, CallgraphFlags, NodeId};
use callscope::config::SymbolizerConfig;
use callscope::document::{Document, DocumentLoader, Endianness};
use callscope::domain::Pid;
use callscope::strings::Strings;
use callscope::symbol::{Symbol, SymbolKind};
use callscope::symbolization::{AddressLayout, BundleWriter, BundledSymbolizer, MultiSymbolizer};
use proptest::prelude::*;
use std::sync::Arc;
use support::document_with_functions;

const FUNCTIONS: [&str; 6] = ["alpha", "bravo", "charlie", "delta", "echo", "foxtrot"];

fn child_names<A: Augmentation>(graph: &Callgraph<A>, id: NodeId) -> Vec<String> {
    graph.node(id).children().iter().map(|&child| graph.symbol(child).name().to_string()).collect()
}

#[test]
fn test_identical_stacks_merge_into_one_path() {
    let stack = vec!["leaf", "mid", "outer"];
    let document = document_with_functions(&["leaf", "mid", "outer"], &[stack.clone(), stack]);
    let graph = Callgraph::new(document, CallgraphFlags::empty());

    let process = graph.find_path(&["app"]).unwrap();
    assert_eq!(graph.node(process).children().len(), 1);

    let outer = graph.find_path(&["app", "outer"]).unwrap();
    let mid = graph.find_path(&["app", "outer", "mid"]).unwrap();
    let leaf = graph.find_path(&["app", "outer", "mid", "leaf"]).unwrap();
    assert_eq!(graph.node(outer).children(), &[mid]);
    assert_eq!(graph.node(mid).children(), &[leaf]);
    assert!(graph.node(leaf).children().is_empty());

    assert_eq!(graph.node(leaf).count(), 2);
    assert_eq!(graph.self_count(leaf), 2);
    assert_eq!(graph.path_to_root(leaf).len(), 5);
}

#[test]
fn test_stacks_share_common_prefix() {
    let document = document_with_functions(
        &["x", "y", "m", "outer"],
        &[vec!["x", "m", "outer"], vec!["y", "m", "outer"]],
    );
    let graph = Callgraph::new(document, CallgraphFlags::empty());

    let outer = graph.find_path(&["app", "outer"]).unwrap();
    assert_eq!(child_names(&graph, outer), vec!["m"]);

    let mid = graph.find_path(&["app", "outer", "m"]).unwrap();
    assert_eq!(graph.node(mid).count(), 2);
    assert_eq!(child_names(&graph, mid), vec!["x", "y"]);
}

/// Leaf-first stacks of function indices, collapsed the way the document
/// collapses recursion.
fn stacks_strategy() -> impl Strategy<Value = Vec<Vec<usize>>> {
    prop::collection::vec(prop::collection::vec(0..FUNCTIONS.len(), 1..6), 1..24).prop_map(|stacks| {
        stacks
            .into_iter()
            .map(|mut stack| {
                stack.dedup();
                stack
            })
            .collect()
    })
}

fn named(stacks: &[Vec<usize>]) -> Vec<Vec<&'static str>> {
    stacks.iter().map(|stack| stack.iter().map(|&i| FUNCTIONS[i]).collect()).collect()
}

fn render<A: Augmentation>(graph: &Callgraph<A>) -> String {
    graph.format_tree(usize::MAX, 0.0)
}

fn all_nodes<A: Augmentation>(graph: &Callgraph<A>) -> Vec<NodeId> {
    let mut found = Vec::new();
    let mut stack = vec![graph.root()];
    while let Some(id) = stack.pop() {
        found.push(id);
        stack.extend_from_slice(graph.node(id).children());
    }
    found
}

proptest! {
    #[test]
    fn test_every_node_on_a_sample_path_records_the_sample(stacks in stacks_strategy()) {
        let document = document_with_functions(&FUNCTIONS, &named(&stacks));
        let graph = Callgraph::new(document, CallgraphFlags::empty());

        for (index, stack) in named(&stacks).iter().enumerate() {
            let mut path = vec!["app"];
            path.extend(stack.iter().rev().copied());

            for depth in 1..=path.len() {
                let node = graph.find_path(&path[..depth]).unwrap();
                prop_assert!(graph.node_summary(node).traceables().contains(index));
            }
        }

        // A summary covers every sample of every node standing for its symbol
        for name in FUNCTIONS {
            let Some(symbol) = graph.list_symbols().into_iter().find(|s| s.name().as_str() == name) else {
                continue;
            };
            let samples = graph.samples_for_symbol(&symbol);
            for (index, stack) in named(&stacks).iter().enumerate() {
                prop_assert_eq!(stack.contains(&name), samples.contains(&index));
            }
        }
    }

    #[test]
    fn test_rebuilding_gives_identical_order(stacks in stacks_strategy(), left_heavy in any::<bool>()) {
        let flags = if left_heavy { CallgraphFlags::LEFT_HEAVY } else { CallgraphFlags::empty() };
        let document = document_with_functions(&FUNCTIONS, &named(&stacks));

        let first = Callgraph::new(Arc::clone(&document), flags);
        let second = Callgraph::new(document, flags);
        prop_assert_eq!(render(&first), render(&second));

        for id in all_nodes(&first) {
            let children = first.node(id).children();
            for pair in children.windows(2) {
                if left_heavy {
                    prop_assert!(first.node(pair[0]).count() >= first.node(pair[1]).count());
                } else {
                    prop_assert!(first.symbol(pair[0]).name().as_str() <= first.symbol(pair[1]).name().as_str());
                }
            }
        }
    }
}

/// pid 42 (no command line) with `foo` at 0x1000 and `bar` at 0x2000 in
/// an embedded bundle. Nothing is known about 0x3000.
fn bundled_document() -> Document {
    let strings = Strings::new();
    let mut writer = BundleWriter::new();
    let symbol = |name: &str, begin: u64| Symbol::new(strings.get(name), None, None, begin, begin + 0x10, SymbolKind::User);
    writer.add(42, &symbol("foo", 0x1000));
    writer.add(42, &symbol("bar", 0x2000));

    let endianness = Endianness::default();
    Document::builder()
        .endianness(endianness)
        .process(Pid(42), None, AddressLayout::default())
        .file("__symbols__", writer.finish(endianness).unwrap())
        .sample(42, vec![0x1000])
        .sample(42, vec![0x1000, 0x2000])
        .sample(42, vec![0x3000])
        .build()
}

#[tokio::test]
async fn test_bundled_symbols_round_trip() {
    let mut chain = MultiSymbolizer::new();
    chain.push(BundledSymbolizer::new());

    let document = DocumentLoader::new(SymbolizerConfig::default())
        .with_symbolizer(Arc::new(chain))
        .load(bundled_document())
        .await
        .unwrap();

    let graph = Callgraph::new(document, CallgraphFlags::BOTTOM_UP);
    assert_eq!(graph.node(graph.root()).count(), 3);

    let process = graph.find_path(&["Process 42"]).unwrap();
    assert_eq!(graph.node(process).count(), 3);

    let foo = graph.find_path(&["Process 42", "foo"]).unwrap();
    assert_eq!(graph.node(foo).count(), 2);
    assert_eq!(child_names(&graph, foo), vec!["bar"]);
    assert_eq!(graph.node(graph.node(foo).children()[0]).count(), 1);

    let bar = graph.list_symbols().into_iter().find(|s| s.name().as_str() == "bar").unwrap();
    assert_eq!(graph.find_node(&bar), Some(graph.node(foo).children()[0]));
    assert_eq!(graph.list_callers(&bar), vec![graph.symbol(foo).clone()]);

    let unwindable = graph.find_path(&["Process 42", "Unwindable"]).unwrap();
    assert_eq!(graph.symbol(unwindable).kind(), SymbolKind::Unwindable);
    assert_eq!(graph.node(unwindable).count(), 1);
}

#[tokio::test]
async fn test_exported_symbols_feed_the_bundled_resolver() {
    let mut chain = MultiSymbolizer::new();
    chain.push(BundledSymbolizer::new());
    let loader = DocumentLoader::new(SymbolizerConfig::default()).with_symbolizer(Arc::new(chain));

    let first = loader.load(bundled_document()).await.unwrap();
    let exported = first.export_symbols(first.endianness()).unwrap();

    let mut chain = MultiSymbolizer::new();
    chain.push_shared(Arc::new(BundledSymbolizer::new()));
    let second = DocumentLoader::new(SymbolizerConfig::default())
        .with_symbolizer(Arc::new(chain))
        .load(
            Document::builder()
                .process(Pid(42), None, AddressLayout::default())
                .file("__symbols__", exported)
                .sample(42, vec![0x1008, 0x2008])
                .build(),
        )
        .await
        .unwrap();

    let graph = Callgraph::new(second, CallgraphFlags::empty());
    assert!(graph.find_path(&["Process 42", "bar", "foo"]).is_some());
}
