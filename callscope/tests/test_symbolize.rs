mod support;

use callscope::callgraph::{Callgraph, CallgraphFlags};
use callscope::config::SymbolizerConfig;
use callscope::document::{Document, DocumentLoader};
use callscope::domain::{AddressContext, Pid};
use callscope::symbol::{Symbol, SymbolKind};
use callscope::symbolization::{AddressLayout, SymbolCache};
use std::path::Path;
use support::{function_offset, maps_line, text_offset, ElfBuilder};
use tempfile::TempDir;

const KERNEL: u64 = u64::MAX - 127;
const USER: u64 = u64::MAX - 511;

const MAP_BEGIN: u64 = 0x40_0000;
const MAP_END: u64 = 0x50_0000;

const KALLSYMS: &str = "\
ffffffff81000000 T _stext
ffffffff81000100 T schedule
ffffffff81000200 t do_idle
";

const FUNCTIONS: [&str; 4] = ["main", "work", "parse", "render"];

/// Write the `demo` binary and return the runtime address of each function
/// plus 0x10.
fn write_demo(path: &Path) -> Vec<u64> {
    let builder = FUNCTIONS.iter().fold(ElfBuilder::new(), |builder, name| builder.function(name));
    let text = text_offset(&builder.write(path));
    (0..FUNCTIONS.len()).map(|i| MAP_BEGIN + text + function_offset(i) + 0x10).collect()
}

fn demo_document(binary: &Path, addresses: &[u64]) -> Document {
    let layout = AddressLayout::parse(&maps_line(MAP_BEGIN, MAP_END, binary));
    let [main, work, parse, render] = [addresses[0], addresses[1], addresses[2], addresses[3]];

    let mut builder = Document::builder()
        .process(Pid(7), Some("demo --run"), layout)
        .file("/proc/kallsyms", KALLSYMS.as_bytes().to_vec());

    for i in 0..48u64 {
        let stack = match i % 4 {
            0 => vec![work, main],
            1 => vec![parse, work, main],
            2 => vec![KERNEL, 0xffff_ffff_8100_0110, USER, render, main],
            _ => vec![MAP_BEGIN + 0x8, main],
        };
        builder = builder.sample(7, stack);
    }
    builder.build()
}

fn cache_contents(cache: &SymbolCache) -> Vec<(String, u64, u64, SymbolKind)> {
    cache
        .symbols()
        .iter()
        .map(|s: &Symbol| (s.name().to_string(), s.begin_address(), s.end_address(), s.kind()))
        .collect()
}

#[tokio::test]
async fn test_elf_and_kernel_frames_resolve() {
    let tmp = TempDir::new().unwrap();
    let binary = tmp.path().join("bin/demo");
    let addresses = write_demo(&binary);

    let document = DocumentLoader::new(SymbolizerConfig::default())
        .with_partitions(2)
        .load(demo_document(&binary, &addresses))
        .await
        .unwrap();

    let work = document.lookup_symbol(Pid(7), AddressContext::User, addresses[1]).unwrap();
    assert_eq!(work.name().as_str(), "work");
    assert_eq!(work.kind(), SymbolKind::User);
    assert_eq!(work.binary_path().map(|p| p.as_str().to_string()), Some(binary.display().to_string()));
    assert!(work.begin_address() <= addresses[1] && addresses[1] < work.end_address());

    let schedule = document.lookup_symbol(Pid(7), AddressContext::Kernel, 0xffff_ffff_8100_0110).unwrap();
    assert_eq!(schedule.name().as_str(), "schedule");
    assert_eq!(schedule.kind(), SymbolKind::Kernel);

    // Inside the mapping but before any function
    let unknown = document.lookup_symbol(Pid(7), AddressContext::User, MAP_BEGIN + 0x8).unwrap();
    assert!(unknown.is_fallback());
    assert!(unknown.name().as_str().starts_with("In File "));

    let graph = Callgraph::new(document, CallgraphFlags::empty());
    let main = graph.find_path(&["demo --run", "main"]).unwrap();
    assert_eq!(graph.node(main).count(), 48);
    assert_eq!(graph.node(graph.find_path(&["demo --run", "main", "work", "parse"]).unwrap()).count(), 12);
    assert!(graph.find_path(&["demo --run", "main", "render", "- - User - -", "schedule"]).is_some());
}

#[tokio::test]
async fn test_partition_count_does_not_change_caches() {
    let tmp = TempDir::new().unwrap();
    let binary = tmp.path().join("bin/demo");
    let addresses = write_demo(&binary);

    let mut results = Vec::new();
    for partitions in [1, 3, 16] {
        let document = DocumentLoader::new(SymbolizerConfig::default())
            .with_partitions(partitions)
            .load(demo_document(&binary, &addresses))
            .await
            .unwrap();

        let process = cache_contents(document.process_info(Pid(7)).unwrap().symbol_cache());
        let kernel = cache_contents(document.kernel_cache());
        let tree = Callgraph::new(document, CallgraphFlags::empty()).format_tree(usize::MAX, 0.0);
        results.push((process, kernel, tree));
    }

    assert_eq!(results[0].0.len(), FUNCTIONS.len() + 1);
    assert_eq!(results[0].1.len(), 1);
    assert_eq!(results[0], results[1]);
    assert_eq!(results[0], results[2]);
}

#[tokio::test]
async fn test_load_capture_file() {
    let tmp = TempDir::new().unwrap();
    let binary = tmp.path().join("bin/demo");
    let addresses = write_demo(&binary);

    let capture = serde_json::json!({
        "byte_order": "little",
        "processes": [
            { "pid": 7, "cmdline": "demo --run", "maps": maps_line(MAP_BEGIN, MAP_END, &binary) }
        ],
        "samples": [
            { "pid": 7, "tid": 7, "time": 1, "addresses": [addresses[1], addresses[0]] },
            { "pid": 7, "tid": 8, "time": 2, "addresses": [KERNEL, 0xffff_ffff_8100_0210_u64] },
            { "pid": 7, "tid": 8, "time": 3, "addresses": [] }
        ],
        "files": [
            { "name": "/proc/kallsyms", "text": KALLSYMS }
        ]
    });
    let path = tmp.path().join("capture.json");
    std::fs::write(&path, serde_json::to_vec_pretty(&capture).unwrap()).unwrap();

    let document = DocumentLoader::new(SymbolizerConfig::default()).load_file(&path).await.unwrap();
    assert_eq!(document.len(), 3);
    assert!(document.is_symbolized());

    let graph = Callgraph::new(document, CallgraphFlags::INCLUDE_THREADS);
    // The empty stack is not part of the tree
    assert_eq!(graph.selection().len(), 2);
    assert!(graph.find_path(&["demo --run", "Thread-7 (Main)", "main", "work"]).is_some());
    assert!(graph.find_path(&["demo --run", "Thread-8", "- - Kernel - -", "do_idle"]).is_some());
}

#[tokio::test]
async fn test_load_capture_rejects_duplicate_files() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("capture.json");
    std::fs::write(
        &path,
        r#"{"files": [{"name": "/proc/kallsyms", "text": ""}, {"name": "/proc/kallsyms", "text": ""}]}"#,
    )
    .unwrap();

    let err = DocumentLoader::new(SymbolizerConfig::default()).load_file(&path).await.unwrap_err();
    assert!(err.to_string().contains("/proc/kallsyms"));
}
