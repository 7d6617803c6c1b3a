mod support;

use callscope::config::SymbolizerConfig;
use callscope::domain::{AddressContext, Pid, SymbolizeError};
use callscope::progress::Progress;
use callscope::strings::Strings;
use callscope::symbolization::{
    AddressLayout, DebuginfodClient, DebuginfodSymbolizer, ElfLoader, HostNamespace, ProcessInfo, Symbolizer,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use support::{function_offset, maps_line, text_offset, ElfBuilder};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const BUILD_ID: [u8; 4] = [0xde, 0xad, 0xbe, 0xef];
const MAP_BEGIN: u64 = 0x40_0000;
const MAP_END: u64 = 0x50_0000;
const WORKERS: usize = 4;

/// Hands out a prepared debug file (or an error) after a short delay, so
/// concurrent callers overlap.
#[derive(Debug)]
struct SlowClient {
    debug_file: Option<PathBuf>,
    calls: AtomicUsize,
}

/// Local handle so the foreign trait can be implemented (orphan rule).
#[derive(Debug)]
struct SharedClient(Arc<SlowClient>);

impl DebuginfodClient for SharedClient {
    fn fetch_debuginfo(
        &self,
        build_id: &str,
        _progress: &dyn Progress,
        _cancel: &CancellationToken,
    ) -> Result<PathBuf, SymbolizeError> {
        self.0.calls.fetch_add(1, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(50));
        self.0.debug_file.clone().ok_or_else(|| SymbolizeError::DebuginfodFailed {
            build_id: build_id.to_string(),
            error: "404".to_string(),
        })
    }
}

struct Fixture {
    _tmp: TempDir,
    strings: Strings,
    info: ProcessInfo,
    address: u64,
    debug_file: PathBuf,
}

/// A stripped binary mapped for pid 3, and its debug file somewhere no
/// local search looks.
fn fixture() -> Fixture {
    let tmp = TempDir::new().unwrap();
    let binary = tmp.path().join("bin/server");
    let data = ElfBuilder::new().function("stub").build_id(&BUILD_ID).write(&binary);
    let debug_file = tmp.path().join("downloads/deadbeef/debuginfo");
    ElfBuilder::new().function("serve_forever").build_id(&BUILD_ID).write(&debug_file);

    let strings = Strings::new();
    let layout = AddressLayout::parse(&maps_line(MAP_BEGIN, MAP_END, &binary));
    let info = ProcessInfo::new(&strings, Pid(3), Some("server"), layout, Arc::new(HostNamespace));
    let address = MAP_BEGIN + text_offset(&data) + function_offset(0) + 0x10;

    Fixture { _tmp: tmp, strings, info, address, debug_file }
}

fn symbolizer(loader: &Arc<ElfLoader>, client: &Arc<SlowClient>) -> DebuginfodSymbolizer {
    DebuginfodSymbolizer::new(
        Arc::clone(loader),
        Box::new(SharedClient(Arc::clone(client))),
        Arc::new(callscope::progress::NoProgress),
        CancellationToken::new(),
    )
}

fn config_without_debug_dirs() -> SymbolizerConfig {
    SymbolizerConfig { debug_dirs: Vec::new(), ..SymbolizerConfig::default() }
}

fn resolve_concurrently(symbolizer: &DebuginfodSymbolizer, fixture: &Fixture) -> Vec<Option<String>> {
    thread::scope(|scope| {
        let workers: Vec<_> = (0..WORKERS)
            .map(|_| {
                scope.spawn(|| {
                    symbolizer
                        .symbolize(&fixture.strings, Some(&fixture.info), AddressContext::User, fixture.address)
                        .map(|symbol| symbol.name().to_string())
                })
            })
            .collect();
        workers.into_iter().map(|worker| worker.join().unwrap()).collect()
    })
}

#[test]
fn test_concurrent_workers_share_one_download() {
    let fixture = fixture();
    let client = Arc::new(SlowClient { debug_file: Some(fixture.debug_file.clone()), calls: AtomicUsize::new(0) });
    let loader = Arc::new(ElfLoader::new(&config_without_debug_dirs()));
    let debuginfod = symbolizer(&loader, &client);

    let names = resolve_concurrently(&debuginfod, &fixture);
    assert_eq!(names, vec![Some("serve_forever".to_string()); WORKERS]);
    assert_eq!(client.calls.load(Ordering::SeqCst), 1);
    assert_eq!(debuginfod.fetch_count(), 1);
    assert_eq!(debuginfod.failed_count(), 0);

    // The debug file hangs off the loader's own copy of the binary
    let binary = fixture.info.address_layout().lookup(fixture.address).unwrap();
    let elf = loader.load(None, &binary.file, None, 0).unwrap();
    let attached = elf.debug_link_elf().expect("downloaded debug file attached");
    assert_eq!(Path::new(attached.file()), fixture.debug_file.as_path());
}

#[test]
fn test_concurrent_workers_share_one_failure() {
    let fixture = fixture();
    let client = Arc::new(SlowClient { debug_file: None, calls: AtomicUsize::new(0) });
    let loader = Arc::new(ElfLoader::new(&config_without_debug_dirs()));
    let debuginfod = symbolizer(&loader, &client);

    assert!(resolve_concurrently(&debuginfod, &fixture).iter().all(Option::is_none));
    assert_eq!(client.calls.load(Ordering::SeqCst), 1);
    assert_eq!(debuginfod.failed_count(), 1);

    // Given up on, so never asked again
    assert!(debuginfod.symbolize(&fixture.strings, Some(&fixture.info), AddressContext::User, fixture.address).is_none());
    assert_eq!(client.calls.load(Ordering::SeqCst), 1);
}
