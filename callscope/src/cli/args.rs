//! CLI argument definitions

use crate::callgraph::CallgraphFlags;
use crate::config::SymbolizerConfig;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "callscope",
    version,
    about = "Symbolize a profiler capture and print its callgraph",
    after_help = "\
EXAMPLES:
    callscope capture.json                          Top-down tree on stdout
    callscope capture.json -g bottom-up,left-heavy  Leaf functions first, hottest first
    callscope capture.json --format json -o cg.json Export the tree as JSON
    callscope capture.json --callers 'g_main_*'     Who calls the GLib main loop
    callscope capture.json --export-symbols syms    Write a __symbols__ bundle"
)]
pub struct Args {
    /// Capture description (JSON)
    #[arg(value_name = "CAPTURE")]
    pub capture: PathBuf,

    /// Callgraph options (repeat or separate with commas)
    #[arg(short, long = "graph", value_enum, value_delimiter = ',', value_name = "OPTION")]
    pub graph: Vec<GraphOption>,

    /// Additional debug directory inside the target's mount namespace
    #[arg(long = "debug-dir", value_name = "DIR")]
    pub debug_dirs: Vec<PathBuf>,

    /// Debug directory on this machine, searched without path translation
    #[arg(long = "external-debug-dir", value_name = "DIR")]
    pub external_debug_dirs: Vec<PathBuf>,

    /// debuginfod server (overrides DEBUGINFOD_URLS)
    #[arg(long = "debuginfod", value_name = "URL", conflicts_with = "no_debuginfod")]
    pub debuginfod_urls: Vec<String>,

    /// Never fetch debug info over the network
    #[arg(long)]
    pub no_debuginfod: bool,

    /// Fall back to this machine's /proc/kallsyms for kernel frames
    #[arg(long)]
    pub host_kallsyms: bool,

    /// Symbolization partitions (default: half the CPUs plus one)
    #[arg(long, value_name = "N")]
    pub partitions: Option<usize>,

    /// Output format for the callgraph
    #[arg(long, value_enum, default_value = "text")]
    pub format: OutputFormat,

    /// Write output to FILE instead of stdout
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// List callers of symbols matching PATTERN instead of the tree
    #[arg(long, value_name = "PATTERN")]
    pub callers: Option<String>,

    /// List samples containing symbols matching PATTERN instead of the tree
    #[arg(long, value_name = "PATTERN")]
    pub matching: Option<String>,

    /// Write resolved symbols as a __symbols__ bundle to FILE
    #[arg(long, value_name = "FILE")]
    pub export_symbols: Option<PathBuf>,

    /// Deepest tree level printed in text output
    #[arg(long, default_value = "64")]
    pub max_depth: usize,

    /// Hide text-output nodes below this percentage of all samples
    #[arg(long, default_value = "0")]
    pub min_percent: f64,

    /// Suppress progress and summary output
    #[arg(short, long)]
    pub quiet: bool,
}

/// One callgraph option.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum GraphOption {
    /// Insert a node per thread under each process
    Threads,
    /// Skip system library and kernel frames
    HideSystemLibraries,
    /// Leaf functions at the top
    BottomUp,
    /// Assign categories to frames
    Categorize,
    /// Skip samples from the idle process
    #[value(name = "ignore-process-0")]
    IgnoreProcess0,
    /// Order children by sample count
    LeftHeavy,
    /// Merge processes running the same program
    MergeSimilarProcesses,
    /// Skip kernel worker processes
    IgnoreKernelProcesses,
}

impl GraphOption {
    #[must_use]
    pub fn flag(self) -> CallgraphFlags {
        match self {
            Self::Threads => CallgraphFlags::INCLUDE_THREADS,
            Self::HideSystemLibraries => CallgraphFlags::HIDE_SYSTEM_LIBRARIES,
            Self::BottomUp => CallgraphFlags::BOTTOM_UP,
            Self::Categorize => CallgraphFlags::CATEGORIZE_FRAMES,
            Self::IgnoreProcess0 => CallgraphFlags::IGNORE_PROCESS_0,
            Self::LeftHeavy => CallgraphFlags::LEFT_HEAVY,
            Self::MergeSimilarProcesses => CallgraphFlags::MERGE_SIMILAR_PROCESSES,
            Self::IgnoreKernelProcesses => CallgraphFlags::IGNORE_KERNEL_PROCESSES,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

impl Args {
    #[must_use]
    pub fn callgraph_flags(&self) -> CallgraphFlags {
        self.graph.iter().fold(CallgraphFlags::empty(), |flags, option| flags | option.flag())
    }

    /// Environment-derived config with this invocation's overrides applied.
    #[must_use]
    pub fn symbolizer_config(&self, mut config: SymbolizerConfig) -> SymbolizerConfig {
        config.debug_dirs.extend(self.debug_dirs.iter().cloned());
        config.external_debug_dirs.extend(self.external_debug_dirs.iter().cloned());

        if self.no_debuginfod {
            config.debuginfod_urls.clear();
        } else if !self.debuginfod_urls.is_empty() {
            config.debuginfod_urls.clone_from(&self.debuginfod_urls);
        }
        config
    }
}
