//! # callscope - Profiler Capture Analysis
//!
//! callscope turns a recorded stream of stack samples into a callgraph: it
//! resolves raw instruction pointers into symbols, then merges every
//! sample's stack into one tree annotated with sample counts.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                  Capture (JSON + embedded files)                │
//! └───────────────────────┬─────────────────────────────────────────┘
//!                         │ DocumentLoader
//!                         ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Document                                 │
//! │  traceables · processes (maps, namespace) · symbol caches       │
//! └───────────────────────┬─────────────────────────────────────────┘
//!                         │ prepare, then symbolize in N partitions
//!                         ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    MultiSymbolizer                              │
//! │  bundled ─► kernel ─► elf ─► jitmap ─► debuginfod               │
//! └───────────────────────┬─────────────────────────────────────────┘
//!                         │ cache hits only
//!                         ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  Callgraph (arena tree + per-symbol summaries) ─► queries/report│
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Structure
//!
//! - [`symbolization`]: resolvers and the per-process/kernel caches
//!   - `elf_loader`: ELF files across mount namespaces, with
//!     `.gnu_debuglink` and build-id chasing
//!   - `kallsyms`: kernel symbol tables
//!   - `bundled`, `jitmap`, `debuginfod`: alternate symbol sources
//! - [`document`]: the loaded capture and the parallel symbolization driver
//! - [`callgraph`]: tree aggregation, categories, descendants and queries
//! - [`strings`] / [`symbol`]: interned names and the shared symbol value
//! - [`config`]: debug directories, container detection, debuginfod
//! - [`cli`]: command-line arguments
//!
//! ## Typical Usage
//!
//! ```no_run
//! # async fn demo() -> anyhow::Result<()> {
//! use callscope::callgraph::{Callgraph, CallgraphFlags};
//! use callscope::config::SymbolizerConfig;
//! use callscope::document::DocumentLoader;
//!
//! let document = DocumentLoader::new(SymbolizerConfig::from_env()).load_file("capture.json").await?;
//! let graph = Callgraph::new(document, CallgraphFlags::BOTTOM_UP);
//! print!("{}", graph.format_tree(16, 0.01));
//! # Ok(())
//! # }
//! ```

pub mod callgraph;
pub mod cli;
pub mod config;
pub mod document;
pub mod domain;
pub mod progress;
pub mod strings;
pub mod symbol;
pub mod symbolization;
