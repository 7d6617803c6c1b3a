//! Structured error types for callscope
//!
//! Using thiserror for automatic Display implementation and error chaining.
//! Per-address and per-resolver failures never reach these types; they are
//! absorbed inside the pipeline and only show up as missing symbol names.

use thiserror::Error;

/// Failures while preparing a symbolizer for a document.
#[derive(Error, Debug)]
pub enum SymbolizeError {
    #[error("Malformed bundled symbol table: {0}")]
    MalformedBundle(String),

    #[error("Failed to decode kernel symbols from {name}: {error}")]
    KernelSymbols { name: String, error: std::io::Error },

    #[error("debuginfod lookup for build-id {build_id} failed: {error}")]
    DebuginfodFailed { build_id: String, error: String },

    #[error("Operation was cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

/// Failures surfaced at the document-loader boundary.
#[derive(Error, Debug)]
pub enum DocumentError {
    #[error("Failed to read capture {path}: {error}")]
    ReadFailed { path: String, error: std::io::Error },

    #[error("Invalid capture document: {0}")]
    InvalidDocument(String),

    #[error("Symbolization worker failed: {0}")]
    WorkerFailed(String),

    #[error("Loading was cancelled")]
    Cancelled,

    #[error(transparent)]
    Symbolize(#[from] SymbolizeError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Failures writing reports or symbol bundles.
#[derive(Error, Debug)]
pub enum ExportError {
    #[error("Bundled symbol table too large: {0} bytes")]
    BundleTooLarge(usize),

    #[error("Node {0} does not belong to this callgraph")]
    UnknownNode(usize),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
