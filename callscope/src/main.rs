//! # callscope - Main Entry Point
//!
//! Loads a capture, symbolizes it and prints one of:
//! - the callgraph as an indented tree (default) or JSON (`--format json`)
//! - callers of symbols matching a pattern (`--callers`)
//! - samples containing symbols matching a pattern (`--matching`)

#![allow(clippy::cast_precision_loss)]

use anyhow::{Context, Result};
use callscope::callgraph::query::glob_to_regex;
use callscope::callgraph::{Callgraph, CallgraphBuilder};
use callscope::cli::{Args, OutputFormat};
use callscope::config::SymbolizerConfig;
use callscope::document::DocumentLoader;
use callscope::domain::DocumentError;
use callscope::progress;
use clap::Parser;
use log::{info, warn};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

// Exit codes
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_CANCELLED: i32 = 130;

const PROGRESS_CAPACITY: usize = 64;

fn main() {
    env_logger::init();
    std::process::exit(match run() {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            let code = exit_code_for(&e);
            eprintln!("error: {e:#}");
            code
        }
    });
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<DocumentError>() {
        Some(DocumentError::Cancelled) => EXIT_CANCELLED,
        _ => EXIT_ERROR,
    }
}

#[tokio::main]
async fn run() -> Result<()> {
    let args = Args::parse();
    let started = Instant::now();

    let config = args.symbolizer_config(SymbolizerConfig::from_env());
    if !config.debuginfod_enabled() {
        info!("debuginfod disabled");
    }

    // Progress goes to the log from its own thread so workers never block
    let (progress, updates) = progress::channel(PROGRESS_CAPACITY);
    let quiet = args.quiet;
    let reporter = std::thread::spawn(move || {
        for update in updates {
            if !quiet {
                info!("{} ({:.0}%)", update.message, update.fraction * 100.0);
            }
        }
    });

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, cancelling");
                cancel.cancel();
            }
        });
    }

    let mut loader = DocumentLoader::new(config)
        .with_progress(Arc::new(progress))
        .with_cancellation(cancel.clone())
        .with_host_kernel_symbols(args.host_kallsyms);
    if let Some(partitions) = args.partitions {
        loader = loader.with_partitions(partitions);
    }

    let document = loader
        .load_file(&args.capture)
        .await
        .with_context(|| format!("Failed to load {}", args.capture.display()))?;

    // Dropping the loader closes the progress channel
    drop(loader);
    if reporter.join().is_err() {
        warn!("Progress reporter panicked");
    }

    if let Some(path) = &args.export_symbols {
        let blob = document.export_symbols(document.endianness())?;
        std::fs::write(path, &blob).with_context(|| format!("Failed to write {}", path.display()))?;
        info!("Wrote {} bytes of bundled symbols to {}", blob.len(), path.display());
    }

    let all = (0..document.len()).collect();
    let graph = CallgraphBuilder::new(args.callgraph_flags())
        .build_async(Arc::clone(&document), all, cancel)
        .await?;

    let mut out: Box<dyn Write> = match &args.output {
        Some(path) => Box::new(BufWriter::new(
            File::create(path).with_context(|| format!("Failed to create {}", path.display()))?,
        )),
        None => Box::new(BufWriter::new(std::io::stdout().lock())),
    };

    if let Some(pattern) = &args.callers {
        write_callers(&graph, pattern, &mut out)?;
    } else if let Some(pattern) = &args.matching {
        let samples = graph.list_samples_matching(pattern);
        writeln!(out, "{} samples match '{pattern}'", samples.len())?;
        for index in samples.iter() {
            writeln!(out, "{index}")?;
        }
    } else {
        match args.format {
            OutputFormat::Text => out.write_all(graph.format_tree(args.max_depth, args.min_percent / 100.0).as_bytes())?,
            OutputFormat::Json => {
                graph.write_json(&mut out)?;
                writeln!(out)?;
            }
        }
    }
    out.flush()?;

    if !args.quiet {
        eprintln!(
            "{} samples, {} nodes, {} symbols in {:.2?}",
            graph.selection().len(),
            graph.node_count(),
            graph.list_symbols().len(),
            started.elapsed()
        );
    }
    Ok(())
}

fn write_callers(graph: &Callgraph, pattern: &str, out: &mut dyn Write) -> Result<()> {
    let regex = glob_to_regex(pattern).with_context(|| format!("Bad pattern '{pattern}'"))?;

    for symbol in graph.list_symbols() {
        if !regex.is_match(symbol.name()) {
            continue;
        }
        writeln!(out, "{}", symbol.tooltip())?;
        for caller in graph.list_callers(&symbol) {
            writeln!(out, "    {}", caller.tooltip())?;
        }
    }
    Ok(())
}
