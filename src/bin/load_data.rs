// Copyright 2025 Overlap Project Authors. Licensed under Apache-2.0.

//! Converts TPC-H `.tbl` text files into page files for the query
//! benchmarks.

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use overlap::loader::{load_table, TableKind};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::filter;
use tracing_subscriber::prelude::*;

/// TPC-H text-to-page-file loader.
#[derive(Parser, Debug)]
#[clap(about, long_about = None)]
struct Args {
    /// Relation and column subset: lineitemQ1, lineitemQ14 or part.
    kind: TableKind,
    /// Input `.tbl` file.
    input: PathBuf,
    /// Output page file (created, truncating).
    output: PathBuf,
}

fn main() -> Result<()> {
    let args = Args::try_parse().unwrap_or_else(|error| {
        let _ = error.print();
        std::process::exit(1);
    });

    let fmt_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_writer(std::io::stderr);
    let filter_layer =
        filter::EnvFilter::from_default_env().add_directive(LevelFilter::INFO.into());
    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .init();

    load_table(args.kind, &args.input, &args.output)?;
    Ok(())
}
