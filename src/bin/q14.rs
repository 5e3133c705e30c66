// Copyright 2025 Overlap Project Authors. Licensed under Apache-2.0.

//! Hash-join benchmark: builds the lineitem and part hash tables once,
//! then sweeps the fraction of pre-cached part-page references from 0 % to
//! 100 %, timing a synchronous and an asynchronous run at each step.

use std::path::PathBuf;
use std::time::Instant;

use anyhow::{ensure, Result};
use clap::Parser;
use overlap::executor::{
    JoinOptions, JoinQuery, LineitemColumns, LineitemHashTable, PartHashTable,
};
use overlap::storage::{DataFile, PAGE_SIZE_POWER};
use tracing::{info, level_filters::LevelFilter};
use tracing_subscriber::filter;
use tracing_subscriber::prelude::*;

/// Promotion-revenue join between lineitem and part.
#[derive(Parser, Debug)]
#[clap(about, long_about = None)]
struct Args {
    /// Lineitem page file (join column subset).
    lineitem: PathBuf,
    /// Part page file.
    part: PathBuf,
    num_threads: u32,
    /// Ring depth (and concurrent tasks) per worker in asynchronous runs.
    num_entries_per_ring: u32,
    /// Tuple-range length owned by one task in asynchronous runs.
    num_tuples_per_coroutine: u64,
    print_result: bool,
    print_header: bool,
}

fn main() -> Result<()> {
    let args = Args::try_parse().unwrap_or_else(|error| {
        let _ = error.print();
        std::process::exit(1);
    });
    init_tracing();
    ensure!(
        args.num_entries_per_ring == 0 || args.num_tuples_per_coroutine > 0,
        "num_tuples_per_coroutine must be positive for asynchronous runs"
    );

    let lineitem = LineitemColumns::load(&args.lineitem)?;
    info!(num_tuples = lineitem.len(), "loaded lineitem columns");

    let build_threads = std::thread::available_parallelism().map_or(1, |n| n.get());
    let lineitem_table = LineitemHashTable::build(&lineitem, build_threads);
    let mut part_table = PartHashTable::build(&lineitem_table, &args.part, build_threads)?;

    let part_file = DataFile::open_read(&args.part, true)?;
    let total_references = part_table.total_references();
    let ten_percent = total_references.div_ceil(10);

    if args.print_header {
        println!(
            "kind_of_io,page_size_power,num_threads,num_cached_references,\
             num_total_references,num_entries_per_ring,num_tuples_per_coroutine,time"
        );
    }

    for step in 0..11u64 {
        for (kind, ring_depth) in [("synchronous", 0), ("asynchronous", args.num_entries_per_ring)] {
            let query = JoinQuery::new(
                &lineitem,
                &part_table,
                &part_file,
                JoinOptions {
                    num_threads: args.num_threads,
                    ring_depth,
                    tuples_per_task: args.num_tuples_per_coroutine,
                },
            );
            let start = Instant::now();
            let revenue = query.run()?;
            let elapsed = start.elapsed();

            if args.print_result {
                eprintln!("promo_revenue\n{}", revenue.percentage());
            }
            let tuples = if ring_depth == 0 { 0 } else { args.num_tuples_per_coroutine };
            println!(
                "{kind},{PAGE_SIZE_POWER},{},{},{},{},{},{}",
                args.num_threads,
                part_table.cached_references(),
                total_references,
                ring_depth,
                tuples,
                elapsed.as_millis(),
            );
        }

        part_table.cache_at_least(&part_file, (step + 1) * ten_percent)?;
    }
    Ok(())
}

fn init_tracing() {
    let fmt_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_writer(std::io::stderr);
    let filter_layer =
        filter::EnvFilter::from_default_env().add_directive(LevelFilter::INFO.into());
    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .init();
}
