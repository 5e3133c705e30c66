// Copyright 2025 Overlap Project Authors. Licensed under Apache-2.0.

//! Grouped-aggregation benchmark: sweeps the cache fraction from 0 % to
//! 100 % and times a synchronous and an asynchronous run at each step.

use std::path::PathBuf;
use std::time::Instant;

use anyhow::Result;
use clap::Parser;
use overlap::executor::{AggregationOptions, AggregationQuery};
use overlap::storage::{DataFile, PageCache, Swip, PAGE_SIZE};
use rand::seq::SliceRandom;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::filter;
use tracing_subscriber::prelude::*;

/// Grouped aggregation over the lineitem relation.
#[derive(Parser, Debug)]
#[clap(about, long_about = None)]
struct Args {
    /// Lineitem page file.
    lineitem: PathBuf,
    num_threads: u32,
    /// Ring depth per worker in the asynchronous runs.
    num_entries_per_ring: u32,
    /// Aggregate tuples (true) or only fetch pages (false).
    do_work: bool,
    /// Shuffle the swip array so page accesses hit random offsets.
    do_random_io: bool,
    print_result: bool,
}

fn main() -> Result<()> {
    let args = Args::try_parse().unwrap_or_else(|error| {
        let _ = error.print();
        std::process::exit(1);
    });
    init_tracing();

    let file = DataFile::open_read(&args.lineitem, true)?;
    let file_size = file.read_size()?;
    let num_pages = file_size / PAGE_SIZE as u64;

    let mut swips: Vec<Swip> = (0..num_pages).map(Swip::from_page_index).collect();
    let mut rng = rand::thread_rng();
    if args.do_random_io {
        swips.shuffle(&mut rng);
    }
    // cache population order is independent of scan order
    let mut swip_slots: Vec<u64> = (0..num_pages).collect();
    swip_slots.shuffle(&mut rng);

    let mut cache = PageCache::new(&swips, &file);
    let slots_per_step = swip_slots.len().div_ceil(10);

    println!(
        "kind_of_io,num_threads,percent_cached,num_entries_per_ring,do_work,\
         do_random_io,time,throughput"
    );

    for step in 0..11u32 {
        if step > 0 {
            let offset = ((step as usize - 1) * slots_per_step).min(swip_slots.len());
            let len = slots_per_step.min(swip_slots.len() - offset);
            cache.populate(&swip_slots[offset..offset + len])?;
        }

        for (kind, ring_depth) in [("synchronous", 0), ("asynchronous", args.num_entries_per_ring)] {
            let query = AggregationQuery::new(
                &swips,
                &file,
                AggregationOptions {
                    num_threads: args.num_threads,
                    ring_depth,
                    do_work: args.do_work,
                },
            );
            let start = Instant::now();
            let result = query.run()?;
            let elapsed = start.elapsed();

            if args.do_work && args.print_result {
                print!("{result}");
            }
            println!(
                "{kind},{},{} %,{},{},{},{} ms,{:.3} Gb/s",
                args.num_threads,
                step * 10,
                ring_depth,
                args.do_work,
                args.do_random_io,
                elapsed.as_millis(),
                file_size as f64 / 1e9 / elapsed.as_secs_f64(),
            );
        }
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
