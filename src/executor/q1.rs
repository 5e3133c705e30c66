// Copyright 2025 Overlap Project Authors. Licensed under Apache-2.0.

//! Grouped-aggregation scan (TPC-H Q1 shape).
//!
//! One relation, a ship-date predicate, grouping by the two single-byte
//! columns. The group table is a dense 2^16-slot array addressed by
//! `(returnflag << 8) | linestatus`, an idea borrowed from the
//! MonetDB/X100 paper; a valid-index list makes merging cheap.

use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::executor::block_on;
use futures::future::join_all;
use itertools::Itertools;

use crate::error::Result;
use crate::io::{drain_ring, with_countdown, Countdown, IoRing, LocalTask};
use crate::schema::{page_from_bytes, LineitemQ1Page, TablePage};
use crate::storage::{DataFile, FrameBuffer, Swip, SwipValue, PAGE_SIZE};
use crate::types::{Char, Date, Numeric};

/// Predicate cutoff: `l_shipdate <= 1998-09-02`.
pub const SHIP_DATE_CUTOFF: Date = Date::from_ymd(1998, 9, 2);

const GROUP_TABLE_SIZE: usize = 1 << 16;

/// Pages a synchronous worker claims per cursor fetch, sized to roughly
/// 100k tuples so the shared atomic stays out of the profile.
const SYNC_FETCH_PAGES: u64 =
    (100_000u64).div_ceil(<LineitemQ1Page as TablePage>::MAX_TUPLES as u64);

struct Group {
    sum_qty: Numeric<12, 2>,
    sum_base_price: Numeric<12, 2>,
    sum_disc: Numeric<12, 2>,
    sum_disc_price: Numeric<12, 4>,
    sum_charge: Numeric<12, 4>,
    count: u32,
    l_returnflag: Char,
    l_linestatus: Char,
}

/// Thread-local aggregation state: the dense group table plus the list of
/// occupied slots.
pub struct Aggregator {
    groups: Vec<Option<Box<Group>>>,
    valid_indexes: Vec<u32>,
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl Aggregator {
    pub fn new() -> Self {
        Aggregator {
            groups: (0..GROUP_TABLE_SIZE).map(|_| None).collect(),
            valid_indexes: Vec::new(),
        }
    }

    /// Folds every qualifying tuple of `page` into the group table.
    pub fn aggregate_page(&mut self, page: &LineitemQ1Page) {
        debug_assert!(page.num_tuples as usize <= <LineitemQ1Page as TablePage>::MAX_TUPLES);
        let one = Numeric::<12, 2>::from_raw(100);
        for tuple in 0..page.num_tuples as usize {
            if page.l_shipdate[tuple] <= SHIP_DATE_CUTOFF {
                let slot = (page.l_returnflag[tuple] as usize) << 8
                    | page.l_linestatus[tuple] as usize;
                let entry = &mut self.groups[slot];
                let group = match entry {
                    Some(group) => group,
                    None => {
                        self.valid_indexes.push(slot as u32);
                        entry.insert(Box::new(Group {
                            sum_qty: Numeric::default(),
                            sum_base_price: Numeric::default(),
                            sum_disc: Numeric::default(),
                            sum_disc_price: Numeric::default(),
                            sum_charge: Numeric::default(),
                            count: 0,
                            l_returnflag: page.l_returnflag[tuple],
                            l_linestatus: page.l_linestatus[tuple],
                        }))
                    }
                };
                group.count += 1;
                group.sum_qty += page.l_quantity[tuple];
                group.sum_base_price += page.l_extendedprice[tuple];
                group.sum_disc += page.l_discount[tuple];
                let common = page.l_extendedprice[tuple] * (one - page.l_discount[tuple]);
                group.sum_disc_price += common;
                group.sum_charge += common.cast_m2() * (one + page.l_tax[tuple]);
            }
        }
    }

    /// Folds another thread's table into this one.
    fn merge(&mut self, mut other: Aggregator) {
        for &slot in &other.valid_indexes {
            let incoming = other.groups[slot as usize]
                .take()
                .expect("valid index without a group");
            match &mut self.groups[slot as usize] {
                Some(group) => {
                    group.sum_qty += incoming.sum_qty;
                    group.sum_base_price += incoming.sum_base_price;
                    group.sum_disc += incoming.sum_disc;
                    group.sum_disc_price += incoming.sum_disc_price;
                    group.sum_charge += incoming.sum_charge;
                    group.count += incoming.count;
                }
                empty => {
                    *empty = Some(incoming);
                    self.valid_indexes.push(slot);
                }
            }
        }
    }

    fn into_result(self) -> Q1Result {
        let rows = self
            .groups
            .into_iter()
            .flatten()
            .map(|group| Q1Row {
                l_returnflag: group.l_returnflag,
                l_linestatus: group.l_linestatus,
                sum_qty: group.sum_qty,
                sum_base_price: group.sum_base_price,
                sum_disc: group.sum_disc,
                sum_disc_price: group.sum_disc_price,
                sum_charge: group.sum_charge,
                count: group.count,
            })
            .sorted_by_key(|row| (row.l_returnflag, row.l_linestatus))
            .collect();
        Q1Result { rows }
    }
}

/// One output group, sorted by `(l_returnflag, l_linestatus)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Q1Row {
    pub l_returnflag: Char,
    pub l_linestatus: Char,
    pub sum_qty: Numeric<12, 2>,
    pub sum_base_price: Numeric<12, 2>,
    pub sum_disc: Numeric<12, 2>,
    pub sum_disc_price: Numeric<12, 4>,
    pub sum_charge: Numeric<12, 4>,
    pub count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Q1Result {
    pub rows: Vec<Q1Row>,
}

impl std::fmt::Display for Q1Result {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "l_returnflag|l_linestatus|sum_qty|sum_base_price|sum_disc_price|\
             sum_charge|avg_qty|avg_price|avg_disc|count_order"
        )?;
        for row in &self.rows {
            writeln!(
                f,
                "{}|{}|{}|{}|{}|{}|{}|{}|{}|{}",
                row.l_returnflag as char,
                row.l_linestatus as char,
                row.sum_qty,
                row.sum_base_price,
                row.sum_disc_price,
                row.sum_charge,
                row.sum_qty / row.count,
                row.sum_base_price / row.count,
                row.sum_disc / row.count,
                row.count,
            )?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AggregationOptions {
    pub num_threads: u32,
    /// Ring depth per worker; 0 selects the synchronous path.
    pub ring_depth: u32,
    /// When false, pages are fetched but not aggregated, isolating I/O cost.
    pub do_work: bool,
}

/// Parallel runner for the grouped-aggregation scan over a swip array.
pub struct AggregationQuery<'a> {
    swips: &'a [Swip],
    data_file: &'a DataFile,
    options: AggregationOptions,
}

impl<'a> AggregationQuery<'a> {
    pub fn new(swips: &'a [Swip], data_file: &'a DataFile, options: AggregationOptions) -> Self {
        AggregationQuery {
            swips,
            data_file,
            options,
        }
    }

    fn is_synchronous(&self) -> bool {
        self.options.ring_depth == 0
    }

    /// Scans all pages and returns the merged, sorted groups.
    pub fn run(&self) -> Result<Q1Result> {
        let cursor = AtomicU64::new(0);
        let num_threads = self.options.num_threads.max(1);

        let states: Vec<Aggregator> = std::thread::scope(|scope| {
            let workers: Vec<_> = (0..num_threads)
                .map(|_| {
                    scope.spawn(|| {
                        if self.is_synchronous() {
                            self.run_sync_worker(&cursor)
                        } else {
                            self.run_async_worker(&cursor)
                        }
                    })
                })
                .collect();
            workers
                .into_iter()
                .map(|w| w.join().expect("aggregation worker panicked"))
                .collect::<Result<_>>()
        })?;

        let mut states = states.into_iter();
        let mut merged = states.next().unwrap_or_default();
        for state in states {
            merged.merge(state);
        }
        Ok(merged.into_result())
    }

    fn run_sync_worker(&self, cursor: &AtomicU64) -> Result<Aggregator> {
        let mut aggregator = Aggregator::new();
        let mut frame = FrameBuffer::zeroed(1);
        let num_swips = self.swips.len() as u64;

        loop {
            let begin = cursor.fetch_add(SYNC_FETCH_PAGES, Ordering::Relaxed);
            if begin >= num_swips {
                return Ok(aggregator);
            }
            let end = (begin + SYNC_FETCH_PAGES).min(num_swips);
            for slot in begin..end {
                let swip = self.swips[slot as usize].load();
                let page: &LineitemQ1Page = if swip.is_page_index() {
                    self.data_file
                        .read_page(swip.page_index(), frame.page_bytes_mut(0))?;
                    page_from_bytes(frame.page_bytes(0))
                } else {
                    // cache frames outlive the query run
                    unsafe { swip.as_page_ref() }
                };
                if self.options.do_work {
                    aggregator.aggregate_page(page);
                }
            }
        }
    }

    fn run_async_worker(&self, cursor: &AtomicU64) -> Result<Aggregator> {
        let depth = self.options.ring_depth as usize;
        let ring = IoRing::new(self.options.ring_depth)?;
        let mut frames = FrameBuffer::zeroed(depth);
        let aggregator = RefCell::new(Aggregator::new());
        let num_swips = self.swips.len() as u64;
        let fetch_increment = SYNC_FETCH_PAGES.div_ceil(depth as u64) * depth as u64;

        loop {
            let begin = cursor.fetch_add(fetch_increment, Ordering::Relaxed);
            if begin >= num_swips {
                break;
            }
            let end = (begin + fetch_increment).min(num_swips);

            let mut batch_begin = begin;
            while batch_begin < end {
                let batch_end = (batch_begin + depth as u64).min(end);
                let countdown = Countdown::new(batch_end - batch_begin);
                let mut tasks: Vec<LocalTask<'_>> = Vec::with_capacity(depth + 1);
                for (offset, frame) in frames
                    .bytes_mut()
                    .chunks_mut(PAGE_SIZE)
                    .take((batch_end - batch_begin) as usize)
                    .enumerate()
                {
                    let swip = self.swips[batch_begin as usize + offset].load();
                    tasks.push(Box::pin(with_countdown(
                        self.process_page_async(&ring, swip, frame, &aggregator),
                        &countdown,
                    )));
                }
                tasks.push(Box::pin(drain_ring(&ring, &countdown)));

                let results = block_on(join_all(tasks));
                debug_assert!(ring.empty());
                for result in results {
                    result?;
                }
                batch_begin = batch_end;
            }
        }
        Ok(aggregator.into_inner())
    }

    async fn process_page_async(
        &self,
        ring: &IoRing,
        swip: SwipValue,
        frame: &mut [u8],
        aggregator: &RefCell<Aggregator>,
    ) -> Result<()> {
        let page: &LineitemQ1Page = if swip.is_page_index() {
            self.data_file
                .async_read_page(ring, swip.page_index(), frame)
                .await?;
            page_from_bytes(frame)
        } else {
            // cache frames outlive the query run
            unsafe { swip.as_page_ref() }
        };
        if self.options.do_work {
            aggregator.borrow_mut().aggregate_page(page);
        }
        Ok(())
    }
}
