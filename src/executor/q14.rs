// Copyright 2025 Overlap Project Authors. Licensed under Apache-2.0.

//! Promotion-revenue hash join (TPC-H Q14 shape).
//!
//! Scans the in-memory lineitem columns, probes the part hash table for
//! each tuple inside the ship-date window, and inspects the referenced part
//! tuple's type string. Part pages are resolved through their swips, so the
//! cache fraction alone decides how many probes hit the disk.

use std::cell::Cell;
use std::ops::Add;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::executor::block_on;
use futures::future::join_all;

use super::{LineitemColumns, PartHashTable};
use crate::error::Result;
use crate::io::{drain_ring, with_countdown, Countdown, IoRing, LocalTask};
use crate::schema::{page_from_bytes, PartPage};
use crate::storage::{DataFile, FrameBuffer, PAGE_SIZE};
use crate::types::Numeric;

/// Tuples a synchronous worker claims per cursor fetch.
const SYNC_FETCH_TUPLES: u64 = 100_000;

const PROMO_PREFIX: &[u8] = b"PROMO";

/// Partial sums of one worker: promotion revenue and total revenue, both in
/// scale-4 fixed point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PromoRevenue {
    pub promo: Numeric<12, 4>,
    pub total: Numeric<12, 4>,
}

impl Add for PromoRevenue {
    type Output = PromoRevenue;

    fn add(self, rhs: PromoRevenue) -> PromoRevenue {
        PromoRevenue {
            promo: self.promo + rhs.promo,
            total: self.total + rhs.total,
        }
    }
}

impl PromoRevenue {
    /// `100 * promo / total` as the query's fixed-point percentage.
    pub fn percentage(self) -> Numeric<12, 8> {
        Numeric::<12, 4>::from_raw(1_000_000) * (self.promo / self.total)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct JoinOptions {
    pub num_threads: u32,
    /// Ring depth (and concurrent tasks) per worker; 0 selects the
    /// synchronous path.
    pub ring_depth: u32,
    /// Tuple-range length owned by one async task.
    pub tuples_per_task: u64,
}

/// Parallel runner for the promotion-revenue join.
pub struct JoinQuery<'a> {
    lineitem: &'a LineitemColumns,
    part_table: &'a PartHashTable,
    part_file: &'a DataFile,
    options: JoinOptions,
}

impl<'a> JoinQuery<'a> {
    pub fn new(
        lineitem: &'a LineitemColumns,
        part_table: &'a PartHashTable,
        part_file: &'a DataFile,
        options: JoinOptions,
    ) -> Self {
        JoinQuery {
            lineitem,
            part_table,
            part_file,
            options,
        }
    }

    fn is_synchronous(&self) -> bool {
        self.options.ring_depth == 0
    }

    pub fn run(&self) -> Result<PromoRevenue> {
        let cursor = AtomicU64::new(0);
        let num_threads = self.options.num_threads.max(1);

        let sums: Vec<PromoRevenue> = std::thread::scope(|scope| {
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
                .map(|w| w.join().expect("join worker panicked"))
                .collect::<Result<_>>()
        })?;

        Ok(sums.into_iter().fold(PromoRevenue::default(), Add::add))
    }

    fn run_sync_worker(&self, cursor: &AtomicU64) -> Result<PromoRevenue> {
        let mut frame = FrameBuffer::zeroed(1);
        let mut sums = PromoRevenue::default();
        let num_tuples = self.lineitem.len() as u64;

        loop {
            let begin = cursor.fetch_add(SYNC_FETCH_TUPLES, Ordering::Relaxed);
            if begin >= num_tuples {
                return Ok(sums);
            }
            let end = (begin + SYNC_FETCH_TUPLES).min(num_tuples);
            sums = sums + self.process_tuples_sync(begin, end, frame.page_bytes_mut(0))?;
        }
    }

    fn run_async_worker(&self, cursor: &AtomicU64) -> Result<PromoRevenue> {
        let depth = self.options.ring_depth as usize;
        let tuples_per_task = self.options.tuples_per_task.max(1);
        let ring = IoRing::new(self.options.ring_depth)?;
        let mut frames = FrameBuffer::zeroed(depth);
        let sums = Cell::new(PromoRevenue::default());
        let num_tuples = self.lineitem.len() as u64;
        let fetch_increment = (depth as u64 * tuples_per_task).max(SYNC_FETCH_TUPLES);

        loop {
            let begin = cursor.fetch_add(fetch_increment, Ordering::Relaxed);
            if begin >= num_tuples {
                break;
            }
            let end = (begin + fetch_increment).min(num_tuples);

            let mut range_begin = begin;
            while range_begin < end {
                let countdown = Countdown::new(0);
                let mut tasks: Vec<LocalTask<'_>> = Vec::with_capacity(depth + 1);
                let mut frame_chunks = frames.bytes_mut().chunks_mut(PAGE_SIZE);

                // fill whole task ranges up to the ring depth
                while tasks.len() < depth && range_begin + tuples_per_task <= end {
                    let frame = frame_chunks.next().expect("one frame per task");
                    tasks.push(Box::pin(with_countdown(
                        self.process_tuples_async(
                            &ring,
                            range_begin,
                            range_begin + tuples_per_task,
                            frame,
                            &sums,
                        ),
                        &countdown,
                    )));
                    range_begin += tuples_per_task;
                }

                if tasks.is_empty() {
                    // a leftover shorter than one task range: stay synchronous
                    if range_begin < end {
                        let mut frame = FrameBuffer::zeroed(1);
                        let tail =
                            self.process_tuples_sync(range_begin, end, frame.page_bytes_mut(0))?;
                        sums.set(sums.get() + tail);
                        range_begin = end;
                    }
                    break;
                }

                if tasks.len() < depth && range_begin < end {
                    let frame = frame_chunks.next().expect("one frame per task");
                    tasks.push(Box::pin(with_countdown(
                        self.process_tuples_async(&ring, range_begin, end, frame, &sums),
                        &countdown,
                    )));
                    range_begin = end;
                }

                countdown.set(tasks.len() as u64);
                tasks.push(Box::pin(drain_ring(&ring, &countdown)));

                let results = block_on(join_all(tasks));
                debug_assert!(ring.empty());
                for result in results {
                    result?;
                }
            }
        }
        Ok(sums.get())
    }

    fn process_tuples_sync(&self, begin: u64, end: u64, frame: &mut [u8]) -> Result<PromoRevenue> {
        let one = Numeric::<12, 2>::from_raw(100);
        let mut sums = PromoRevenue::default();
        for tuple in begin as usize..end as usize {
            let shipdate = self.lineitem.l_shipdate[tuple];
            if !(super::JOIN_SHIP_DATE_LO <= shipdate && shipdate <= super::JOIN_SHIP_DATE_HI) {
                continue;
            }
            let hit = self.part_table.lookup_partkey(self.lineitem.l_partkey[tuple])?;
            let part_page: &PartPage = if hit.swip.is_page_index() {
                self.part_file.read_page(hit.swip.page_index(), frame)?;
                page_from_bytes(frame)
            } else {
                // part frames live inside the hash table, beyond this run
                unsafe { hit.swip.as_page_ref() }
            };
            let amount =
                self.lineitem.l_extendedprice[tuple] * (one - self.lineitem.l_discount[tuple]);
            if part_page.p_type[hit.tuple_offset as usize]
                .as_bytes()
                .starts_with(PROMO_PREFIX)
            {
                sums.promo += amount;
            }
            sums.total += amount;
        }
        Ok(sums)
    }

    async fn process_tuples_async(
        &self,
        ring: &IoRing,
        begin: u64,
        end: u64,
        frame: &mut [u8],
        sums: &Cell<PromoRevenue>,
    ) -> Result<()> {
        let one = Numeric::<12, 2>::from_raw(100);
        let mut local = PromoRevenue::default();
        for tuple in begin as usize..end as usize {
            let shipdate = self.lineitem.l_shipdate[tuple];
            if !(super::JOIN_SHIP_DATE_LO <= shipdate && shipdate <= super::JOIN_SHIP_DATE_HI) {
                continue;
            }
            let hit = self.part_table.lookup_partkey(self.lineitem.l_partkey[tuple])?;
            let part_page: &PartPage = if hit.swip.is_page_index() {
                self.part_file
                    .async_read_page(ring, hit.swip.page_index(), frame)
                    .await?;
                page_from_bytes(frame)
            } else {
                // part frames live inside the hash table, beyond this run
                unsafe { hit.swip.as_page_ref() }
            };
            let amount =
                self.lineitem.l_extendedprice[tuple] * (one - self.lineitem.l_discount[tuple]);
            if part_page.p_type[hit.tuple_offset as usize]
                .as_bytes()
                .starts_with(PROMO_PREFIX)
            {
                local.promo += amount;
            }
            local.total += amount;
        }
        sums.set(sums.get() + local);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentage_of_all_promo_is_one_hundred() {
        let sums = PromoRevenue {
            promo: Numeric::from_raw(10_000),
            total: Numeric::from_raw(10_000),
        };
        assert_eq!(sums.percentage().to_string(), "100.00000000");
    }

    #[test]
    fn percentage_scales_with_the_promo_share() {
        let sums = PromoRevenue {
            promo: Numeric::from_raw(2_500),
            total: Numeric::from_raw(10_000),
        };
        assert_eq!(sums.percentage().to_string(), "25.00000000");
    }
}
