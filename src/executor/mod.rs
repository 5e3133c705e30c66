// Copyright 2025 Overlap Project Authors. Licensed under Apache-2.0.

//! Parallel query execution.
//!
//! Each query runs on plain OS threads. Workers pull page or tuple ranges
//! from a shared atomic cursor, keep every piece of mutable state
//! thread-local, and merge their partial results once all threads have
//! joined. In asynchronous mode a worker overlaps computation on one page
//! with outstanding reads on others through its own I/O ring.

mod join_table;
mod q1;
mod q14;

use std::path::Path;

pub use join_table::{LineitemHashTable, PartHashTable, PartLookup};
pub use q1::{AggregationOptions, AggregationQuery, Aggregator, Q1Result, Q1Row};
pub use q14::{JoinOptions, JoinQuery, PromoRevenue};

use crate::error::Result;
use crate::schema::{page_from_bytes, LineitemQ14Page, TablePage};
use crate::storage::PAGE_SIZE;
use crate::types::{Date, Integer, Numeric};

/// Ship-date window of the join query, `1995-09-01 ..= 1995-09-30`.
pub const JOIN_SHIP_DATE_LO: Date = Date::from_ymd(1995, 9, 1);
pub const JOIN_SHIP_DATE_HI: Date = Date::from_ymd(1995, 9, 30);

/// Splits `total` items into `parts` contiguous ranges (the last ones may be
/// empty). Used wherever threads scan fixed partitions instead of pulling
/// from a cursor.
pub(crate) fn partition_ranges(
    total: usize,
    parts: usize,
) -> impl Iterator<Item = std::ops::Range<usize>> {
    let per_part = total.div_ceil(parts.max(1));
    (0..parts).map(move |index| {
        let begin = (index * per_part).min(total);
        let end = (begin + per_part).min(total);
        begin..end
    })
}

pub(crate) fn worker_thread_count() -> usize {
    std::thread::available_parallelism().map_or(1, |n| n.get())
}

/// The lineitem columns the join query scans, decompressed from the page
/// file into plain contiguous vectors.
#[derive(Default)]
pub struct LineitemColumns {
    pub l_partkey: Vec<Integer>,
    pub l_extendedprice: Vec<Numeric<12, 2>>,
    pub l_discount: Vec<Numeric<12, 2>>,
    pub l_shipdate: Vec<Date>,
}

impl LineitemColumns {
    pub fn len(&self) -> usize {
        self.l_partkey.len()
    }

    pub fn is_empty(&self) -> bool {
        self.l_partkey.is_empty()
    }

    /// Memory-maps a lineitem page file and copies its column arrays into
    /// memory, one contiguous page range per hardware thread.
    pub fn load(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        let mmap = unsafe { memmap2::Mmap::map(&file)? };
        let _ = mmap.advise(memmap2::Advice::Sequential);
        let _ = mmap.advise(memmap2::Advice::WillNeed);

        let num_pages = mmap.len() / PAGE_SIZE;
        fn page_at(data: &[u8], index: usize) -> &LineitemQ14Page {
            page_from_bytes(&data[index * PAGE_SIZE..(index + 1) * PAGE_SIZE])
        }

        let tuples_per_page: Vec<usize> = (0..num_pages)
            .map(|p| page_at(&mmap, p).num_tuples as usize)
            .collect();
        let total: usize = tuples_per_page.iter().sum();

        let mut columns = LineitemColumns {
            l_partkey: vec![Integer::default(); total],
            l_extendedprice: vec![Numeric::default(); total],
            l_discount: vec![Numeric::default(); total],
            l_shipdate: vec![Date::default(); total],
        };

        // Hand every thread a contiguous page range and the matching
        // sub-slices of each column, so no two threads share an element.
        struct Chunk<'a> {
            pages: std::ops::Range<usize>,
            l_partkey: &'a mut [Integer],
            l_extendedprice: &'a mut [Numeric<12, 2>],
            l_discount: &'a mut [Numeric<12, 2>],
            l_shipdate: &'a mut [Date],
        }

        let mut chunks: Vec<Chunk<'_>> = Vec::new();
        {
            let mut partkey_rest = columns.l_partkey.as_mut_slice();
            let mut extendedprice_rest = columns.l_extendedprice.as_mut_slice();
            let mut discount_rest = columns.l_discount.as_mut_slice();
            let mut shipdate_rest = columns.l_shipdate.as_mut_slice();
            for pages in partition_ranges(num_pages, worker_thread_count()) {
                let count: usize = tuples_per_page[pages.clone()].iter().sum();
                let (partkey, rest) = partkey_rest.split_at_mut(count);
                partkey_rest = rest;
                let (extendedprice, rest) = extendedprice_rest.split_at_mut(count);
                extendedprice_rest = rest;
                let (discount, rest) = discount_rest.split_at_mut(count);
                discount_rest = rest;
                let (shipdate, rest) = shipdate_rest.split_at_mut(count);
                shipdate_rest = rest;
                chunks.push(Chunk {
                    pages,
                    l_partkey: partkey,
                    l_extendedprice: extendedprice,
                    l_discount: discount,
                    l_shipdate: shipdate,
                });
            }
        }

        std::thread::scope(|scope| {
            let data: &[u8] = &mmap;
            for chunk in chunks {
                scope.spawn(move || {
                    let mut offset = 0;
                    for page_index in chunk.pages {
                        let source = page_at(data, page_index);
                        let n = source.num_tuples as usize;
                        debug_assert!(n <= LineitemQ14Page::MAX_TUPLES);
                        chunk.l_partkey[offset..offset + n]
                            .copy_from_slice(&source.l_partkey[..n]);
                        chunk.l_extendedprice[offset..offset + n]
                            .copy_from_slice(&source.l_extendedprice[..n]);
                        chunk.l_discount[offset..offset + n]
                            .copy_from_slice(&source.l_discount[..n]);
                        chunk.l_shipdate[offset..offset + n]
                            .copy_from_slice(&source.l_shipdate[..n]);
                        offset += n;
                    }
                });
            }
        });

        Ok(columns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_ranges_cover_everything_once() {
        let ranges: Vec<_> = partition_ranges(10, 4).collect();
        assert_eq!(ranges.len(), 4);
        assert_eq!(ranges[0], 0..3);
        assert_eq!(ranges[3], 9..10);
        let covered: usize = ranges.iter().map(|r| r.len()).sum();
        assert_eq!(covered, 10);
    }

    #[test]
    fn partition_ranges_tolerate_more_parts_than_items() {
        let ranges: Vec<_> = partition_ranges(2, 8).collect();
        let covered: usize = ranges.iter().map(|r| r.len()).sum();
        assert_eq!(covered, 2);
        assert!(ranges.iter().skip(2).all(|r| r.is_empty()));
    }
}
