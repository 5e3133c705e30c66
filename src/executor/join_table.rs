// Copyright 2025 Overlap Project Authors. Licensed under Apache-2.0.

//! Two-phase concurrent hash tables for the join query.
//!
//! Both tables are built the same way: every thread first accumulates
//! matching entries in its own arena, then the shared bucket array is sized
//! to the next power of two of the total and all threads merge their arenas
//! concurrently with lock-free pointer CAS. Entries never move after phase
//! one, so instead of a raw pointer a chain link can be a plain 64-bit
//! arena handle: `(thread, index)` packed into one word.

use std::ops::Range;
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use futures::executor::block_on;
use futures::future::join_all;
use tracing::info;

use super::{partition_ranges, LineitemColumns, JOIN_SHIP_DATE_HI, JOIN_SHIP_DATE_LO};
use crate::error::{Error, Result};
use crate::io::{drain_ring, with_countdown, Countdown, IoRing, LocalTask};
use crate::schema::{page_from_bytes, PartPage};
use crate::storage::{DataFile, FrameBuffer, Swip, SwipValue, PAGE_SIZE};
use crate::types::Integer;

/// Nil arena handle, used as the end-of-chain marker.
const NIL: u64 = u64::MAX;

/// Concurrent loader tasks while caching part pages.
const NUM_LOAD_TASKS: usize = 64;

#[inline]
fn pack_handle(thread: usize, index: usize) -> u64 {
    debug_assert!(thread < u32::MAX as usize && index < u32::MAX as usize);
    (thread as u64) << 32 | index as u64
}

#[inline]
fn unpack_handle(handle: u64) -> (usize, usize) {
    ((handle >> 32) as usize, handle as u32 as usize)
}

struct LineitemEntry {
    next: AtomicU64,
    partkey: Integer,
    count: AtomicU32,
}

impl LineitemEntry {
    fn new(partkey: Integer) -> Self {
        LineitemEntry {
            next: AtomicU64::new(NIL),
            partkey,
            count: AtomicU32::new(1),
        }
    }

    /// Bucket sentinel: partkey 0 sorts below every real key and never
    /// matches one.
    fn sentinel() -> Self {
        LineitemEntry {
            next: AtomicU64::new(NIL),
            partkey: Integer(0),
            count: AtomicU32::new(0),
        }
    }
}

/// Multiplicities of the partkeys that survive the join query's ship-date
/// window. Chains past the bucket sentinel are kept strictly ascending by
/// partkey so that lookups can stop early.
pub struct LineitemHashTable {
    arenas: Vec<Vec<LineitemEntry>>,
    buckets: Vec<LineitemEntry>,
    mask: u64,
}

impl LineitemHashTable {
    /// Builds the table over `data` with `num_threads` workers: thread-local
    /// scan, bucket sizing, then the concurrent ordered merge.
    pub fn build(data: &LineitemColumns, num_threads: usize) -> Self {
        let ranges: Vec<Range<usize>> = partition_ranges(data.len(), num_threads).collect();

        let arenas: Vec<Vec<LineitemEntry>> = std::thread::scope(|scope| {
            let workers: Vec<_> = ranges
                .into_iter()
                .map(|range| scope.spawn(move || Self::scan_range(data, range)))
                .collect();
            workers
                .into_iter()
                .map(|w| w.join().expect("lineitem scan worker panicked"))
                .collect()
        });

        let total: usize = arenas.iter().map(Vec::len).sum();
        let num_buckets = (total as u64).next_power_of_two();
        info!(entries = total, buckets = num_buckets, "built lineitem hash table");

        let table = LineitemHashTable {
            arenas,
            buckets: (0..num_buckets).map(|_| LineitemEntry::sentinel()).collect(),
            mask: num_buckets - 1,
        };

        std::thread::scope(|scope| {
            for thread in 0..table.arenas.len() {
                let table = &table;
                scope.spawn(move || table.merge_arena(thread));
            }
        });

        table
    }

    fn scan_range(data: &LineitemColumns, range: Range<usize>) -> Vec<LineitemEntry> {
        let mut entries = Vec::new();
        for tuple in range {
            let shipdate = data.l_shipdate[tuple];
            if JOIN_SHIP_DATE_LO <= shipdate && shipdate <= JOIN_SHIP_DATE_HI {
                entries.push(LineitemEntry::new(data.l_partkey[tuple]));
            }
        }
        entries
    }

    /// Lock-free ordered insert of one thread's entries. Chains stay
    /// strictly increasing in partkey; equal keys merge by incrementing the
    /// resident entry's count.
    fn merge_arena(&self, thread: usize) {
        for index in 0..self.arenas[thread].len() {
            let handle = pack_handle(thread, index);
            let entry = self.entry(handle);
            let key = entry.partkey;

            let mut current = &self.buckets[(key.hash() & self.mask) as usize];
            let mut next = current.next.load(Ordering::Acquire);
            loop {
                if current.partkey == key {
                    current.count.fetch_add(1, Ordering::Relaxed);
                    break;
                }
                if next == NIL || key < self.entry(next).partkey {
                    // insert between current and next
                    entry.next.store(next, Ordering::Relaxed);
                    match current.next.compare_exchange_weak(
                        next,
                        handle,
                        Ordering::Release,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => break,
                        Err(actual) => next = actual,
                    }
                } else {
                    // anything inserted between current and next in the
                    // meantime is smaller than key, skipping it is fine
                    current = self.entry(next);
                    next = current.next.load(Ordering::Acquire);
                }
            }
        }
    }

    /// Multiplicity of `partkey`, 0 when it never qualified.
    pub fn lookup_count(&self, partkey: Integer) -> u32 {
        let bucket = &self.buckets[(partkey.hash() & self.mask) as usize];
        let mut handle = bucket.next.load(Ordering::Acquire);
        while handle != NIL {
            let entry = self.entry(handle);
            if entry.partkey == partkey {
                return entry.count.load(Ordering::Relaxed);
            }
            if partkey < entry.partkey {
                break;
            }
            handle = entry.next.load(Ordering::Acquire);
        }
        0
    }

    /// Number of distinct qualifying partkeys in `bucket`'s chain, for
    /// diagnostics and tests.
    #[cfg(test)]
    fn chain_keys(&self, bucket: usize) -> Vec<i32> {
        let mut keys = Vec::new();
        let mut handle = self.buckets[bucket].next.load(Ordering::Acquire);
        while handle != NIL {
            let entry = self.entry(handle);
            keys.push(entry.partkey.0);
            handle = entry.next.load(Ordering::Acquire);
        }
        keys
    }

    #[cfg(test)]
    fn num_buckets(&self) -> usize {
        self.buckets.len()
    }

    #[inline]
    fn entry(&self, handle: u64) -> &LineitemEntry {
        let (thread, index) = unpack_handle(handle);
        &self.arenas[thread][index]
    }
}

struct PartEntry {
    next: AtomicU64,
    swip_slot: u64,
    partkey: Integer,
    tuple_offset: u32,
}

/// Successful part-table probe: the page reference and the tuple's offset
/// within that page.
#[derive(Debug, Clone, Copy)]
pub struct PartLookup {
    pub swip: SwipValue,
    pub tuple_offset: u32,
}

/// Maps every partkey the join needs to its page and tuple offset. Buckets
/// are bare head handles merged Treiber-style; chains are unordered and
/// lookups scan to the end.
///
/// The table also owns the part relation's swips, one frame per page for
/// caching, and the per-page reference tallies that drive the cache sweep.
pub struct PartHashTable {
    arenas: Vec<Vec<PartEntry>>,
    buckets: Vec<AtomicU64>,
    mask: u64,
    swips: Vec<Swip>,
    page_references: Vec<u32>,
    frames: FrameBuffer,
    num_used_frames: usize,
    num_cached_references: u64,
}

impl PartHashTable {
    /// Scans the part page file (memory-mapped) with `num_threads` workers,
    /// keeping only tuples whose partkey appears in `lineitem_table`, and
    /// tallies per page how often the join will reference it.
    pub fn build(
        lineitem_table: &LineitemHashTable,
        part_path: &Path,
        num_threads: usize,
    ) -> Result<Self> {
        let file = std::fs::File::open(part_path)?;
        let mmap = unsafe { memmap2::Mmap::map(&file)? };
        let _ = mmap.advise(memmap2::Advice::Sequential);
        let _ = mmap.advise(memmap2::Advice::WillNeed);

        let num_pages = mmap.len() / PAGE_SIZE;
        let swips: Vec<Swip> = (0..num_pages as u64).map(Swip::from_page_index).collect();

        let ranges: Vec<Range<usize>> = partition_ranges(num_pages, num_threads).collect();
        type ScanOutput = (Vec<PartEntry>, Vec<u32>);
        let scans: Vec<ScanOutput> = std::thread::scope(|scope| {
            let mmap = &mmap;
            let workers: Vec<_> = ranges
                .into_iter()
                .map(|pages| {
                    scope.spawn(move || Self::scan_pages(mmap, pages, lineitem_table))
                })
                .collect();
            workers
                .into_iter()
                .map(|w| w.join().expect("part scan worker panicked"))
                .collect()
        });

        let mut arenas = Vec::with_capacity(scans.len());
        let mut page_references = Vec::with_capacity(num_pages);
        for (entries, references) in scans {
            arenas.push(entries);
            page_references.extend(references);
        }

        let total: usize = arenas.iter().map(Vec::len).sum();
        let num_buckets = (total as u64).next_power_of_two();
        info!(entries = total, buckets = num_buckets, "built part hash table");

        let table = PartHashTable {
            arenas,
            buckets: (0..num_buckets).map(|_| AtomicU64::new(NIL)).collect(),
            mask: num_buckets - 1,
            swips,
            page_references,
            frames: FrameBuffer::zeroed(num_pages.max(1)),
            num_used_frames: 0,
            num_cached_references: 0,
        };

        std::thread::scope(|scope| {
            for thread in 0..table.arenas.len() {
                let table = &table;
                scope.spawn(move || table.merge_arena(thread));
            }
        });

        Ok(table)
    }

    fn scan_pages(
        mmap: &[u8],
        pages: Range<usize>,
        lineitem_table: &LineitemHashTable,
    ) -> (Vec<PartEntry>, Vec<u32>) {
        let mut entries = Vec::new();
        let mut references = Vec::with_capacity(pages.len());
        for page_index in pages {
            let page: &PartPage =
                page_from_bytes(&mmap[page_index * PAGE_SIZE..(page_index + 1) * PAGE_SIZE]);
            let mut num_references = 0u32;
            for tuple in 0..page.num_tuples as usize {
                let partkey = page.p_partkey[tuple];
                let count = lineitem_table.lookup_count(partkey);
                if count > 0 {
                    entries.push(PartEntry {
                        next: AtomicU64::new(NIL),
                        swip_slot: page_index as u64,
                        partkey,
                        tuple_offset: tuple as u32,
                    });
                    num_references += count;
                }
            }
            references.push(num_references);
        }
        (entries, references)
    }

    /// Treiber-stack insertion of one thread's entries: CAS each entry in
    /// as the new bucket head.
    fn merge_arena(&self, thread: usize) {
        for index in 0..self.arenas[thread].len() {
            let handle = pack_handle(thread, index);
            let entry = self.entry(handle);
            let bucket = &self.buckets[(entry.partkey.hash() & self.mask) as usize];
            let mut head = bucket.load(Ordering::Acquire);
            loop {
                entry.next.store(head, Ordering::Relaxed);
                match bucket.compare_exchange_weak(
                    head,
                    handle,
                    Ordering::Release,
                    Ordering::Acquire,
                ) {
                    Ok(_) => break,
                    Err(actual) => head = actual,
                }
            }
        }
    }

    /// Looks up a partkey the lineitem table promised to exist. A miss
    /// means the two tables disagree, which is a bug, not data.
    pub fn lookup_partkey(&self, partkey: Integer) -> Result<PartLookup> {
        let mut handle = self.buckets[(partkey.hash() & self.mask) as usize].load(Ordering::Acquire);
        while handle != NIL {
            let entry = self.entry(handle);
            if entry.partkey == partkey {
                return Ok(PartLookup {
                    swip: self.swips[entry.swip_slot as usize].load(),
                    tuple_offset: entry.tuple_offset,
                });
            }
            handle = entry.next.load(Ordering::Acquire);
        }
        Err(Error::PartkeyNotFound(partkey.0))
    }

    #[inline]
    fn entry(&self, handle: u64) -> &PartEntry {
        let (thread, index) = unpack_handle(handle);
        &self.arenas[thread][index]
    }

    /// Total number of page references the join will make.
    pub fn total_references(&self) -> u64 {
        self.page_references.iter().map(|&n| n as u64).sum()
    }

    /// References already satisfied from memory.
    pub fn cached_references(&self) -> u64 {
        self.num_cached_references
    }

    /// Caches part pages in page-index order until at least
    /// `num_references` references are satisfied from memory, loading the
    /// newly covered pages asynchronously and swizzling their swips.
    pub fn cache_at_least(&mut self, part_file: &DataFile, num_references: u64) -> Result<()> {
        let begin = self.num_used_frames;
        while self.num_cached_references < num_references
            && self.num_used_frames != self.swips.len()
        {
            self.num_cached_references += self.page_references[self.num_used_frames] as u64;
            self.num_used_frames += 1;
        }
        let end = self.num_used_frames;
        if begin == end {
            return Ok(());
        }

        let ring = IoRing::new(NUM_LOAD_TASKS as u32)?;
        let countdown = Countdown::new(0);
        let partition_size = (end - begin).div_ceil(NUM_LOAD_TASKS);

        let swips = &self.swips;
        let region = self.frames.page_range_mut(begin, end - begin);

        let mut tasks: Vec<LocalTask<'_>> = Vec::with_capacity(NUM_LOAD_TASKS + 1);
        for (chunk_index, frames) in region.chunks_mut(partition_size * PAGE_SIZE).enumerate() {
            let first_page = begin + chunk_index * partition_size;
            tasks.push(Box::pin(with_countdown(
                load_pages(part_file, &ring, swips, first_page, frames),
                &countdown,
            )));
        }
        countdown.set(tasks.len() as u64);
        tasks.push(Box::pin(drain_ring(&ring, &countdown)));

        let results = block_on(join_all(tasks));
        debug_assert!(ring.empty());
        for result in results {
            result?;
        }
        Ok(())
    }
}

async fn load_pages(
    file: &DataFile,
    ring: &IoRing,
    swips: &[Swip],
    first_page: usize,
    frames: &mut [u8],
) -> Result<()> {
    for (offset, frame) in frames.chunks_mut(PAGE_SIZE).enumerate() {
        let page_index = (first_page + offset) as u64;
        debug_assert_eq!(swips[first_page + offset].load().page_index(), page_index);
        file.async_read_page(ring, page_index, frame).await?;
        swips[first_page + offset].set_pointer(frame.as_ptr());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Date;

    fn columns(rows: &[(i32, &str)]) -> LineitemColumns {
        LineitemColumns {
            l_partkey: rows.iter().map(|&(key, _)| Integer(key)).collect(),
            l_extendedprice: rows.iter().map(|_| Default::default()).collect(),
            l_discount: rows.iter().map(|_| Default::default()).collect(),
            l_shipdate: rows.iter().map(|&(_, date)| date.parse::<Date>().unwrap()).collect(),
        }
    }

    fn in_window(keys: &[i32]) -> LineitemColumns {
        let rows: Vec<(i32, &str)> = keys.iter().map(|&k| (k, "1995-09-15")).collect();
        columns(&rows)
    }

    #[test]
    fn counts_multiplicities_across_two_threads() {
        let data = in_window(&[3, 1, 2, 1, 3, 1]);
        let table = LineitemHashTable::build(&data, 2);
        assert_eq!(table.lookup_count(Integer(1)), 3);
        assert_eq!(table.lookup_count(Integer(2)), 1);
        assert_eq!(table.lookup_count(Integer(3)), 2);
        assert_eq!(table.lookup_count(Integer(4)), 0);
    }

    #[test]
    fn date_window_filters_entries() {
        let data = columns(&[
            (1, "1995-08-31"),
            (2, "1995-09-01"),
            (3, "1995-09-30"),
            (4, "1995-10-01"),
        ]);
        let table = LineitemHashTable::build(&data, 2);
        assert_eq!(table.lookup_count(Integer(1)), 0);
        assert_eq!(table.lookup_count(Integer(2)), 1);
        assert_eq!(table.lookup_count(Integer(3)), 1);
        assert_eq!(table.lookup_count(Integer(4)), 0);
    }

    #[test]
    fn chains_are_strictly_increasing() {
        // enough duplicate-free keys to force shared buckets in a small table
        let keys: Vec<i32> = (1..=64).collect();
        let data = in_window(&keys);
        let table = LineitemHashTable::build(&data, 4);
        for bucket in 0..table.num_buckets() {
            let chain = table.chain_keys(bucket);
            assert!(
                chain.windows(2).all(|pair| pair[0] < pair[1]),
                "bucket {bucket} chain not increasing: {chain:?}"
            );
        }
        for key in keys {
            assert_eq!(table.lookup_count(Integer(key)), 1);
        }
    }

    fn write_part_file(path: &std::path::Path, rows_per_page: &[&[(i32, &str)]]) {
        use crate::schema::{page_from_bytes_mut, TablePage};
        let mut frames = FrameBuffer::zeroed(rows_per_page.len());
        for (index, rows) in rows_per_page.iter().enumerate() {
            let page: &mut PartPage = page_from_bytes_mut(frames.page_bytes_mut(index));
            for (tuple, (key, p_type)) in rows.iter().enumerate() {
                let line = format!("{key}|name|mfgr|brand|{p_type}|7|PKG|901.00|comment|");
                page.parse_row(tuple, &line).unwrap();
            }
            page.set_num_tuples(rows.len() as u32);
        }
        let file = DataFile::create_append(path).unwrap();
        file.append_pages(frames.page_range_mut(0, rows_per_page.len()))
            .unwrap();
    }

    #[test]
    fn part_table_covers_every_promised_partkey() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("part.dat");
        write_part_file(
            &path,
            &[
                &[(1, "PROMO ANODIZED TIN"), (2, "SMALL PLATED COPPER")],
                &[(3, "PROMO BURNISHED NICKEL")],
            ],
        );

        let lineitem = in_window(&[2, 3, 3]);
        let lineitem_table = LineitemHashTable::build(&lineitem, 2);
        let part_table = PartHashTable::build(&lineitem_table, &path, 2).unwrap();

        let hit = part_table.lookup_partkey(Integer(2)).unwrap();
        assert!(hit.swip.is_page_index());
        assert_eq!(hit.swip.page_index(), 0);
        assert_eq!(hit.tuple_offset, 1);

        let hit = part_table.lookup_partkey(Integer(3)).unwrap();
        assert_eq!(hit.swip.page_index(), 1);
        assert_eq!(hit.tuple_offset, 0);

        // partkey 1 never qualified, so the table does not know it
        assert!(part_table.lookup_partkey(Integer(1)).is_err());

        // page 0 referenced once (key 2), page 1 twice (key 3 twice)
        assert_eq!(part_table.total_references(), 3);
        assert_eq!(part_table.cached_references(), 0);
    }

    #[test]
    fn build_is_deterministic_across_runs() {
        let keys = [7, 1, 7, 9, 1, 1, 12, 9, 7];
        let first = LineitemHashTable::build(&in_window(&keys), 3);
        let second = LineitemHashTable::build(&in_window(&keys), 3);
        for key in [1, 7, 9, 12, 99] {
            assert_eq!(
                first.lookup_count(Integer(key)),
                second.lookup_count(Integer(key))
            );
        }
    }
}
