// Copyright 2025 Overlap Project Authors. Licensed under Apache-2.0.

//! Converts `|`-delimited TPC-H text files into page files.
//!
//! The input is memory-mapped and split at newline boundaries into one
//! chunk per hardware thread. Every thread parses rows into its own batch
//! of pages and appends finished batches to the shared output file, whose
//! `O_APPEND` semantics keep concurrent batch writes intact. Row order in
//! the output therefore differs from the input, which no query cares about.

use std::path::Path;
use std::time::Instant;

use memchr::{memchr, memchr_iter};
use tracing::info;

use crate::error::Result;
use crate::schema::{page_from_bytes_mut, LineitemQ14Page, LineitemQ1Page, PartPage, TablePage};
use crate::storage::{DataFile, FrameBuffer, PAGE_SIZE};

/// Batch size per append; matches a comfortable NVMe write burst.
const WRITE_BATCH_BYTES: usize = 1 << 22;
const WRITE_BATCH_PAGES: usize = WRITE_BATCH_BYTES / PAGE_SIZE;

const _: () = assert!(WRITE_BATCH_PAGES >= 1);

/// Which relation (and column subset) to load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableKind {
    LineitemQ1,
    LineitemQ14,
    Part,
}

impl std::str::FromStr for TableKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, String> {
        match s {
            "lineitemQ1" => Ok(TableKind::LineitemQ1),
            "lineitemQ14" => Ok(TableKind::LineitemQ14),
            "part" => Ok(TableKind::Part),
            other => Err(format!(
                "unknown table kind {other:?}, expected lineitemQ1, lineitemQ14 or part"
            )),
        }
    }
}

/// Parses `input` into pages of the selected layout and appends them to a
/// freshly created `output` file.
pub fn load_table(kind: TableKind, input: &Path, output: &Path) -> Result<()> {
    match kind {
        TableKind::LineitemQ1 => load_file::<LineitemQ1Page>(input, output),
        TableKind::LineitemQ14 => load_file::<LineitemQ14Page>(input, output),
        TableKind::Part => load_file::<PartPage>(input, output),
    }
}

fn load_file<P: TablePage>(input: &Path, output: &Path) -> Result<()> {
    let in_file = std::fs::File::open(input)?;
    let mmap = unsafe { memmap2::Mmap::map(&in_file)? };
    let _ = mmap.advise(memmap2::Advice::Sequential);
    let _ = mmap.advise(memmap2::Advice::WillNeed);

    let out_file = DataFile::create_append(output)?;
    let num_chunks = std::thread::available_parallelism().map_or(1, |n| n.get());
    let start = Instant::now();

    std::thread::scope(|scope| {
        let mmap = &mmap[..];
        let out_file = &out_file;
        let workers: Vec<_> = (0..num_chunks)
            .map(|index| {
                let chunk = &mmap[chunk_begin(mmap, num_chunks, index)
                    ..chunk_begin(mmap, num_chunks, index + 1)];
                scope.spawn(move || load_chunk::<P>(chunk, out_file))
            })
            .collect();
        workers
            .into_iter()
            .map(|w| w.join().expect("loader worker panicked"))
            .collect::<Result<Vec<_>>>()
    })?;

    let elapsed = start.elapsed();
    info!(
        input_mb = mmap.len() as f64 / 1e6,
        elapsed_ms = elapsed.as_millis() as u64,
        throughput_gb_s = mmap.len() as f64 / 1e9 / elapsed.as_secs_f64(),
        "loaded {}",
        input.display()
    );
    Ok(())
}

/// Byte offset where chunk `index` of `num_chunks` begins: the first line
/// start at or after the proportional split point.
fn chunk_begin(data: &[u8], num_chunks: usize, index: usize) -> usize {
    if index == 0 {
        return 0;
    }
    if index >= num_chunks {
        return data.len();
    }
    let approx = data.len() * index / num_chunks;
    match memchr(b'\n', &data[approx..]) {
        Some(newline) => approx + newline + 1,
        None => data.len(),
    }
}

fn load_chunk<P: TablePage>(chunk: &[u8], out_file: &DataFile) -> Result<()> {
    let mut frames = FrameBuffer::zeroed(WRITE_BATCH_PAGES);
    let mut page_in_batch = 0usize;
    let mut tuple_in_page = 0usize;

    let mut line_begin = 0usize;
    let line_ends = memchr_iter(b'\n', chunk)
        // a last line without a trailing newline still counts
        .chain((!chunk.ends_with(b"\n") && !chunk.is_empty()).then_some(chunk.len()));
    for line_end in line_ends {
        let line = std::str::from_utf8(&chunk[line_begin..line_end])
            .map_err(|_| crate::error::Error::InvalidUtf8)?;
        line_begin = (line_end + 1).min(chunk.len());
        if line.is_empty() {
            continue;
        }

        let page: &mut P = page_from_bytes_mut(frames.page_bytes_mut(page_in_batch));
        page.parse_row(tuple_in_page, line)?;
        tuple_in_page += 1;

        if tuple_in_page == P::MAX_TUPLES {
            page.set_num_tuples(tuple_in_page as u32);
            tuple_in_page = 0;
            page_in_batch += 1;
            if page_in_batch == WRITE_BATCH_PAGES {
                out_file.append_pages(frames.bytes_mut())?;
                frames.bytes_mut().fill(0);
                page_in_batch = 0;
            }
        }
    }

    // flush the partially filled tail
    if tuple_in_page > 0 {
        let page: &mut P = page_from_bytes_mut(frames.page_bytes_mut(page_in_batch));
        page.set_num_tuples(tuple_in_page as u32);
        page_in_batch += 1;
    }
    if page_in_batch > 0 {
        out_file.append_pages(frames.page_range_mut(0, page_in_batch))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::page_from_bytes;

    fn part_line(key: i32, p_type: &str) -> String {
        format!("{key}|name|mfgr|brand|{p_type}|7|PKG|901.00|comment|\n")
    }

    #[test]
    fn loads_part_rows_into_pages() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("part.tbl");
        let output = dir.path().join("part.dat");

        let mut text = String::new();
        for key in 1..=10 {
            text.push_str(&part_line(key, "PROMO ANODIZED TIN"));
        }
        std::fs::write(&input, text).unwrap();

        load_table(TableKind::Part, &input, &output).unwrap();

        let reader = DataFile::open_read(&output, false).unwrap();
        let size = reader.read_size().unwrap();
        assert!(size > 0 && size % PAGE_SIZE as u64 == 0);

        let num_pages = (size / PAGE_SIZE as u64) as usize;
        let mut frame = FrameBuffer::zeroed(1);
        let mut keys: Vec<i32> = Vec::new();
        for index in 0..num_pages {
            reader
                .read_page(index as u64, frame.page_bytes_mut(0))
                .unwrap();
            let page: &PartPage = page_from_bytes(frame.page_bytes(0));
            for tuple in 0..page.num_tuples as usize {
                keys.push(page.p_partkey[tuple].0);
                assert!(page.p_type[tuple].as_bytes().starts_with(b"PROMO"));
            }
        }
        keys.sort_unstable();
        assert_eq!(keys, (1..=10).collect::<Vec<_>>());
    }

    #[test]
    fn chunk_boundaries_respect_newlines() {
        let data = b"aaaa\nbbbb\ncccc\ndddd\n";
        assert_eq!(chunk_begin(data, 2, 0), 0);
        let mid = chunk_begin(data, 2, 1);
        assert_eq!(data[mid - 1], b'\n');
        assert_eq!(chunk_begin(data, 2, 2), data.len());
    }

    #[test]
    fn rejects_unknown_kind() {
        assert!("lineitem".parse::<TableKind>().is_err());
        assert_eq!("part".parse::<TableKind>().unwrap(), TableKind::Part);
    }
}
