// Copyright 2025 Overlap Project Authors. Licensed under Apache-2.0.

//! End-to-end scenarios: load text rows into page files, run both queries
//! in both execution modes, and sweep the cache states.

use std::path::{Path, PathBuf};

use overlap::executor::{
    AggregationOptions, AggregationQuery, JoinOptions, JoinQuery, LineitemColumns,
    LineitemHashTable, PartHashTable,
};
use overlap::io::IoRing;
use overlap::loader::{load_table, TableKind};
use overlap::storage::{DataFile, PageCache, Swip, PAGE_SIZE};

fn io_uring_available() -> bool {
    // containers commonly mask the io_uring syscalls
    IoRing::new(1).is_ok()
}

fn lineitem_line(
    partkey: i32,
    qty: &str,
    price: &str,
    disc: &str,
    tax: &str,
    flag: char,
    status: char,
    shipdate: &str,
) -> String {
    format!(
        "1|{partkey}|77|1|{qty}|{price}|{disc}|{tax}|{flag}|{status}|{shipdate}|\
         1996-02-12|1996-03-22|DELIVER IN PERSON|TRUCK|no comment|\n"
    )
}

fn part_line(partkey: i32, p_type: &str) -> String {
    format!("{partkey}|lavender spring|Manufacturer#1|Brand#13|{p_type}|7|JUMBO PKG|901.00|x|\n")
}

struct Workspace {
    _dir: tempfile::TempDir,
    root: PathBuf,
}

impl Workspace {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        Workspace { _dir: dir, root }
    }

    fn load(&self, kind: TableKind, name: &str, text: &str) -> PathBuf {
        let input = self.root.join(format!("{name}.tbl"));
        let output = self.root.join(format!("{name}.dat"));
        std::fs::write(&input, text).unwrap();
        load_table(kind, &input, &output).unwrap();
        output
    }
}

fn swips_for(file: &DataFile) -> Vec<Swip> {
    let num_pages = file.read_size().unwrap() / PAGE_SIZE as u64;
    (0..num_pages).map(Swip::from_page_index).collect()
}

fn q1_data(workspace: &Workspace) -> PathBuf {
    let mut text = String::new();
    text.push_str(&lineitem_line(1, "10.00", "1000.00", "0.10", "0.05", 'A', 'F', "1995-01-01"));
    text.push_str(&lineitem_line(2, "20.00", "2000.00", "0.00", "0.00", 'A', 'F', "1998-09-02"));
    text.push_str(&lineitem_line(3, "5.00", "500.00", "0.05", "0.05", 'N', 'O', "1998-09-03"));
    workspace.load(TableKind::LineitemQ1, "lineitem_q1", &text)
}

fn run_q1(path: &Path, ring_depth: u32, num_threads: u32) -> overlap::executor::Q1Result {
    let file = DataFile::open_read(path, false).unwrap();
    let swips = swips_for(&file);
    let query = AggregationQuery::new(
        &swips,
        &file,
        AggregationOptions {
            num_threads,
            ring_depth,
            do_work: true,
        },
    );
    query.run().unwrap()
}

#[test]
fn q1_aggregates_the_expected_groups() {
    let workspace = Workspace::new();
    let path = q1_data(&workspace);
    let result = run_q1(&path, 0, 1);

    assert_eq!(result.rows.len(), 1, "the N|O tuple ships after the cutoff");
    let row = &result.rows[0];
    assert_eq!((row.l_returnflag, row.l_linestatus), (b'A', b'F'));
    assert_eq!(row.count, 2);
    assert_eq!(row.sum_qty.to_string(), "30.00");
    assert_eq!(row.sum_base_price.to_string(), "3000.00");
    assert_eq!(row.sum_disc.to_string(), "0.10");
    assert_eq!(row.sum_disc_price.to_string(), "2900.0000");
    assert_eq!(row.sum_charge.to_string(), "2945.0000");

    let rendered = result.to_string();
    assert!(rendered.starts_with("l_returnflag|l_linestatus|"));
    assert!(rendered.contains("A|F|30.00|3000.00|2900.0000|2945.0000|15.00|1500.00|0.05|2"));
}

#[test]
fn q1_result_is_identical_across_modes_and_cache_states() {
    if !io_uring_available() {
        eprintln!("skipping: io_uring unavailable in this environment");
        return;
    }
    let workspace = Workspace::new();
    let path = q1_data(&workspace);
    let baseline = run_q1(&path, 0, 1);

    // asynchronous, multi-threaded, all swips still page indexes
    assert_eq!(run_q1(&path, 4, 2), baseline);

    // fully cached: every swip is a pointer before the run
    let file = DataFile::open_read(&path, false).unwrap();
    let swips = swips_for(&file);
    let slots: Vec<u64> = (0..swips.len() as u64).collect();
    let mut cache = PageCache::new(&swips, &file);
    cache.populate(&slots).unwrap();
    assert!(swips.iter().all(|swip| swip.load().is_pointer()));

    for ring_depth in [0, 4] {
        let query = AggregationQuery::new(
            &swips,
            &file,
            AggregationOptions {
                num_threads: 2,
                ring_depth,
                do_work: true,
            },
        );
        assert_eq!(query.run().unwrap(), baseline);
    }
}

#[test]
fn q1_do_work_false_produces_no_groups() {
    let workspace = Workspace::new();
    let path = q1_data(&workspace);
    let file = DataFile::open_read(&path, false).unwrap();
    let swips = swips_for(&file);
    let query = AggregationQuery::new(
        &swips,
        &file,
        AggregationOptions {
            num_threads: 1,
            ring_depth: 0,
            do_work: false,
        },
    );
    assert!(query.run().unwrap().rows.is_empty());
}

struct JoinFixture {
    _workspace: Workspace,
    lineitem: LineitemColumns,
    part_table: PartHashTable,
    part_file: DataFile,
}

fn join_fixture(lineitem_text: &str, part_text: &str) -> JoinFixture {
    let workspace = Workspace::new();
    let lineitem_path = workspace.load(TableKind::LineitemQ14, "lineitem_q14", lineitem_text);
    let part_path = workspace.load(TableKind::Part, "part", part_text);

    let lineitem = LineitemColumns::load(&lineitem_path).unwrap();
    let lineitem_table = LineitemHashTable::build(&lineitem, 2);
    let part_table = PartHashTable::build(&lineitem_table, &part_path, 2).unwrap();
    let part_file = DataFile::open_read(&part_path, false).unwrap();
    JoinFixture {
        _workspace: workspace,
        lineitem,
        part_table,
        part_file,
    }
}

fn run_q14(fixture: &JoinFixture, ring_depth: u32, tuples_per_task: u64, num_threads: u32) -> overlap::executor::PromoRevenue {
    let query = JoinQuery::new(
        &fixture.lineitem,
        &fixture.part_table,
        &fixture.part_file,
        JoinOptions {
            num_threads,
            ring_depth,
            tuples_per_task,
        },
    );
    query.run().unwrap()
}

#[test]
fn q14_all_promo_revenue_is_one_hundred_percent() {
    let lineitem = lineitem_line(42, "1.00", "100.00", "0.00", "0.00", 'N', 'O', "1995-09-15");
    let part = format!(
        "{}{}",
        part_line(42, "PROMO ANODIZED TIN"),
        part_line(99, "OTHER POLISHED BRASS"),
    );
    let fixture = join_fixture(&lineitem, &part);

    let revenue = run_q14(&fixture, 0, 0, 1);
    assert_eq!(revenue.promo, revenue.total);
    assert_eq!(revenue.total.to_string(), "100.0000");
    assert_eq!(revenue.percentage().to_string(), "100.00000000");
}

#[test]
fn q14_mixed_promo_share() {
    let mut lineitem = String::new();
    // in window: one promo for 100.00, one non-promo for 300.00
    lineitem.push_str(&lineitem_line(1, "1.00", "100.00", "0.00", "0.00", 'N', 'O', "1995-09-10"));
    lineitem.push_str(&lineitem_line(2, "1.00", "300.00", "0.00", "0.00", 'N', 'O', "1995-09-20"));
    // outside the window, must not contribute
    lineitem.push_str(&lineitem_line(1, "1.00", "999.00", "0.00", "0.00", 'N', 'O', "1995-10-05"));
    let part = format!(
        "{}{}",
        part_line(1, "PROMO ANODIZED TIN"),
        part_line(2, "STANDARD POLISHED BRASS"),
    );
    let fixture = join_fixture(&lineitem, &part);

    let revenue = run_q14(&fixture, 0, 0, 1);
    assert_eq!(revenue.promo.to_string(), "100.0000");
    assert_eq!(revenue.total.to_string(), "400.0000");
    assert_eq!(revenue.percentage().to_string(), "25.00000000");
}

#[test]
fn q14_modes_and_cache_states_agree() {
    if !io_uring_available() {
        eprintln!("skipping: io_uring unavailable in this environment");
        return;
    }

    // enough variety that async tasks split the tuple range
    let mut lineitem = String::new();
    for i in 0..100 {
        let key = 1 + (i % 4);
        let date = if i % 3 == 0 { "1995-09-10" } else { "1995-09-25" };
        lineitem.push_str(&lineitem_line(key, "1.00", "10.00", "0.05", "0.00", 'N', 'O', date));
    }
    let mut part = String::new();
    for key in 1..=4 {
        let p_type = if key % 2 == 0 { "PROMO PLATED TIN" } else { "LARGE BRUSHED STEEL" };
        part.push_str(&part_line(key, p_type));
    }
    let mut fixture = join_fixture(&lineitem, &part);

    let baseline = run_q14(&fixture, 0, 0, 1);
    assert!(baseline.total > baseline.promo);

    // asynchronous with small task ranges, multiple threads
    assert_eq!(run_q14(&fixture, 4, 8, 2), baseline);
    // task range larger than the whole scan: falls back to the sync tail
    assert_eq!(run_q14(&fixture, 4, 1024, 2), baseline);

    // sweep the cache to 100 % of references and re-run both modes
    let total_references = fixture.part_table.total_references();
    fixture
        .part_table
        .cache_at_least(&fixture.part_file, total_references)
        .unwrap();
    assert_eq!(fixture.part_table.cached_references(), total_references);
    assert_eq!(run_q14(&fixture, 0, 0, 2), baseline);
    assert_eq!(run_q14(&fixture, 4, 8, 2), baseline);
}

#[test]
fn async_page_reads_match_synchronous_reads() {
    if !io_uring_available() {
        eprintln!("skipping: io_uring unavailable in this environment");
        return;
    }
    use futures::executor::block_on;
    use futures::future::join_all;
    use overlap::io::{drain_ring, with_countdown, Countdown, LocalTask};
    use overlap::storage::FrameBuffer;

    let workspace = Workspace::new();
    let path = q1_data(&workspace);
    let file = DataFile::open_read(&path, false).unwrap();
    let num_pages = file.read_size().unwrap() / PAGE_SIZE as u64;
    assert!(num_pages > 0);

    let ring = IoRing::new(4).unwrap();
    let mut sync_frame = FrameBuffer::zeroed(1);
    let mut async_frame = FrameBuffer::zeroed(1);
    for page in 0..num_pages {
        file.read_page(page, sync_frame.page_bytes_mut(0)).unwrap();

        let countdown = Countdown::new(1);
        let reader = async {
            file.async_read_page(&ring, page, async_frame.page_bytes_mut(0))
                .await
        };
        let tasks: Vec<LocalTask<'_>> = vec![
            Box::pin(with_countdown(reader, &countdown)),
            Box::pin(drain_ring(&ring, &countdown)),
        ];
        for result in block_on(join_all(tasks)) {
            result.unwrap();
        }
        assert!(ring.empty());
        assert_eq!(sync_frame.page_bytes(0), async_frame.page_bytes(0));
    }
}
