// Copyright 2025 Overlap Project Authors. Licensed under Apache-2.0.

//! Column-oriented page layouts for the scanned relations.
//!
//! A page is `num_tuples` followed by one fixed-capacity array per column.
//! The capacity is derived per layout so the struct fits exactly one
//! [`PAGE_SIZE`] block; slots past `num_tuples` contain garbage and must
//! never be interpreted. Pages are immutable once loaded.

use std::mem::{align_of, size_of};

use crate::error::{Error, Result};
use crate::storage::PAGE_SIZE;
use crate::types::{Char, Date, Integer, Numeric, Varchar};

/// Page header plus worst-case padding before the first 8-byte column.
const PAGE_HEADER: usize = 8;

/// A page layout that the loader can fill row by row.
pub trait TablePage {
    /// Upper bound on tuples per page for this layout.
    const MAX_TUPLES: usize;

    fn num_tuples(&self) -> u32;

    fn set_num_tuples(&mut self, num_tuples: u32);

    /// Parses one `|`-delimited TPC-H input row into tuple slot `index`.
    fn parse_row(&mut self, index: usize, line: &str) -> Result<()>;
}

/// The `p_type` column; 25 bytes is the TPC-H maximum.
pub type PartType = Varchar<u8, 25>;

const LINEITEM_Q1_TUPLES: usize = (PAGE_SIZE - PAGE_HEADER) / 38;
const LINEITEM_Q14_TUPLES: usize = (PAGE_SIZE - PAGE_HEADER) / 24;
const PART_TUPLES: usize = (PAGE_SIZE - size_of::<u32>()) / 30;

/// Lineitem columns needed by the grouped-aggregation query.
/// 38 bytes per tuple.
#[repr(C)]
pub struct LineitemQ1Page {
    pub num_tuples: u32,
    pub l_quantity: [Numeric<12, 2>; LINEITEM_Q1_TUPLES],
    pub l_extendedprice: [Numeric<12, 2>; LINEITEM_Q1_TUPLES],
    pub l_discount: [Numeric<12, 2>; LINEITEM_Q1_TUPLES],
    pub l_tax: [Numeric<12, 2>; LINEITEM_Q1_TUPLES],
    pub l_returnflag: [Char; LINEITEM_Q1_TUPLES],
    pub l_linestatus: [Char; LINEITEM_Q1_TUPLES],
    pub l_shipdate: [Date; LINEITEM_Q1_TUPLES],
}

/// Lineitem columns needed by the hash-join query. 24 bytes per tuple.
#[repr(C)]
pub struct LineitemQ14Page {
    pub num_tuples: u32,
    pub l_partkey: [Integer; LINEITEM_Q14_TUPLES],
    pub l_extendedprice: [Numeric<12, 2>; LINEITEM_Q14_TUPLES],
    pub l_discount: [Numeric<12, 2>; LINEITEM_Q14_TUPLES],
    pub l_shipdate: [Date; LINEITEM_Q14_TUPLES],
}

/// Part columns needed by the hash-join query. 30 bytes per tuple.
#[repr(C)]
pub struct PartPage {
    pub num_tuples: u32,
    pub p_partkey: [Integer; PART_TUPLES],
    pub p_type: [PartType; PART_TUPLES],
}

// Each layout must fill a page as tightly as its tuple width allows.
const _: () = {
    assert!(size_of::<LineitemQ1Page>() <= PAGE_SIZE);
    assert!(size_of::<LineitemQ1Page>() + 38 > PAGE_SIZE - PAGE_HEADER);
    assert!(size_of::<LineitemQ14Page>() <= PAGE_SIZE);
    assert!(size_of::<PartPage>() <= PAGE_SIZE);
    assert!(size_of::<PartPage>() + 30 > PAGE_SIZE - PAGE_HEADER);
};

/// Reinterprets a page-sized byte block as a page.
///
/// All column types are plain old data for which any bit pattern is a valid
/// value, so this is sound as long as the block is big enough and aligned to
/// the layout's natural alignment (frame buffers and memory maps both
/// guarantee far stronger page alignment).
#[inline]
pub fn page_from_bytes<P: Sized>(bytes: &[u8]) -> &P {
    debug_assert!(bytes.len() >= size_of::<P>());
    debug_assert_eq!(bytes.as_ptr() as usize % align_of::<P>(), 0);
    unsafe { &*(bytes.as_ptr() as *const P) }
}

/// Mutable counterpart of [`page_from_bytes`], used by the loader.
#[inline]
pub fn page_from_bytes_mut<P: Sized>(bytes: &mut [u8]) -> &mut P {
    debug_assert!(bytes.len() >= size_of::<P>());
    debug_assert_eq!(bytes.as_ptr() as usize % align_of::<P>(), 0);
    unsafe { &mut *(bytes.as_mut_ptr() as *mut P) }
}

fn column<'a>(fields: &mut impl Iterator<Item = &'a str>, name: &'static str) -> Result<&'a str> {
    fields.next().ok_or(Error::MissingColumn(name))
}

impl TablePage for LineitemQ1Page {
    const MAX_TUPLES: usize = LINEITEM_Q1_TUPLES;

    fn num_tuples(&self) -> u32 {
        self.num_tuples
    }

    fn set_num_tuples(&mut self, num_tuples: u32) {
        self.num_tuples = num_tuples;
    }

    fn parse_row(&mut self, index: usize, line: &str) -> Result<()> {
        let mut fields = line.split('|');
        // skip l_orderkey, l_partkey, l_suppkey, l_linenumber
        let _ = fields.nth(3).ok_or(Error::MissingColumn("l_linenumber"))?;
        self.l_quantity[index] = column(&mut fields, "l_quantity")?.parse()?;
        self.l_extendedprice[index] = column(&mut fields, "l_extendedprice")?.parse()?;
        self.l_discount[index] = column(&mut fields, "l_discount")?.parse()?;
        self.l_tax[index] = column(&mut fields, "l_tax")?.parse()?;
        self.l_returnflag[index] = first_byte(column(&mut fields, "l_returnflag")?)?;
        self.l_linestatus[index] = first_byte(column(&mut fields, "l_linestatus")?)?;
        self.l_shipdate[index] = column(&mut fields, "l_shipdate")?.parse()?;
        Ok(())
    }
}

impl TablePage for LineitemQ14Page {
    const MAX_TUPLES: usize = LINEITEM_Q14_TUPLES;

    fn num_tuples(&self) -> u32 {
        self.num_tuples
    }

    fn set_num_tuples(&mut self, num_tuples: u32) {
        self.num_tuples = num_tuples;
    }

    fn parse_row(&mut self, index: usize, line: &str) -> Result<()> {
        let mut fields = line.split('|');
        let _ = fields.next().ok_or(Error::MissingColumn("l_orderkey"))?;
        self.l_partkey[index] = column(&mut fields, "l_partkey")?.parse()?;
        // skip l_suppkey, l_linenumber, l_quantity
        let _ = fields.nth(2).ok_or(Error::MissingColumn("l_quantity"))?;
        self.l_extendedprice[index] = column(&mut fields, "l_extendedprice")?.parse()?;
        self.l_discount[index] = column(&mut fields, "l_discount")?.parse()?;
        // skip l_tax, l_returnflag, l_linestatus
        let _ = fields.nth(2).ok_or(Error::MissingColumn("l_linestatus"))?;
        self.l_shipdate[index] = column(&mut fields, "l_shipdate")?.parse()?;
        Ok(())
    }
}

impl TablePage for PartPage {
    const MAX_TUPLES: usize = PART_TUPLES;

    fn num_tuples(&self) -> u32 {
        self.num_tuples
    }

    fn set_num_tuples(&mut self, num_tuples: u32) {
        self.num_tuples = num_tuples;
    }

    fn parse_row(&mut self, index: usize, line: &str) -> Result<()> {
        let mut fields = line.split('|');
        self.p_partkey[index] = column(&mut fields, "p_partkey")?.parse()?;
        // skip p_name, p_mfgr, p_brand
        let _ = fields.nth(2).ok_or(Error::MissingColumn("p_brand"))?;
        self.p_type[index] = PartType::new(column(&mut fields, "p_type")?.as_bytes());
        Ok(())
    }
}

fn first_byte(field: &str) -> Result<u8> {
    field
        .as_bytes()
        .first()
        .copied()
        .ok_or(Error::MissingColumn("single-character column"))
}
