// Copyright 2025 Overlap Project Authors. Licensed under Apache-2.0.

//! Page-granular storage: the direct-I/O data file, aligned frame buffers,
//! swizzled page references and the page cache.

mod cache;
mod file;
mod frame;
mod swip;

pub use cache::PageCache;
pub use file::DataFile;
pub use frame::FrameBuffer;
pub use swip::{Swip, SwipValue};

/// Power-of-two exponent of the page size. Overridable at compile time via
/// the `OVERLAP_PAGE_SIZE_POWER` environment variable; files written with
/// one power are not compatible with a binary built for another.
pub const PAGE_SIZE_POWER: u32 = match option_env!("OVERLAP_PAGE_SIZE_POWER") {
    Some(s) => parse_power(s),
    None => 16,
};

/// Size in bytes of one page. Pages are read and written as whole blocks of
/// this size, and frame buffers are aligned to it for direct I/O.
pub const PAGE_SIZE: usize = 1 << PAGE_SIZE_POWER;

const _: () = assert!(
    PAGE_SIZE_POWER >= 12 && PAGE_SIZE_POWER <= 22,
    "page size power must lie in [12, 22]"
);

/// Index of a page within a data file; byte offset is `index * PAGE_SIZE`.
pub type PageIndex = u64;

const fn parse_power(s: &str) -> u32 {
    let bytes = s.as_bytes();
    assert!(!bytes.is_empty(), "OVERLAP_PAGE_SIZE_POWER must be a number");
    let mut value = 0u32;
    let mut i = 0;
    while i < bytes.len() {
        assert!(bytes[i].is_ascii_digit(), "OVERLAP_PAGE_SIZE_POWER must be a number");
        value = value * 10 + (bytes[i] - b'0') as u32;
        i += 1;
    }
    value
}
