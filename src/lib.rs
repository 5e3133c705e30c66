// Copyright 2025 Overlap Project Authors. Licensed under Apache-2.0.

//! Overlap: an analytical scan-engine core that hides NVMe latency behind
//! query work.
//!
//! Column-store pages live in a flat direct-I/O file and are referenced
//! through swizzled swips. Worker threads overlap computation on resident
//! pages with outstanding io_uring reads for the rest, driven by a
//! per-thread cooperative task scheduler.

#![deny(unused_must_use)]

pub mod error;
pub mod executor;
pub mod io;
pub mod loader;
pub mod schema;
pub mod storage;
pub mod types;

pub use self::error::{Error, Result};

use tikv_jemallocator::Jemalloc;

/// Jemalloc's thread-local arenas keep frame and task allocations off the
/// global heap lock, which matters with many scan workers.
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;
