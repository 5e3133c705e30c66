// Copyright 2025 Overlap Project Authors. Licensed under Apache-2.0.

//! Per-thread asynchronous I/O: an io_uring submission/completion ring and
//! the cooperative task helpers that drive it.
//!
//! Rings are strictly thread-local. A worker thread owns one ring, spawns a
//! bounded batch of tasks that await reads on it, adds a drainer task that
//! polls completions until the batch's countdown reaches zero, and blocks on
//! the whole group. There is no cross-thread task migration.

mod ring;
mod task;

pub use ring::IoRing;
pub use task::{drain_ring, with_countdown, Countdown, LocalTask};
