// Copyright 2025 Overlap Project Authors. Licensed under Apache-2.0.

//! Page cache that swizzles a chosen subset of swips to in-memory frames.

use futures::executor::block_on;
use futures::future::join_all;
use tracing::debug;

use super::{DataFile, FrameBuffer, Swip, PAGE_SIZE};
use crate::error::Result;
use crate::io::{drain_ring, with_countdown, Countdown, IoRing, LocalTask};

/// Concurrent loader tasks (and ring depth) used while populating.
const NUM_LOAD_TASKS: usize = 64;

/// Holds in-memory copies of pages and rewrites the corresponding swips to
/// point at them. Frames are owned by the cache and stay valid (and
/// immutable) for its lifetime, so swizzled swips may be dereferenced for
/// as long as the cache lives.
pub struct PageCache<'a> {
    swips: &'a [Swip],
    file: &'a DataFile,
    frames: FrameBuffer,
    used: usize,
}

impl<'a> PageCache<'a> {
    /// Reserves one frame per swip up front; population commits them in
    /// whatever order the subsets arrive.
    pub fn new(swips: &'a [Swip], file: &'a DataFile) -> Self {
        PageCache {
            swips,
            file,
            frames: FrameBuffer::zeroed(swips.len().max(1)),
            used: 0,
        }
    }

    /// Loads the pages behind `swip_slots` asynchronously and flips each
    /// swip to its frame. On return every listed swip is a pointer; a
    /// failed read leaves its swip (and any not yet processed) untouched.
    pub fn populate(&mut self, swip_slots: &[u64]) -> Result<()> {
        if swip_slots.is_empty() {
            return Ok(());
        }
        debug!(num_pages = swip_slots.len(), "populating page cache");

        let ring = IoRing::new(NUM_LOAD_TASKS as u32)?;
        let countdown = Countdown::new(0);
        let partition_size = swip_slots.len().div_ceil(NUM_LOAD_TASKS);

        let swips = self.swips;
        let file = self.file;
        let region = self.frames.page_range_mut(self.used, swip_slots.len());

        let mut tasks: Vec<LocalTask<'_>> = Vec::with_capacity(NUM_LOAD_TASKS + 1);
        for (slots, frames) in swip_slots
            .chunks(partition_size)
            .zip(region.chunks_mut(partition_size * PAGE_SIZE))
        {
            tasks.push(Box::pin(with_countdown(
                load_partition(file, &ring, swips, slots, frames),
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

        self.used += swip_slots.len();
        Ok(())
    }
}

async fn load_partition(
    file: &DataFile,
    ring: &IoRing,
    swips: &[Swip],
    slots: &[u64],
    frames: &mut [u8],
) -> Result<()> {
    for (&slot, frame) in slots.iter().zip(frames.chunks_mut(PAGE_SIZE)) {
        let swip = &swips[slot as usize];
        file.async_read_page(ring, swip.load().page_index(), frame)
            .await?;
        swip.set_pointer(frame.as_ptr());
    }
    Ok(())
}
