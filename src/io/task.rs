// Copyright 2025 Overlap Project Authors. Licensed under Apache-2.0.

//! Cooperative task plumbing shared by every worker thread.
//!
//! Tasks are plain `async` blocks boxed into [`LocalTask`]s so a batch of
//! page readers and the ring drainer can be awaited together with
//! `futures::future::join_all` under `futures::executor::block_on`. Nothing
//! here is `Send`; a batch lives and dies on the thread that created it.

use std::cell::Cell;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::error::Result;
use crate::io::IoRing;

/// A boxed, thread-local task future.
pub type LocalTask<'a> = Pin<Box<dyn Future<Output = Result<()>> + 'a>>;

/// Completion criterion for one batch of tasks: each work task decrements it
/// at its last step, and the drainer polls the ring until it hits zero.
#[derive(Default)]
pub struct Countdown(Cell<u64>);

impl Countdown {
    pub fn new(count: u64) -> Self {
        Countdown(Cell::new(count))
    }

    pub fn set(&self, count: u64) {
        self.0.set(count);
    }

    pub fn decrement(&self) {
        debug_assert!(self.0.get() > 0);
        self.0.set(self.0.get() - 1);
    }

    pub fn is_zero(&self) -> bool {
        self.0.get() == 0
    }
}

/// Runs `task` to completion, then decrements `countdown` whether the task
/// succeeded or failed. Errors still reach the caller of the blocking wait,
/// but only after the drainer has been allowed to finish, so no ring entry
/// is ever left un-drained by a failing task.
pub async fn with_countdown<F>(task: F, countdown: &Countdown) -> Result<()>
where
    F: Future<Output = Result<()>>,
{
    let result = task.await;
    countdown.decrement();
    result
}

/// Polls the ring until `countdown` reaches zero.
///
/// The final completion resumes the last work task, which decrements the
/// countdown and lets this task exit; afterwards the ring is empty.
pub async fn drain_ring(ring: &IoRing, countdown: &Countdown) -> Result<()> {
    while !countdown.is_zero() {
        ring.process_batch();
        yield_now().await;
    }
    Ok(())
}

/// Suspends once so tasks woken by `process_batch` get polled before the
/// drainer runs again.
fn yield_now() -> YieldNow {
    YieldNow { yielded: false }
}

struct YieldNow {
    yielded: bool,
}

impl Future for YieldNow {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.yielded {
            Poll::Ready(())
        } else {
            self.yielded = true;
            cx.waker().wake_by_ref();
            Poll::Pending
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn countdown_reaches_zero() {
        let countdown = Countdown::new(2);
        assert!(!countdown.is_zero());
        countdown.decrement();
        countdown.decrement();
        assert!(countdown.is_zero());
        countdown.set(1);
        assert!(!countdown.is_zero());
    }

    #[test]
    fn with_countdown_decrements_on_error() {
        let countdown = Countdown::new(1);
        let result = futures::executor::block_on(with_countdown(
            async { Err(crate::error::Error::SubmissionQueueFull) },
            &countdown,
        ));
        assert!(result.is_err());
        assert!(countdown.is_zero());
    }
}
