// Copyright 2025 Overlap Project Authors. Licensed under Apache-2.0.

//! io_uring wrapper with waker-based completion dispatch.

use std::cell::RefCell;
use std::future::Future;
use std::os::unix::io::RawFd;
use std::pin::Pin;
use std::task::{Context, Poll, Waker};

use io_uring::{opcode, types, IoUring};

use crate::error::{Error, Result};

/// Completions harvested per `process_batch` call.
const COMPLETION_BATCH_SIZE: usize = 8;

enum OpSlot {
    /// Submitted; the waker belongs to the task blocked on this read.
    Waiting(Waker),
    /// Completed with the raw kernel result code.
    Done(i32),
    /// The awaiting future was dropped before completion; the completion is
    /// still accounted and the slot freed when it arrives.
    Orphaned,
}

struct Inner {
    ring: IoUring,
    ops: Vec<Option<OpSlot>>,
    free: Vec<usize>,
    in_flight: usize,
}

/// A bounded submission/completion ring over kernel asynchronous I/O.
///
/// At most `entries` reads may be in flight; the callers guarantee this by
/// never running more than `entries` concurrent tasks per ring. Every
/// submission must be drained before the ring is dropped.
pub struct IoRing {
    inner: RefCell<Inner>,
}

impl IoRing {
    pub fn new(entries: u32) -> Result<Self> {
        let ring = IoUring::new(entries)?;
        Ok(IoRing {
            inner: RefCell::new(Inner {
                ring,
                ops: Vec::with_capacity(entries as usize),
                free: Vec::new(),
                in_flight: 0,
            }),
        })
    }

    /// True iff no submitted read is still in flight.
    pub fn empty(&self) -> bool {
        self.inner.borrow().in_flight == 0
    }

    /// Harvests up to [`COMPLETION_BATCH_SIZE`] ready completions without
    /// blocking, then wakes the tasks they belong to. Wakers run after the
    /// ring state is released so a woken task may submit again immediately.
    pub fn process_batch(&self) {
        let mut wakers: Vec<Waker> = Vec::with_capacity(COMPLETION_BATCH_SIZE);
        {
            let mut inner = self.inner.borrow_mut();
            let completions: Vec<_> = inner
                .ring
                .completion()
                .take(COMPLETION_BATCH_SIZE)
                .collect();
            inner.in_flight -= completions.len();
            for cqe in completions {
                let key = cqe.user_data() as usize;
                match inner.ops[key].take() {
                    Some(OpSlot::Waiting(waker)) => {
                        inner.ops[key] = Some(OpSlot::Done(cqe.result()));
                        wakers.push(waker);
                    }
                    Some(OpSlot::Orphaned) => inner.free.push(key),
                    state => {
                        debug_assert!(state.is_none(), "completion for an idle slot");
                        inner.free.push(key);
                    }
                }
            }
        }
        for waker in wakers {
            waker.wake();
        }
    }

    /// Returns a future that reads `buffer.len()` bytes at `offset` and
    /// resolves to the number of bytes the kernel delivered.
    pub(crate) fn read<'a>(&'a self, fd: RawFd, buffer: &'a mut [u8], offset: u64) -> ReadOp<'a> {
        ReadOp {
            ring: self,
            fd,
            buffer,
            offset,
            key: None,
        }
    }

    fn submit_read(
        &self,
        fd: RawFd,
        buffer: &mut [u8],
        offset: u64,
        waker: Waker,
    ) -> Result<usize> {
        let mut inner = self.inner.borrow_mut();
        let key = match inner.free.pop() {
            Some(key) => key,
            None => {
                inner.ops.push(None);
                inner.ops.len() - 1
            }
        };
        inner.ops[key] = Some(OpSlot::Waiting(waker));

        let entry = opcode::Read::new(types::Fd(fd), buffer.as_mut_ptr(), buffer.len() as u32)
            .offset(offset)
            .build()
            .user_data(key as u64);
        // SAFETY: the buffer outlives the operation. The awaiting future
        // borrows it for its own lifetime and the drainer keeps polling
        // until every completion has arrived.
        let pushed = unsafe { inner.ring.submission().push(&entry) };
        if pushed.is_err() {
            inner.ops[key] = None;
            inner.free.push(key);
            return Err(Error::SubmissionQueueFull);
        }
        inner.ring.submit()?;
        inner.in_flight += 1;
        Ok(key)
    }

    /// Polls slot `key`: the completed result if it arrived, otherwise
    /// re-registers `waker` and stays pending.
    fn poll_result(&self, key: usize, waker: &Waker) -> Option<i32> {
        let mut inner = self.inner.borrow_mut();
        match inner.ops[key].take() {
            Some(OpSlot::Done(result)) => {
                inner.free.push(key);
                Some(result)
            }
            Some(OpSlot::Waiting(_)) => {
                inner.ops[key] = Some(OpSlot::Waiting(waker.clone()));
                None
            }
            state => unreachable!("polled an idle slot: {:?}", state.is_some()),
        }
    }

    fn orphan(&self, key: usize) {
        let mut inner = self.inner.borrow_mut();
        match inner.ops[key].take() {
            Some(OpSlot::Done(_)) => inner.free.push(key),
            Some(OpSlot::Waiting(_)) => inner.ops[key] = Some(OpSlot::Orphaned),
            _ => {}
        }
    }
}

impl Drop for IoRing {
    fn drop(&mut self) {
        // Outstanding reads would scribble over freed buffers; the drainer
        // pattern guarantees this never fires.
        debug_assert_eq!(self.inner.borrow().in_flight, 0);
    }
}

/// A single in-flight read. Submission happens lazily on first poll, which
/// is where the task's waker first becomes available.
pub(crate) struct ReadOp<'a> {
    ring: &'a IoRing,
    fd: RawFd,
    buffer: &'a mut [u8],
    offset: u64,
    key: Option<usize>,
}

impl Future for ReadOp<'_> {
    type Output = Result<usize>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match this.key {
            None => {
                let key =
                    this.ring
                        .submit_read(this.fd, this.buffer, this.offset, cx.waker().clone())?;
                this.key = Some(key);
                Poll::Pending
            }
            Some(key) => match this.ring.poll_result(key, cx.waker()) {
                Some(result) if result < 0 => {
                    this.key = None;
                    Poll::Ready(Err(std::io::Error::from_raw_os_error(-result).into()))
                }
                Some(result) => {
                    this.key = None;
                    Poll::Ready(Ok(result as usize))
                }
                None => Poll::Pending,
            },
        }
    }
}

impl Drop for ReadOp<'_> {
    fn drop(&mut self) {
        if let Some(key) = self.key {
            self.ring.orphan(key);
        }
    }
}
