// Copyright 2025 Overlap Project Authors. Licensed under Apache-2.0.

//! Error types shared across the storage and execution layers.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The caller submitted more reads than the ring has entries without
    /// draining first. This is a programming bug, not a runtime condition.
    #[error("submission queue is full")]
    SubmissionQueueFull,

    /// An append wrote fewer bytes than requested. Retrying is unsafe while
    /// other threads append to the same file, so this is fatal.
    #[error("short write: wrote {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },

    /// A partkey that the lineitem table promised is absent from the part
    /// table. The build guarantees coverage, so this is a logic error.
    #[error("partkey {0} not found in part hash table")]
    PartkeyNotFound(i32),

    #[error("invalid numeric literal {0:?}")]
    InvalidNumber(String),

    #[error("invalid date literal {0:?}")]
    InvalidDate(String),

    #[error("invalid integer literal {0:?}")]
    InvalidInteger(String),

    #[error("input row is missing column {0}")]
    MissingColumn(&'static str),

    #[error("input row is not valid UTF-8")]
    InvalidUtf8,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
