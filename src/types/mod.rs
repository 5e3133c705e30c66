// Copyright 2025 Overlap Project Authors. Licensed under Apache-2.0.

//! Column value types stored inside pages.
//!
//! Every type here is plain old data with a fixed byte layout, because pages
//! are read straight off disk and reinterpreted in place. Arithmetic and
//! parsing live with the types; the schema module decides which columns use
//! which type.

mod date;
mod numeric;
mod varchar;

use std::fmt;
use std::str::FromStr;

pub use date::Date;
pub use numeric::Numeric;
pub use varchar::{LengthIndicator, Varchar};

use crate::error::Error;

/// A single-byte column value, e.g. `l_returnflag`.
pub type Char = u8;

/// Signed 32-bit column value with a deterministic 64-bit hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
#[repr(transparent)]
pub struct Integer(pub i32);

impl Integer {
    /// Xorshift mix over the value. The seed constant is fixed so that
    /// bucket placement is reproducible across runs and threads.
    #[inline]
    pub fn hash(self) -> u64 {
        let mut r = 88172645463325252u64 ^ self.0 as u64;
        r ^= r << 13;
        r ^= r >> 7;
        r ^ (r << 17)
    }
}

impl FromStr for Integer {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        s.parse::<i32>()
            .map(Integer)
            .map_err(|_| Error::InvalidInteger(s.to_owned()))
    }
}

impl fmt::Display for Integer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
