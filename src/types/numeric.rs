// Copyright 2025 Overlap Project Authors. Licensed under Apache-2.0.

//! Fixed-point decimals stored as scaled 64-bit integers.

use std::fmt;
use std::ops::{Add, AddAssign, Div, Mul, Sub};
use std::str::FromStr;

use crate::error::Error;

/// A fixed-point decimal with `L` total digits and `S` fractional digits,
/// stored as `value * 10^S` in an `i64`.
///
/// Scale tracking is purely a type-level affair: addition and subtraction
/// require equal scales, multiplication adds the scales, and the raw
/// representation never changes shape. Only the scale combinations the
/// queries actually produce are implemented; stable Rust cannot express
/// `S + S` as a generic result scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
#[repr(transparent)]
pub struct Numeric<const L: u32, const S: u32>(i64);

impl<const L: u32, const S: u32> Numeric<L, S> {
    #[inline]
    pub const fn from_raw(raw: i64) -> Self {
        Numeric(raw)
    }

    #[inline]
    pub const fn raw(self) -> i64 {
        self.0
    }
}

impl<const L: u32, const S: u32> Add for Numeric<L, S> {
    type Output = Self;

    #[inline]
    fn add(self, rhs: Self) -> Self {
        Numeric(self.0 + rhs.0)
    }
}

impl<const L: u32, const S: u32> AddAssign for Numeric<L, S> {
    #[inline]
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
    }
}

impl<const L: u32, const S: u32> Sub for Numeric<L, S> {
    type Output = Self;

    #[inline]
    fn sub(self, rhs: Self) -> Self {
        Numeric(self.0 - rhs.0)
    }
}

/// Scale-2 x scale-2 multiplication, e.g. price x discount factor.
impl<const L: u32> Mul for Numeric<L, 2> {
    type Output = Numeric<L, 4>;

    #[inline]
    fn mul(self, rhs: Self) -> Numeric<L, 4> {
        Numeric(self.0 * rhs.0)
    }
}

/// Scale-4 x scale-4 multiplication, used for the final Q14 percentage.
impl<const L: u32> Mul for Numeric<L, 4> {
    type Output = Numeric<L, 8>;

    #[inline]
    fn mul(self, rhs: Self) -> Numeric<L, 8> {
        Numeric(self.0 * rhs.0)
    }
}

/// Integer division, used for averages over group counts.
impl<const L: u32, const S: u32> Div<u32> for Numeric<L, S> {
    type Output = Self;

    #[inline]
    fn div(self, rhs: u32) -> Self {
        Numeric(self.0 / rhs as i64)
    }
}

/// Division by a scale-4 value of any magnitude; the quotient keeps the
/// left operand's scale by pre-scaling the dividend with 10^4.
impl<const L: u32, const S: u32, const L2: u32> Div<Numeric<L2, 4>> for Numeric<L, S> {
    type Output = Numeric<L, S>;

    #[inline]
    fn div(self, rhs: Numeric<L2, 4>) -> Numeric<L, S> {
        Numeric(self.0 * 10_000 / rhs.0)
    }
}

impl<const L: u32> Numeric<L, 4> {
    /// Drops two fractional digits, e.g. to feed a scale-4 product back into
    /// a scale-2 multiplication.
    #[inline]
    pub const fn cast_m2(self) -> Numeric<L, 2> {
        Numeric(self.0 / 100)
    }
}

impl<const L: u32, const S: u32> FromStr for Numeric<L, S> {
    type Err = Error;

    /// Parses a decimal literal with at most two fractional digits, scaling
    /// the result so the raw value is in units of `10^-S`.
    fn from_str(s: &str) -> Result<Self, Error> {
        const { assert!(S <= 2, "parsing is only supported up to scale 2") };

        let bytes = s.as_bytes();
        let (negated, digits) = match bytes.first() {
            Some(b'-') => (true, &bytes[1..]),
            Some(b'+') => (false, &bytes[1..]),
            _ => (false, bytes),
        };
        if digits.is_empty() {
            return Err(Error::InvalidNumber(s.to_owned()));
        }

        let mut raw = 0i64;
        let mut fraction_digits: u32 = 0;
        let mut in_fraction = false;
        for &c in digits {
            match c {
                b'.' if !in_fraction => in_fraction = true,
                b'0'..=b'9' => {
                    raw = raw * 10 + (c - b'0') as i64;
                    if in_fraction {
                        fraction_digits += 1;
                    }
                }
                _ => return Err(Error::InvalidNumber(s.to_owned())),
            }
        }
        if fraction_digits > S {
            return Err(Error::InvalidNumber(s.to_owned()));
        }

        raw *= 10i64.pow(S - fraction_digits);
        Ok(Numeric(if negated { -raw } else { raw }))
    }
}

impl<const L: u32, const S: u32> fmt::Display for Numeric<L, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut raw = self.0;
        if raw < 0 {
            f.write_str("-")?;
            raw = -raw;
        }
        if S == 0 {
            return write!(f, "{}", raw);
        }
        let sep = 10i64.pow(S);
        write!(f, "{}.{:0>width$}", raw / sep, raw % sep, width = S as usize)
    }
}
