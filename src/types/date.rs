// Copyright 2025 Overlap Project Authors. Licensed under Apache-2.0.

//! Calendar dates stored as Julian-day numbers.

use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, NaiveDate};

use crate::error::Error;

/// Days between 0001-01-01 (proleptic Gregorian, day 1 in chrono's count)
/// and the Julian-day epoch.
const JULIAN_DAY_OFFSET: u32 = 1_721_425;

/// A date as an unsigned 32-bit Julian-day number.
///
/// Comparisons on the raw day number are all the scan predicates need, so
/// the hot path never touches a calendar. String conversion only happens in
/// the loader and in formatted output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
#[repr(transparent)]
pub struct Date(u32);

impl Date {
    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Date(raw)
    }

    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Julian-day number for a Gregorian calendar date (algorithm from the
    /// Calendar FAQ). Usable in const contexts for query constants.
    pub const fn from_ymd(year: u32, month: u32, day: u32) -> Self {
        let a = (14 - month) / 12;
        let y = year + 4800 - a;
        let m = month + 12 * a - 3;
        Date(day + (153 * m + 2) / 5 + 365 * y + y / 4 - y / 100 + y / 400 - 32045)
    }
}

impl FromStr for Date {
    type Err = Error;

    /// Parses `YYYY-MM-DD`. Validation (month range, leap days) is delegated
    /// to chrono; the stored value is the Julian-day number.
    fn from_str(s: &str) -> Result<Self, Error> {
        let date = NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .map_err(|_| Error::InvalidDate(s.to_owned()))?;
        Ok(Date::from_ymd(
            date.year() as u32,
            date.month(),
            date.day(),
        ))
    }
}

impl fmt::Display for Date {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match NaiveDate::from_num_days_from_ce_opt(self.0 as i32 - JULIAN_DAY_OFFSET as i32) {
            Some(date) => write!(f, "{}", date.format("%Y-%m-%d")),
            None => write!(f, "#{}", self.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_julian_day_numbers() {
        assert_eq!(Date::from_ymd(1970, 1, 1).raw(), 2_440_588);
        assert_eq!(Date::from_ymd(1998, 9, 2).raw(), 2_451_059);
    }

    #[test]
    fn parse_format_round_trip() {
        for s in ["1992-01-02", "1995-09-30", "1998-12-01", "2000-02-29"] {
            let date: Date = s.parse().unwrap();
            assert_eq!(date.to_string(), s);
        }
    }

    #[test]
    fn parse_matches_const_constructor() {
        assert_eq!("1995-09-01".parse::<Date>().unwrap(), Date::from_ymd(1995, 9, 1));
    }

    #[test]
    fn ordering_follows_the_calendar() {
        let lo: Date = "1995-09-01".parse().unwrap();
        let mid: Date = "1995-09-15".parse().unwrap();
        let hi: Date = "1995-09-30".parse().unwrap();
        assert!(lo <= mid && mid <= hi);
        assert!(hi < "1995-10-01".parse::<Date>().unwrap());
    }

    #[test]
    fn rejects_malformed_input() {
        assert!("1995/09/01".parse::<Date>().is_err());
        assert!("1995-13-01".parse::<Date>().is_err());
        assert!("".parse::<Date>().is_err());
    }
}
