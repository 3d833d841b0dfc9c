//! Operating calendar for recurring schedules.
//!
//! A schedule runs on the weekdays set in its `WeekdayFlags` between its
//! start and end dates (both inclusive). Bit `n` of the flags is weekday `n`
//! counted from Sunday, matching the stored `daysOfWeek` encoding.

use chrono::{Datelike, NaiveDate, Weekday};

use crate::models::types::{DispatchError, Result};

/// Compact representation of which weekdays a schedule runs
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct WeekdayFlags {
    pub(crate) flags: u8,
}

impl WeekdayFlags {
    pub const ALL: u8 = 0b0111_1111;

    pub fn new() -> Self {
        Self { flags: 0 }
    }

    /// Build from the raw bitmask; bits above Saturday are discarded.
    pub fn from_bits(bits: u8) -> Self {
        Self {
            flags: bits & Self::ALL,
        }
    }

    pub fn bits(&self) -> u8 {
        self.flags
    }

    /// Build from day numbers (0 = Sunday .. 6 = Saturday).
    pub fn from_day_numbers(days: &[u8]) -> Result<Self> {
        let mut flags = Self::new();
        for &day in days {
            if day > 6 {
                return Err(DispatchError::InvalidData(format!(
                    "day of week {} is outside 0 (Sunday) ..= 6 (Saturday)",
                    day
                )));
            }
            flags.flags |= 1 << day;
        }
        Ok(flags)
    }

    pub fn from_weekdays(days: &[Weekday]) -> Self {
        let mut flags = Self::new();
        for &day in days {
            flags.set(day);
        }
        flags
    }

    pub fn set(&mut self, weekday: Weekday) {
        self.flags |= 1 << weekday.num_days_from_sunday();
    }

    pub fn unset(&mut self, weekday: Weekday) {
        self.flags &= !(1 << weekday.num_days_from_sunday());
    }

    pub fn contains(&self, weekday: Weekday) -> bool {
        (self.flags & (1 << weekday.num_days_from_sunday())) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.flags == 0
    }
}

/// Inclusive range of calendar dates
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    /// Returns `Err` when `start` is after `end`.
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self> {
        if start > end {
            return Err(DispatchError::InvalidDateRange { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start && date <= self.end
    }

    /// Overlap of two ranges, `None` when they are disjoint
    pub fn intersect(&self, other: &DateRange) -> Option<DateRange> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        (start <= end).then_some(DateRange { start, end })
    }
}

/// Lazy, restartable walk over the dates of a range whose weekday is set.
///
/// Call `restart` (or clone before consuming) to walk the same dates again.
#[derive(Clone, Debug)]
pub struct ServiceDates {
    range: Option<DateRange>,
    weekdays: WeekdayFlags,
    cursor: Option<NaiveDate>,
}

impl ServiceDates {
    pub fn new(range: Option<DateRange>, weekdays: WeekdayFlags) -> Self {
        Self {
            range,
            weekdays,
            cursor: range.map(|r| r.start),
        }
    }

    /// An iterator that yields nothing
    pub fn empty() -> Self {
        Self::new(None, WeekdayFlags::new())
    }

    pub fn restart(&mut self) {
        self.cursor = self.range.map(|r| r.start);
    }
}

impl Iterator for ServiceDates {
    type Item = NaiveDate;

    fn next(&mut self) -> Option<NaiveDate> {
        let range = self.range?;
        if self.weekdays.is_empty() {
            self.cursor = None;
            return None;
        }

        while let Some(date) = self.cursor {
            if date > range.end {
                self.cursor = None;
                break;
            }
            self.cursor = date.succ_opt();
            if self.weekdays.contains(date.weekday()) {
                return Some(date);
            }
        }
        None
    }
}
