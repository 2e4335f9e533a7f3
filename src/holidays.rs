//! Public holiday lookup for schedule exclusion.
//!
//! Fixed-date holidays apply to every year. Easter-derived holidays come from
//! a per-year table and only apply to the years it covers.

use chrono::{Datelike, NaiveDate};
use std::ops::RangeInclusive;

/// (month, day) holidays observed every year.
const FIXED_HOLIDAYS: &[(u32, u32)] = &[
    (1, 1),   // New Year's Day
    (4, 27),  // King's Day
    (5, 5),   // Liberation Day
    (12, 25), // Christmas Day
    (12, 26), // Second Christmas Day
];

/// Easter Sunday per supported year.
const EASTER_SUNDAYS: &[(i32, u32, u32)] = &[
    (2024, 3, 31),
    (2025, 4, 20),
    (2026, 4, 5),
    (2027, 3, 28),
    (2028, 4, 16),
    (2029, 4, 1),
    (2030, 4, 21),
];

/// Years for which Easter-derived holidays are known.
pub fn supported_years() -> RangeInclusive<i32> {
    let first = EASTER_SUNDAYS.first().map(|(y, _, _)| *y).unwrap_or(0);
    let last = EASTER_SUNDAYS.last().map(|(y, _, _)| *y).unwrap_or(-1);
    first..=last
}

fn easter_sunday(year: i32) -> Option<NaiveDate> {
    EASTER_SUNDAYS
        .iter()
        .find(|(y, _, _)| *y == year)
        .and_then(|(y, m, d)| NaiveDate::from_ymd_opt(*y, *m, *d))
}

/// Returns true when `date` is a public holiday.
pub fn is_holiday(date: NaiveDate) -> bool {
    if FIXED_HOLIDAYS.contains(&(date.month(), date.day())) {
        return true;
    }

    let Some(easter) = easter_sunday(date.year()) else {
        return false;
    };
    // Easter Monday and Good Friday
    easter.succ_opt() == Some(date) || easter.pred_opt().and_then(|d| d.pred_opt()) == Some(date)
}
