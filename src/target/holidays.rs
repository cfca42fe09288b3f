//! Public holiday calendar used by holiday policies.
//!
//! The bundled calendar follows the Japanese national holiday rules in force
//! since 2020 (the booking sites are municipal Japanese facilities), plus any
//! extra closure days the operator configures.

use std::collections::BTreeSet;

use chrono::{Datelike, Duration, NaiveDate, Weekday};

/// Answers whether a date is a public holiday.
pub trait HolidayCalendar: Send + Sync {
    fn is_holiday(&self, date: NaiveDate) -> bool;
}

/// A fixed set of dates. Handy for tests and for sites with their own closure list.
impl HolidayCalendar for BTreeSet<NaiveDate> {
    fn is_holiday(&self, date: NaiveDate) -> bool {
        self.contains(&date)
    }
}

/// Japanese national holidays plus configured extra dates.
#[derive(Debug, Clone, Default)]
pub struct JapaneseHolidays {
    extra: BTreeSet<NaiveDate>,
}

impl JapaneseHolidays {
    pub fn new() -> Self {
        Self::default()
    }

    /// Calendar that also treats `extra` dates as holidays.
    pub fn with_extra(extra: impl IntoIterator<Item = NaiveDate>) -> Self {
        Self {
            extra: extra.into_iter().collect(),
        }
    }
}

impl HolidayCalendar for JapaneseHolidays {
    fn is_holiday(&self, date: NaiveDate) -> bool {
        self.extra.contains(&date) || is_national_holiday(date)
    }
}

/// Named holidays, substitute holidays, and sandwiched citizen's holidays.
pub fn is_national_holiday(date: NaiveDate) -> bool {
    is_named_holiday(date) || is_substitute_holiday(date) || is_citizens_holiday(date)
}

fn is_named_holiday(date: NaiveDate) -> bool {
    let year = date.year();
    let nth_monday = |month: u32, n: u8| {
        NaiveDate::from_weekday_of_month_opt(year, month, Weekday::Mon, n) == Some(date)
    };

    match (date.month(), date.day()) {
        (1, 1) | (2, 11) | (2, 23) | (4, 29) | (5, 3) | (5, 4) | (5, 5) | (8, 11) | (11, 3)
        | (11, 23) => true,
        (3, d) => Some(d) == vernal_equinox_day(year),
        (9, d) if Some(d) == autumnal_equinox_day(year) => true,
        (1, _) => nth_monday(1, 2),
        (7, _) => nth_monday(7, 3),
        (9, _) => nth_monday(9, 3),
        (10, _) => nth_monday(10, 2),
        _ => false,
    }
}

/// A holiday falling on Sunday moves to the next day that is not itself a holiday.
fn is_substitute_holiday(date: NaiveDate) -> bool {
    if is_named_holiday(date) {
        return false;
    }
    let mut prev = date - Duration::days(1);
    while is_named_holiday(prev) {
        if prev.weekday() == Weekday::Sun {
            return true;
        }
        prev -= Duration::days(1);
    }
    false
}

/// An ordinary day between two holidays becomes a holiday.
fn is_citizens_holiday(date: NaiveDate) -> bool {
    !is_named_holiday(date)
        && is_named_holiday(date - Duration::days(1))
        && is_named_holiday(date + Duration::days(1))
}

// Approximation valid for 1980-2099.
fn equinox_day(year: i32, base: f64) -> Option<u32> {
    if !(1980..=2099).contains(&year) {
        return None;
    }
    let y = f64::from(year - 1980);
    let day = base + 0.242194 * y - (y / 4.0).floor();
    Some(day.floor() as u32)
}

fn vernal_equinox_day(year: i32) -> Option<u32> {
    equinox_day(year, 20.8431)
}

fn autumnal_equinox_day(year: i32) -> Option<u32> {
    equinox_day(year, 23.2488)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn test_fixed_and_monday_holidays() {
        assert!(is_national_holiday(d(2026, 1, 1)));
        assert!(is_national_holiday(d(2026, 1, 12))); // Coming of Age Day
        assert!(is_national_holiday(d(2026, 7, 20))); // Marine Day
        assert!(is_national_holiday(d(2026, 10, 12))); // Sports Day
        assert!(is_national_holiday(d(2026, 11, 3)));
        assert!(!is_national_holiday(d(2026, 10, 13)));
        assert!(!is_national_holiday(d(2026, 1, 5)));
    }

    #[test]
    fn test_equinoxes() {
        assert!(is_national_holiday(d(2026, 3, 20)));
        assert!(is_national_holiday(d(2026, 9, 23)));
        assert!(!is_national_holiday(d(2026, 3, 21)));
    }

    #[test]
    fn test_substitute_holiday_after_golden_week_sunday() {
        // 2026-05-03 is a Sunday; 4th and 5th are holidays already.
        assert_eq!(d(2026, 5, 3).weekday(), Weekday::Sun);
        assert!(is_national_holiday(d(2026, 5, 6)));
        assert!(!is_national_holiday(d(2026, 5, 7)));
    }

    #[test]
    fn test_citizens_holiday_in_september() {
        // Respect for the Aged Day (21st) and the equinox (23rd) sandwich the 22nd.
        assert!(is_national_holiday(d(2026, 9, 21)));
        assert!(is_national_holiday(d(2026, 9, 22)));
    }

    #[test]
    fn test_extra_dates() {
        let cal = JapaneseHolidays::with_extra([d(2026, 12, 29)]);
        assert!(cal.is_holiday(d(2026, 12, 29)));
        assert!(!cal.is_holiday(d(2026, 12, 28)));
        assert!(cal.is_holiday(d(2026, 1, 1)));
    }
}
