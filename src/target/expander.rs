//! Expands a monitoring target into the concrete (date, slot) items to check.
//!
//! Pure and uncached: "tomorrow" and the rolling horizon move every day, so the
//! scheduler calls this fresh on each tick.

use chrono::{Datelike, Duration, NaiveDate};

use super::holidays::HolidayCalendar;
use super::types::{CheckItem, DateSpec, HolidayPolicy, MonitoringTarget};

/// Longest rolling horizon a continuous target may cover.
pub const MAX_HORIZON_DAYS: u32 = 366;

/// Expand `target` relative to `today`.
///
/// Dates come out in chronological order, slots in their configured order, and
/// each (date, slot) pair appears once.
pub fn expand_target(
    target: &MonitoringTarget,
    today: NaiveDate,
    calendar: &dyn HolidayCalendar,
) -> Vec<CheckItem> {
    let weekdays = target.weekdays.as_deref().unwrap_or(&[]);

    let dates: Vec<NaiveDate> = candidate_dates(&target.date_spec, today)
        .into_iter()
        .filter(|date| {
            let holiday = calendar.is_holiday(*date);
            match target.holiday_policy {
                HolidayPolicy::Only => holiday,
                HolidayPolicy::Exclude if holiday => false,
                _ => weekdays.is_empty() || weekdays.contains(&date.weekday()),
            }
        })
        .collect();

    let mut slots: Vec<&String> = Vec::with_capacity(target.time_slots.len());
    for slot in &target.time_slots {
        if !slots.contains(&slot) {
            slots.push(slot);
        }
    }

    let mut items = Vec::with_capacity(dates.len() * slots.len());
    for date in dates {
        for slot in &slots {
            items.push(CheckItem {
                date,
                time_slot: (*slot).clone(),
            });
        }
    }
    items
}

/// Raw candidate dates for a spec, before any filtering.
fn candidate_dates(spec: &DateSpec, today: NaiveDate) -> Vec<NaiveDate> {
    match spec {
        DateSpec::Single { date } => vec![*date],
        DateSpec::Range { start, end } => days_between(*start, *end),
        DateSpec::Continuous { horizon_days } => {
            let days = (*horizon_days).min(MAX_HORIZON_DAYS);
            match (
                today.checked_add_signed(Duration::days(1)),
                today.checked_add_signed(Duration::days(i64::from(days))),
            ) {
                (Some(tomorrow), Some(horizon)) => days_between(tomorrow, horizon),
                _ => Vec::new(),
            }
        }
    }
}

fn days_between(start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
    start.iter_days().take_while(|d| *d <= end).collect()
}

/// True once every date the target could ever cover lies before `today`.
pub fn target_has_expired(target: &MonitoringTarget, today: NaiveDate) -> bool {
    match &target.date_spec {
        DateSpec::Single { date } => *date < today,
        DateSpec::Range { end, .. } => *end < today,
        DateSpec::Continuous { .. } => false,
    }
}
