//! Monitoring targets and their expansion into check items.

pub mod expander;
pub mod holidays;
pub mod types;

pub use expander::{expand_target, target_has_expired, MAX_HORIZON_DAYS};
pub use holidays::{HolidayCalendar, JapaneseHolidays};
pub use types::{
    BookedSlot, BookingStrategy, CheckItem, DateSpec, HolidayPolicy, MonitoringTarget,
    TargetStatus,
};
