//! Monitoring target types: date specifications, filters, and status.

use chrono::{DateTime, NaiveDate, Utc, Weekday};
use serde::{Deserialize, Serialize};

/// Which days a target covers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum DateSpec {
    /// One specific day.
    Single { date: NaiveDate },
    /// Every day between `start` and `end`, inclusive.
    Range { start: NaiveDate, end: NaiveDate },
    /// Every day from tomorrow up to `horizon_days` ahead of today.
    Continuous { horizon_days: u32 },
}

/// How public holidays interact with the candidate dates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HolidayPolicy {
    #[default]
    Include,
    Exclude,
    /// Keep holidays only; the weekday filter is ignored.
    Only,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetStatus {
    #[default]
    Active,
    Paused,
    /// A slot opened and the user was told; waiting for them to act.
    Detected,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStrategy {
    /// Reserve every open slot.
    All,
    /// Reserve only the first open slot, in slot order.
    #[default]
    FirstMatch,
}

/// A (date, slot) pair that has already been reserved for a target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookedSlot {
    pub date: NaiveDate,
    pub time_slot: String,
}

/// A user's standing instruction to watch one facility.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitoringTarget {
    pub id: String,
    pub user_id: String,
    pub site_id: String,
    pub facility_id: String,
    #[serde(default)]
    pub facility_name: String,
    pub date_spec: DateSpec,
    pub time_slots: Vec<String>,
    /// Empty or absent means every weekday.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weekdays: Option<Vec<Weekday>>,
    #[serde(default)]
    pub holiday_policy: HolidayPolicy,
    /// Higher values are checked and booked first.
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub status: TargetStatus,
    #[serde(default)]
    pub auto_book: bool,
    #[serde(default)]
    pub strategy: BookingStrategy,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default)]
    pub booked: Vec<BookedSlot>,
    /// Site-specific booking options passed through to the adapter.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub options: serde_json::Value,
}

impl MonitoringTarget {
    /// Create an active, notify-only target with default filters.
    pub fn new(
        id: &str,
        user_id: &str,
        site_id: &str,
        facility_id: &str,
        date_spec: DateSpec,
        time_slots: Vec<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.to_string(),
            user_id: user_id.to_string(),
            site_id: site_id.to_string(),
            facility_id: facility_id.to_string(),
            facility_name: String::new(),
            date_spec,
            time_slots,
            weekdays: None,
            holiday_policy: HolidayPolicy::Include,
            priority: 0,
            status: TargetStatus::Active,
            auto_book: false,
            strategy: BookingStrategy::FirstMatch,
            created_at: now,
            updated_at: now,
            last_error: None,
            booked: Vec::new(),
            options: serde_json::Value::Null,
        }
    }

    /// Reject targets the expander cannot cover sensibly.
    pub fn validate(&self) -> Result<(), String> {
        match &self.date_spec {
            DateSpec::Continuous { horizon_days } if *horizon_days > super::MAX_HORIZON_DAYS => {
                return Err(format!(
                    "target '{}': horizonDays {} exceeds the maximum of {}",
                    self.id,
                    horizon_days,
                    super::MAX_HORIZON_DAYS
                ));
            }
            DateSpec::Range { start, end } if start > end => {
                return Err(format!("target '{}': range starts after it ends", self.id));
            }
            _ => {}
        }
        if self.time_slots.is_empty() {
            return Err(format!("target '{}' has no time slots", self.id));
        }
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        self.status == TargetStatus::Active
    }

    /// Whether `date`/`time_slot` has already been reserved for this target.
    pub fn has_booked(&self, date: NaiveDate, time_slot: &str) -> bool {
        self.booked
            .iter()
            .any(|b| b.date == date && b.time_slot == time_slot)
    }

    /// Change status and bump `updated_at`.
    pub fn set_status(&mut self, status: TargetStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}

/// One concrete thing to check on a tick.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckItem {
    pub date: NaiveDate,
    pub time_slot: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_deserializes_with_defaults() {
        let target: MonitoringTarget = serde_json::from_str(
            r#"{
                "id": "t1",
                "userId": "u1",
                "siteId": "city",
                "facilityId": "court-3",
                "dateSpec": {"kind": "range", "start": "2026-11-01", "end": "2026-11-07"},
                "timeSlots": ["09:00-11:00"],
                "weekdays": ["Sat", "Sun"]
            }"#,
        )
        .unwrap();
        assert_eq!(target.status, TargetStatus::Active);
        assert_eq!(target.holiday_policy, HolidayPolicy::Include);
        assert_eq!(target.strategy, BookingStrategy::FirstMatch);
        assert!(!target.auto_book);
        assert_eq!(target.weekdays, Some(vec![Weekday::Sat, Weekday::Sun]));
        assert!(target.booked.is_empty());
    }

    #[test]
    fn test_has_booked() {
        let mut target: MonitoringTarget = serde_json::from_str(
            r#"{"id":"t","userId":"u","siteId":"s","facilityId":"f",
                "dateSpec":{"kind":"continuous","horizonDays":14},"timeSlots":["a"]}"#,
        )
        .unwrap();
        let date = NaiveDate::from_ymd_opt(2026, 11, 2).unwrap();
        assert!(!target.has_booked(date, "a"));
        target.booked.push(BookedSlot {
            date,
            time_slot: "a".to_string(),
        });
        assert!(target.has_booked(date, "a"));
        assert!(!target.has_booked(date, "b"));
    }

    #[test]
    fn test_validate_rejects_oversized_horizon() {
        let mut target = MonitoringTarget::new(
            "t",
            "u",
            "s",
            "f",
            DateSpec::Continuous { horizon_days: 14 },
            vec!["a".to_string()],
        );
        assert!(target.validate().is_ok());
        target.date_spec = DateSpec::Continuous {
            horizon_days: u32::MAX,
        };
        assert!(target.validate().unwrap_err().contains("horizonDays"));
        target.date_spec = DateSpec::Continuous { horizon_days: 7 };
        target.time_slots.clear();
        assert!(target.validate().is_err());
    }
}
