//! Per-agent safety configuration and the gateway's persisted counters.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Width of the rolling rate-limit window, in seconds.
pub const RATE_WINDOW_SECS: i64 = 60;

/// One booking the allow-list lets through, until `expires_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllowedTarget {
    pub facility_id: String,
    pub date: NaiveDate,
    pub time_slot: String,
    pub expires_at: DateTime<Utc>,
}

/// Safety switches for one agent. Only changed through [`SafetyConfig::apply`],
/// which bumps `version`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SafetyConfig {
    #[serde(default)]
    pub version: u64,
    /// Per-agent switch for real reservation requests.
    #[serde(default)]
    pub execution_enabled: bool,
    /// Answer every outbound call with a canned response.
    #[serde(default)]
    pub mock_mode: bool,
    #[serde(default)]
    pub allow_list: Vec<AllowedTarget>,
}

/// A typed change to [`SafetyConfig`]. `None` fields are left alone;
/// `allow_list` replaces the whole list.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SafetyPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mock_mode: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_list: Option<Vec<AllowedTarget>>,
}

impl SafetyConfig {
    /// Apply `patch` and bump the version. Returns whether anything changed.
    pub fn apply(&mut self, patch: SafetyPatch) -> bool {
        let before = self.clone();
        if let Some(enabled) = patch.execution_enabled {
            self.execution_enabled = enabled;
        }
        if let Some(mock) = patch.mock_mode {
            self.mock_mode = mock;
        }
        if let Some(list) = patch.allow_list {
            self.allow_list = list;
        }
        self.version = before.version + 1;
        let mut unchanged = before;
        unchanged.version = self.version;
        unchanged != *self
    }

    /// Whether a live allow-list entry covers this booking.
    pub fn is_allowed(
        &self,
        facility_id: &str,
        date: NaiveDate,
        time_slot: &str,
        now: DateTime<Utc>,
    ) -> bool {
        self.allow_list.iter().any(|a| {
            a.facility_id == facility_id
                && a.date == date
                && a.time_slot == time_slot
                && now < a.expires_at
        })
    }

    pub fn prune(&mut self, now: DateTime<Utc>) {
        self.allow_list.retain(|a| now < a.expires_at);
    }
}

/// Everything the gateway remembers between calls; persisted with the agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayState {
    /// Requests per unix second.
    #[serde(default)]
    pub rate_counter: BTreeMap<i64, u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub breaker_open_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub safety: SafetyConfig,
}

impl GatewayState {
    /// Drop rate buckets outside the window and expired allow-list entries.
    pub fn prune(&mut self, now: DateTime<Utc>) {
        let floor = now.timestamp() - RATE_WINDOW_SECS;
        self.rate_counter.retain(|sec, _| *sec > floor);
        self.safety.prune(now);
    }

    /// Requests counted in the trailing window ending at `now`.
    pub fn requests_in_window(&self, now: DateTime<Utc>) -> u32 {
        let floor = now.timestamp() - RATE_WINDOW_SECS;
        self.rate_counter
            .range(floor + 1..)
            .map(|(_, count)| *count)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn entry(expires_at: DateTime<Utc>) -> AllowedTarget {
        AllowedTarget {
            facility_id: "court-1".to_string(),
            date: NaiveDate::from_ymd_opt(2026, 11, 7).unwrap(),
            time_slot: "09:00".to_string(),
            expires_at,
        }
    }

    #[test]
    fn test_apply_bumps_version() {
        let mut config = SafetyConfig::default();
        let changed = config.apply(SafetyPatch {
            execution_enabled: Some(true),
            ..Default::default()
        });
        assert!(changed);
        assert_eq!(config.version, 1);
        assert!(config.execution_enabled);
        assert!(!config.mock_mode);

        let changed = config.apply(SafetyPatch::default());
        assert!(!changed);
        assert_eq!(config.version, 2);
    }

    #[test]
    fn test_allow_list_expiry() {
        let now = Utc::now();
        let mut config = SafetyConfig {
            allow_list: vec![entry(now + Duration::hours(1)), entry(now - Duration::hours(1))],
            ..Default::default()
        };
        let date = NaiveDate::from_ymd_opt(2026, 11, 7).unwrap();
        assert!(config.is_allowed("court-1", date, "09:00", now));
        assert!(!config.is_allowed("court-1", date, "11:00", now));
        assert!(!config.is_allowed("court-1", date, "09:00", now + Duration::hours(2)));

        config.prune(now);
        assert_eq!(config.allow_list.len(), 1);
    }

    #[test]
    fn test_prune_keeps_trailing_minute() {
        let now = Utc::now();
        let sec = now.timestamp();
        let mut state = GatewayState::default();
        state.rate_counter.insert(sec - 120, 5);
        state.rate_counter.insert(sec - 60, 5);
        state.rate_counter.insert(sec - 59, 2);
        state.rate_counter.insert(sec, 3);
        assert_eq!(state.requests_in_window(now), 5);

        state.prune(now);
        assert_eq!(state.rate_counter.len(), 2);
    }
}
