//! Configuration schema. Every field has a serde default so partial files load.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub safety: SafetySection,
    #[serde(default)]
    pub timing: TimingSection,
    #[serde(default)]
    pub limits: LimitsSection,
    #[serde(default)]
    pub quota: QuotaSection,
    #[serde(default)]
    pub holidays: HolidaysSection,
    /// IANA timezone the booking sites operate in; decides what "today" is.
    #[serde(default = "default_timezone")]
    pub timezone: String,
    /// Status strings that mean a slot may free up soon (cancellation queue etc.).
    #[serde(default = "default_contested_markers")]
    pub contested_markers: Vec<String>,
    /// Booking failure messages that are expected and not worth a notification.
    #[serde(default = "default_routine_rejections")]
    pub routine_rejections: Vec<String>,
    /// Site id -> base URL for sites driven by the JSON API adapter.
    #[serde(default)]
    pub sites: BTreeMap<String, SiteConfig>,
    #[serde(default)]
    pub notify: NotifySection,
    /// Override for the data directory (store file lives here).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            safety: SafetySection::default(),
            timing: TimingSection::default(),
            limits: LimitsSection::default(),
            quota: QuotaSection::default(),
            holidays: HolidaysSection::default(),
            timezone: default_timezone(),
            contested_markers: default_contested_markers(),
            routine_rejections: default_routine_rejections(),
            sites: BTreeMap::new(),
            notify: NotifySection::default(),
            data_dir: None,
        }
    }
}

impl Config {
    /// The configured timezone, falling back to Asia/Tokyo when unparsable.
    pub fn tz(&self) -> chrono_tz::Tz {
        self.timezone.parse().unwrap_or(chrono_tz::Asia::Tokyo)
    }
}

fn default_timezone() -> String {
    "Asia/Tokyo".to_string()
}

fn default_contested_markers() -> Vec<String> {
    vec![
        "キャンセル待ち".to_string(),
        "cancel_waiting".to_string(),
        "waitlist".to_string(),
    ]
}

fn default_routine_rejections() -> Vec<String> {
    vec![
        "already full".to_string(),
        "満員".to_string(),
        "予約済".to_string(),
        "受付終了".to_string(),
    ]
}

/// Platform-wide safety switches.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SafetySection {
    /// Platform-wide kill switch for real reservation requests.
    #[serde(default)]
    pub platform_execution_enabled: bool,
    /// Regexes matched against request URLs to spot booking confirmations.
    #[serde(default = "default_booking_patterns")]
    pub booking_url_patterns: Vec<String>,
}

impl Default for SafetySection {
    fn default() -> Self {
        Self {
            platform_execution_enabled: false,
            booking_url_patterns: default_booking_patterns(),
        }
    }
}

fn default_booking_patterns() -> Vec<String> {
    vec![
        r"(?i)/(reserve|reservation|booking)s?/(confirm|commit|complete)".to_string(),
        r"(?i)[?&]action=(confirm|commit)".to_string(),
    ]
}

/// Polling cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimingSection {
    #[serde(default = "default_wide_interval")]
    pub wide_interval_secs: u64,
    #[serde(default = "default_hot_interval")]
    pub hot_interval_secs: u64,
    #[serde(default = "default_hot_duration")]
    pub hot_duration_secs: u64,
    /// Delay before retrying a wake that found the agent busy.
    #[serde(default = "default_busy_retry")]
    pub busy_retry_secs: u64,
    /// Delay before retrying after an unexpected tick error.
    #[serde(default = "default_error_retry")]
    pub error_retry_secs: u64,
    /// Facility checks dispatched in parallel per batch.
    #[serde(default = "default_check_concurrency")]
    pub check_concurrency: usize,
}

impl Default for TimingSection {
    fn default() -> Self {
        Self {
            wide_interval_secs: default_wide_interval(),
            hot_interval_secs: default_hot_interval(),
            hot_duration_secs: default_hot_duration(),
            busy_retry_secs: default_busy_retry(),
            error_retry_secs: default_error_retry(),
            check_concurrency: default_check_concurrency(),
        }
    }
}

fn default_wide_interval() -> u64 {
    60
}

fn default_hot_interval() -> u64 {
    1
}

fn default_hot_duration() -> u64 {
    600
}

fn default_busy_retry() -> u64 {
    5
}

fn default_error_retry() -> u64 {
    30
}

fn default_check_concurrency() -> usize {
    3
}

/// Gateway self-protection limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LimitsSection {
    #[serde(default = "default_rate_limit")]
    pub rate_limit_per_minute: u32,
    #[serde(default = "default_breaker_cooldown")]
    pub breaker_cooldown_secs: u64,
}

impl Default for LimitsSection {
    fn default() -> Self {
        Self {
            rate_limit_per_minute: default_rate_limit(),
            breaker_cooldown_secs: default_breaker_cooldown(),
        }
    }
}

fn default_rate_limit() -> u32 {
    60
}

fn default_breaker_cooldown() -> u64 {
    300
}

/// Per-user booking caps. `None` means unlimited.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weekly_cap: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monthly_cap: Option<u32>,
}

/// Extra closure days on top of the national holiday calendar.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HolidaysSection {
    #[serde(default)]
    pub extra_dates: Vec<NaiveDate>,
}

/// A site driven by the JSON API adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SiteConfig {
    pub base_url: String,
}

/// Notification delivery.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotifySection {
    /// POST target for notifications; logged only when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: Config = serde_json::from_str(
            r#"{"timing": {"wideIntervalSecs": 120}, "quota": {"weeklyCap": 2}}"#,
        )
        .unwrap();
        assert_eq!(config.timing.wide_interval_secs, 120);
        assert_eq!(config.timing.hot_interval_secs, 1);
        assert_eq!(config.timing.check_concurrency, 3);
        assert_eq!(config.limits.rate_limit_per_minute, 60);
        assert_eq!(config.limits.breaker_cooldown_secs, 300);
        assert_eq!(config.quota.weekly_cap, Some(2));
        assert_eq!(config.quota.monthly_cap, None);
        assert!(!config.safety.platform_execution_enabled);
        assert_eq!(config.tz(), chrono_tz::Asia::Tokyo);
    }

    #[test]
    fn test_config_roundtrips_camel_case() {
        let config = Config::default();
        let json = serde_json::to_value(&config).unwrap();
        assert!(json["safety"].get("platformExecutionEnabled").is_some());
        assert!(json["timing"].get("hotDurationSecs").is_some());
    }
}
