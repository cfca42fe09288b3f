//! Persisted agent state and the monitoring mode derived from it.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::gateway::GatewayState;
use crate::site::Credentials;
use crate::target::MonitoringTarget;

/// Which polling tier the agent is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorMode {
    /// No active targets; no alarm armed.
    Idle,
    Wide,
    Hot,
}

/// The slot that put the agent into hot monitoring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HotState {
    pub target_id: String,
    pub date: NaiveDate,
    pub time_slot: String,
    pub started_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
}

/// What the last tick did, for diagnostics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TickSummary {
    pub at: Option<DateTime<Utc>>,
    pub checked: usize,
    pub available: usize,
    pub booked: usize,
    pub errors: usize,
    /// Set when the tick did not run its checks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skipped: Option<String>,
}

/// Everything one (user, site) agent keeps across restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentState {
    pub user_id: String,
    pub site_id: String,
    #[serde(default)]
    pub targets: Vec<MonitoringTarget>,
    #[serde(default)]
    pub credentials: Credentials,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hot: Option<HotState>,
    /// Rate counter, breaker, and safety configuration.
    #[serde(default)]
    pub gateway: GatewayState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_alarm: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_tick: Option<TickSummary>,
    /// Bumped by every control change; a higher stored value wins over
    /// whatever a running agent holds in memory.
    #[serde(default)]
    pub revision: u64,
}

impl AgentState {
    /// Create an empty state for a new agent.
    pub fn new(user_id: &str, site_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            site_id: site_id.to_string(),
            targets: Vec::new(),
            credentials: Credentials::default(),
            hot: None,
            gateway: GatewayState::default(),
            next_alarm: None,
            last_tick: None,
            revision: 0,
        }
    }

    pub fn has_active_targets(&self) -> bool {
        self.targets.iter().any(|t| t.is_active())
    }

    /// Indices of active targets, highest priority first (stable for ties).
    pub fn active_by_priority(&self) -> Vec<usize> {
        let mut indices: Vec<usize> = (0..self.targets.len())
            .filter(|&i| self.targets[i].is_active())
            .collect();
        indices.sort_by(|&a, &b| self.targets[b].priority.cmp(&self.targets[a].priority));
        indices
    }

    pub fn mode(&self) -> MonitorMode {
        if self.next_alarm.is_none() || !self.has_active_targets() {
            MonitorMode::Idle
        } else if self.hot.is_some() {
            MonitorMode::Hot
        } else {
            MonitorMode::Wide
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::{DateSpec, TargetStatus};

    fn target(id: &str, priority: i32) -> MonitoringTarget {
        let mut t = MonitoringTarget::new(
            id,
            "u1",
            "city",
            "court-1",
            DateSpec::Continuous { horizon_days: 7 },
            vec!["09:00".to_string()],
        );
        t.priority = priority;
        t
    }

    #[test]
    fn test_active_by_priority() {
        let mut state = AgentState::new("u1", "city");
        state.targets = vec![target("low", 0), target("high", 5), target("mid", 2)];
        state.targets[2].status = TargetStatus::Paused;
        let order: Vec<&str> = state
            .active_by_priority()
            .into_iter()
            .map(|i| state.targets[i].id.as_str())
            .collect();
        assert_eq!(order, vec!["high", "low"]);
    }

    #[test]
    fn test_mode() {
        let mut state = AgentState::new("u1", "city");
        assert_eq!(state.mode(), MonitorMode::Idle);
        state.targets.push(target("t1", 0));
        state.next_alarm = Some(Utc::now());
        assert_eq!(state.mode(), MonitorMode::Wide);
        state.hot = Some(HotState {
            target_id: "t1".to_string(),
            date: Utc::now().date_naive(),
            time_slot: "09:00".to_string(),
            started_at: Utc::now(),
            deadline: Utc::now(),
        });
        assert_eq!(state.mode(), MonitorMode::Hot);
    }

    #[test]
    fn test_state_round_trips_without_password_loss() {
        let mut state = AgentState::new("u1", "city");
        state.credentials.username = "taro".to_string();
        state.credentials.password = "pw".to_string();
        let raw = serde_json::to_string(&state).unwrap();
        let back: AgentState = serde_json::from_str(&raw).unwrap();
        assert_eq!(back.credentials.password, "pw");
        assert!(raw.contains("\"userId\":\"u1\""));
    }
}
