//! Metrics sink injected into each component.

use std::collections::BTreeMap;
use std::sync::Mutex;

/// Counter names emitted by the agent's components.
pub mod names {
    pub const GATEWAY_REQUESTS: &str = "gateway_requests";
    pub const GATEWAY_MOCKED: &str = "gateway_mocked";
    pub const GATEWAY_SAFETY_BLOCKS: &str = "gateway_safety_blocks";
    pub const BREAKER_TRIPS: &str = "breaker_trips";
    pub const BREAKER_REJECTIONS: &str = "breaker_rejections";
    pub const LOGINS: &str = "logins";
    pub const LOGIN_FAILURES: &str = "login_failures";
    pub const SESSION_CACHE_HITS: &str = "session_cache_hits";
    pub const CHECKS: &str = "checks";
    pub const DETECTIONS: &str = "detections";
    pub const BOOKINGS: &str = "bookings";
    pub const BOOKING_FAILURES: &str = "booking_failures";
    pub const TICKS: &str = "ticks";
    pub const TICK_ERRORS: &str = "tick_errors";
}

/// Receives counter increments.
pub trait MetricsSink: Send + Sync {
    fn incr(&self, name: &'static str);
}

/// Discards everything.
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn incr(&self, _name: &'static str) {}
}

/// Keeps counters in memory; used for diagnostics and in tests.
#[derive(Default)]
pub struct InMemoryMetrics {
    counters: Mutex<BTreeMap<&'static str, u64>>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of a counter.
    pub fn get(&self, name: &str) -> u64 {
        self.counters
            .lock()
            .map(|c| c.get(name).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// All counters as a JSON object.
    pub fn snapshot(&self) -> serde_json::Value {
        let counters = match self.counters.lock() {
            Ok(c) => c.clone(),
            Err(_) => BTreeMap::new(),
        };
        serde_json::json!(counters)
    }
}

impl MetricsSink for InMemoryMetrics {
    fn incr(&self, name: &'static str) {
        if let Ok(mut counters) = self.counters.lock() {
            *counters.entry(name).or_insert(0) += 1;
        }
    }
}
