//! Safety-guarded HTTP gateway.
//!
//! Every outbound call an agent makes passes through [`Gateway::send`], which
//! applies, in order: the circuit breaker, the rolling rate limit, the
//! reservation kill switches, and the mock short-circuit. Only a request that
//! clears all four reaches the real transport.

pub mod http;
pub mod mock;
pub mod safety;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::schema::Config;
use crate::error::{ConfigError, GatewayError};
use crate::metrics::{names, MetricsSink};

pub use http::{HttpClient, HttpRequest, HttpResponse, Method, ReqwestTransport};
pub use mock::RemoteAction;
pub use safety::{AllowedTarget, GatewayState, SafetyConfig, SafetyPatch};

/// Platform-level limits shared by every gateway.
#[derive(Debug, Clone)]
pub struct GatewayPolicy {
    /// Platform-wide switch; booking calls also need the agent's own switch.
    pub platform_execution_enabled: bool,
    pub booking_patterns: Vec<Regex>,
    pub rate_limit_per_minute: u32,
    pub breaker_cooldown: chrono::Duration,
}

impl GatewayPolicy {
    /// Build the policy, refusing booking patterns that would let a booking
    /// call slip past the kill switches.
    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let booking_patterns = config
            .safety
            .booking_url_patterns
            .iter()
            .map(|p| {
                Regex::new(p).map_err(|source| ConfigError::BookingPattern {
                    pattern: p.clone(),
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        if booking_patterns.is_empty() {
            return Err(ConfigError::NoBookingPatterns);
        }
        Ok(Self {
            platform_execution_enabled: config.safety.platform_execution_enabled,
            booking_patterns,
            rate_limit_per_minute: config.limits.rate_limit_per_minute,
            breaker_cooldown: chrono::Duration::seconds(config.limits.breaker_cooldown_secs as i64),
        })
    }
}

/// One agent's guarded HTTP client.
pub struct Gateway {
    label: String,
    transport: Arc<dyn HttpClient>,
    policy: GatewayPolicy,
    state: Mutex<GatewayState>,
    metrics: Arc<dyn MetricsSink>,
}

impl Gateway {
    /// Create a gateway resuming from a persisted `state`.
    pub fn new(
        label: &str,
        transport: Arc<dyn HttpClient>,
        policy: GatewayPolicy,
        state: GatewayState,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            label: label.to_string(),
            transport,
            policy,
            state: Mutex::new(state),
            metrics,
        }
    }

    /// Pruned copy of the current state, ready to persist.
    pub async fn export_state(&self) -> GatewayState {
        let mut state = self.state.lock().await;
        state.prune(Utc::now());
        state.clone()
    }

    pub async fn safety(&self) -> SafetyConfig {
        self.state.lock().await.safety.clone()
    }

    /// Apply a safety patch and return the new configuration.
    pub async fn apply_safety(&self, patch: SafetyPatch) -> SafetyConfig {
        let mut state = self.state.lock().await;
        let changed = state.safety.apply(patch);
        let safety = state.safety.clone();
        info!(
            "Gateway[{}]: safety v{} execution={} mock={} allow_list={}{}",
            self.label,
            safety.version,
            safety.execution_enabled,
            safety.mock_mode,
            safety.allow_list.len(),
            if changed { "" } else { " (unchanged)" }
        );
        safety
    }

    /// Replace the whole state with one written by another process.
    pub async fn restore(&self, state: GatewayState) {
        *self.state.lock().await = state;
    }

    /// Forget counters and the breaker, keeping nothing but defaults.
    pub async fn reset(&self) {
        *self.state.lock().await = GatewayState::default();
    }

    pub async fn breaker_open_until(&self) -> Option<DateTime<Utc>> {
        self.state.lock().await.breaker_open_until
    }

    pub fn platform_execution_enabled(&self) -> bool {
        self.policy.platform_execution_enabled
    }

    /// Run the guard stack for `request`. Returns the mocked response when mock
    /// mode answers it, `None` when the request may go to the network.
    async fn guard(&self, request: &HttpRequest) -> Result<Option<HttpResponse>, GatewayError> {
        let now = Utc::now();
        let mut state = self.state.lock().await;

        // 1. Circuit breaker: an open breaker costs nothing against the rate budget.
        if let Some(until) = state.breaker_open_until {
            if now < until {
                self.metrics.incr(names::BREAKER_REJECTIONS);
                return Err(GatewayError::CircuitOpen { until });
            }
            info!("Gateway[{}]: circuit breaker closed", self.label);
            state.breaker_open_until = None;
        }

        // 2. Rolling rate limit.
        *state.rate_counter.entry(now.timestamp()).or_insert(0) += 1;
        state.prune(now);
        let count = state.requests_in_window(now);
        if count > self.policy.rate_limit_per_minute {
            let until = now + self.policy.breaker_cooldown;
            state.breaker_open_until = Some(until);
            self.metrics.incr(names::BREAKER_TRIPS);
            warn!(
                "Gateway[{}]: {} requests in the last minute, circuit open until {}",
                self.label, count, until
            );
            return Err(GatewayError::RateLimited { count });
        }

        // 3. Reservation-confirming calls need both kill switches on.
        let action = RemoteAction::classify(&request.url, &self.policy.booking_patterns);
        if action == RemoteAction::Reservation {
            if !self.policy.platform_execution_enabled {
                self.metrics.incr(names::GATEWAY_SAFETY_BLOCKS);
                warn!("Gateway[{}]: booking blocked (platform switch off)", self.label);
                return Err(GatewayError::SafetyBlocked(
                    "reservation execution is disabled platform-wide".to_string(),
                ));
            }
            if !state.safety.execution_enabled {
                self.metrics.incr(names::GATEWAY_SAFETY_BLOCKS);
                warn!("Gateway[{}]: booking blocked (agent switch off)", self.label);
                return Err(GatewayError::SafetyBlocked(
                    "reservation execution is disabled for this agent".to_string(),
                ));
            }
        }

        // 4. Mock short-circuit.
        if state.safety.mock_mode {
            self.metrics.incr(names::GATEWAY_MOCKED);
            debug!("Gateway[{}]: mock {:?} {}", self.label, action, request.url);
            return Ok(Some(mock::canned_response(action, request)));
        }

        Ok(None)
    }
}

#[async_trait]
impl HttpClient for Gateway {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, GatewayError> {
        if let Some(mocked) = self.guard(&request).await? {
            return Ok(mocked);
        }
        self.metrics.incr(names::GATEWAY_REQUESTS);
        debug!("Gateway[{}]: {:?} {}", self.label, request.method, request.url);
        self.transport.send(request).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::metrics::InMemoryMetrics;

    /// Transport that counts calls and answers 200 with `{}`.
    #[derive(Default)]
    pub(crate) struct CountingTransport {
        pub calls: AtomicUsize,
    }

    #[async_trait]
    impl HttpClient for CountingTransport {
        async fn send(&self, _request: HttpRequest) -> Result<HttpResponse, GatewayError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(HttpResponse {
                status: 200,
                headers: Default::default(),
                body: "{}".to_string(),
            })
        }
    }

    fn policy(platform: bool) -> GatewayPolicy {
        let mut config = Config::default();
        config.safety.platform_execution_enabled = platform;
        GatewayPolicy::from_config(&config).unwrap()
    }

    fn gateway(
        platform: bool,
        safety: SafetyConfig,
    ) -> (Gateway, Arc<CountingTransport>, Arc<InMemoryMetrics>) {
        let transport = Arc::new(CountingTransport::default());
        let metrics = Arc::new(InMemoryMetrics::new());
        let state = GatewayState {
            safety,
            ..Default::default()
        };
        let gw = Gateway::new("u:s", transport.clone(), policy(platform), state, metrics.clone());
        (gw, transport, metrics)
    }

    const BOOK_URL: &str = "https://city.example/reserve/confirm";
    const CHECK_URL: &str = "https://city.example/api/availability";

    #[tokio::test]
    async fn test_sixty_first_call_trips_breaker() {
        let (gw, transport, metrics) = gateway(false, SafetyConfig::default());
        for _ in 0..60 {
            gw.send(HttpRequest::get(CHECK_URL)).await.unwrap();
        }
        let err = gw.send(HttpRequest::get(CHECK_URL)).await.unwrap_err();
        assert!(matches!(err, GatewayError::RateLimited { count: 61 }));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 60);
        assert_eq!(metrics.get(names::BREAKER_TRIPS), 1);

        let until = gw.breaker_open_until().await.unwrap();
        let cooldown = until - Utc::now();
        assert!(cooldown > chrono::Duration::seconds(290));
        assert!(cooldown <= chrono::Duration::seconds(300));
    }

    #[tokio::test]
    async fn test_open_breaker_does_not_count() {
        let (gw, transport, _) = gateway(false, SafetyConfig::default());
        {
            let mut state = gw.state.lock().await;
            state.breaker_open_until = Some(Utc::now() + chrono::Duration::minutes(5));
        }
        for _ in 0..3 {
            let err = gw.send(HttpRequest::get(CHECK_URL)).await.unwrap_err();
            assert!(matches!(err, GatewayError::CircuitOpen { .. }));
        }
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
        assert!(gw.export_state().await.rate_counter.is_empty());
    }

    #[tokio::test]
    async fn test_elapsed_breaker_closes() {
        let (gw, transport, _) = gateway(false, SafetyConfig::default());
        gw.state.lock().await.breaker_open_until = Some(Utc::now() - chrono::Duration::seconds(1));
        gw.send(HttpRequest::get(CHECK_URL)).await.unwrap();
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
        assert!(gw.breaker_open_until().await.is_none());
    }

    #[tokio::test]
    async fn test_booking_requires_both_switches() {
        for (platform, agent) in [(false, false), (true, false), (false, true)] {
            let safety = SafetyConfig {
                execution_enabled: agent,
                ..Default::default()
            };
            let (gw, transport, _) = gateway(platform, safety);
            let err = gw.send(HttpRequest::get(BOOK_URL)).await.unwrap_err();
            assert!(matches!(err, GatewayError::SafetyBlocked(_)));
            assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
        }

        let safety = SafetyConfig {
            execution_enabled: true,
            ..Default::default()
        };
        let (gw, transport, _) = gateway(true, safety);
        gw.send(HttpRequest::get(BOOK_URL)).await.unwrap();
        assert_eq!(transport.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_mock_mode_never_reaches_network() {
        let safety = SafetyConfig {
            execution_enabled: true,
            mock_mode: true,
            ..Default::default()
        };
        let (gw, transport, metrics) = gateway(true, safety);
        let resp = gw.send(HttpRequest::get(BOOK_URL)).await.unwrap();
        assert_eq!(resp.json().unwrap()["success"], true);
        gw.send(HttpRequest::get(CHECK_URL)).await.unwrap();
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
        assert_eq!(metrics.get(names::GATEWAY_MOCKED), 2);
        // Mocked calls still count against the rate limit.
        assert_eq!(gw.export_state().await.requests_in_window(Utc::now()), 2);
    }

    #[tokio::test]
    async fn test_mock_mode_still_blocks_unswitched_booking() {
        let safety = SafetyConfig {
            mock_mode: true,
            ..Default::default()
        };
        let (gw, _, _) = gateway(true, safety);
        let err = gw.send(HttpRequest::get(BOOK_URL)).await.unwrap_err();
        assert!(matches!(err, GatewayError::SafetyBlocked(_)));
    }

    #[tokio::test]
    async fn test_apply_safety_versions() {
        let (gw, _, _) = gateway(true, SafetyConfig::default());
        let v1 = gw
            .apply_safety(SafetyPatch {
                mock_mode: Some(true),
                ..Default::default()
            })
            .await;
        assert_eq!(v1.version, 1);
        assert!(v1.mock_mode);
        assert!(gw.safety().await.mock_mode);
    }

    #[test]
    fn test_policy_rejects_unusable_booking_patterns() {
        let mut config = Config::default();
        config.safety.booking_url_patterns = vec!["(reserve/confirm".to_string()];
        assert!(matches!(
            GatewayPolicy::from_config(&config),
            Err(ConfigError::BookingPattern { .. })
        ));

        config.safety.booking_url_patterns.clear();
        assert!(matches!(
            GatewayPolicy::from_config(&config),
            Err(ConfigError::NoBookingPatterns)
        ));
    }
}
