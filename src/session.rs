//! Login session cache with cross-instance login deduplication.
//!
//! Sessions are cached in the shared store. Refreshing one takes the advisory
//! lock `login:{user}:{site}` and re-reads the cache after acquiring it, so a
//! burst of callers that all find a stale session produce a single login.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::backoff::{BackoffTracker, RetryStatus};
use crate::error::{SessionError, SiteError, StoreError};
use crate::gateway::HttpClient;
use crate::lock::AdvisoryLock;
use crate::metrics::{names, MetricsSink};
use crate::notify::{self, Notification, NotificationKind, Notifier};
use crate::site::{Credentials, SiteAdapter};
use crate::store::{self, KvStore};

/// Cached sessions younger than this are used without logging in.
pub const SESSION_FRESHNESS: chrono::Duration = chrono::Duration::minutes(30);

/// A forced refresh still reuses a session created this recently.
pub const FORCE_REFRESH_GRACE: chrono::Duration = chrono::Duration::seconds(60);

/// Store lifetime of a cached session.
pub const SESSION_TTL: Duration = Duration::from_secs(24 * 3600);

/// Consecutive credential rejections before login halts. One: the first
/// rejection halts until an explicit resume.
pub const LOGIN_HALT_THRESHOLD: u32 = 1;

/// `last_used` is rewritten at most this often.
const TOUCH_INTERVAL: chrono::Duration = chrono::Duration::seconds(60);

const LOCK_RETRIES: u32 = 50;
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(100);
const BACKOFF_BASE: Duration = Duration::from_secs(60);
const BACKOFF_MAX: Duration = Duration::from_secs(6 * 3600);

/// Cached login artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub token: String,
    /// Site-specific login context, if the adapter needs one for booking.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    #[serde(default = "default_true")]
    pub valid: bool,
}

fn default_true() -> bool {
    true
}

impl SessionRecord {
    pub fn new(token: String, context: Option<serde_json::Value>) -> Self {
        let now = Utc::now();
        Self {
            token,
            context,
            created_at: now,
            last_used: now,
            valid: true,
        }
    }

    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.created_at
    }
}

/// Consecutive login failures and the halt they led to.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginFailureRecord {
    pub failures: u32,
    pub last_failure_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub halted_until: Option<DateTime<Utc>>,
    pub reason: String,
}

impl LoginFailureRecord {
    pub fn is_halted(&self, now: DateTime<Utc>) -> bool {
        self.halted_until.map_or(false, |until| now < until)
    }
}

/// Obtains and caches the login session for one (user, site).
pub struct SessionManager {
    user_id: String,
    site_id: String,
    store: Arc<dyn KvStore>,
    adapter: Arc<dyn SiteAdapter>,
    client: Arc<dyn HttpClient>,
    credentials: RwLock<Credentials>,
    notifier: Arc<dyn Notifier>,
    metrics: Arc<dyn MetricsSink>,
    backoff: Option<BackoffTracker>,
}

impl SessionManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        user_id: &str,
        site_id: &str,
        store: Arc<dyn KvStore>,
        adapter: Arc<dyn SiteAdapter>,
        client: Arc<dyn HttpClient>,
        credentials: Credentials,
        notifier: Arc<dyn Notifier>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            user_id: user_id.to_string(),
            site_id: site_id.to_string(),
            store,
            adapter,
            client,
            credentials: RwLock::new(credentials),
            notifier,
            metrics,
            backoff: None,
        }
    }

    /// Throttle login attempts with the backoff tracker. Used on paths outside
    /// the agent, which has its own stricter halt.
    pub fn with_backoff(mut self, tracker: BackoffTracker) -> Self {
        self.backoff = Some(tracker);
        self
    }

    fn session_key(&self) -> String {
        store::session_key(&self.user_id, &self.site_id)
    }

    fn halt_key(&self) -> String {
        store::login_halt_key(&self.user_id, &self.site_id)
    }

    fn backoff_key(&self) -> String {
        store::backoff_key(&self.user_id, &self.site_id)
    }

    pub async fn set_credentials(&self, credentials: Credentials) {
        *self.credentials.write().await = credentials;
    }

    pub async fn credentials(&self) -> Credentials {
        self.credentials.read().await.clone()
    }

    /// The login failure record, if any.
    pub async fn failure_record(&self) -> Result<Option<LoginFailureRecord>, StoreError> {
        store::get_json(self.store.as_ref(), &self.halt_key()).await
    }

    /// Whether login is halted right now.
    pub async fn halted(&self) -> Result<Option<LoginFailureRecord>, StoreError> {
        let now = Utc::now();
        Ok(self.failure_record().await?.filter(|r| r.is_halted(now)))
    }

    /// Clear the halt so logins may be attempted again.
    pub async fn resume(&self) -> Result<(), StoreError> {
        self.store.delete(&self.halt_key()).await?;
        if let Some(tracker) = &self.backoff {
            tracker.record_success(&self.backoff_key()).await?;
        }
        info!("Session[{}:{}]: login resumed", self.user_id, self.site_id);
        Ok(())
    }

    /// Drop the cached session; the next call logs in again.
    pub async fn invalidate(&self) -> Result<(), StoreError> {
        self.store.delete(&self.session_key()).await
    }

    pub async fn cached(&self) -> Result<Option<SessionRecord>, StoreError> {
        store::get_json(self.store.as_ref(), &self.session_key()).await
    }

    /// Mark a cached session as used, keeping its original expiry.
    async fn touch(&self, mut session: SessionRecord) -> Result<SessionRecord, StoreError> {
        let now = Utc::now();
        if now - session.last_used < TOUCH_INTERVAL {
            return Ok(session);
        }
        session.last_used = now;
        let ttl = chrono::Duration::seconds(SESSION_TTL.as_secs() as i64);
        let expires_at = session.created_at + ttl;
        if let Ok(remaining) = (expires_at - now).to_std() {
            store::put_json(self.store.as_ref(), &self.session_key(), &session, Some(remaining))
                .await?;
        }
        Ok(session)
    }

    /// A cached session usable for this request, if there is one.
    async fn usable_cached(
        &self,
        force_refresh: bool,
    ) -> Result<Option<SessionRecord>, StoreError> {
        let now = Utc::now();
        let limit = if force_refresh {
            FORCE_REFRESH_GRACE
        } else {
            SESSION_FRESHNESS
        };
        match self.cached().await? {
            Some(session) if session.valid && session.age(now) < limit => {
                Ok(Some(self.touch(session).await?))
            }
            _ => Ok(None),
        }
    }

    /// Return a valid session, logging in if the cache cannot serve one.
    pub async fn get_session(&self, force_refresh: bool) -> Result<SessionRecord, SessionError> {
        if let Some(record) = self.halted().await? {
            return Err(SessionError::Halted {
                until: record.halted_until.unwrap_or(record.last_failure_at),
                reason: record.reason,
            });
        }

        if !force_refresh {
            if let Some(session) = self.usable_cached(false).await? {
                self.metrics.incr(names::SESSION_CACHE_HITS);
                return Ok(session);
            }
        }

        if let Some(tracker) = &self.backoff {
            let status = tracker.check_can_retry(&self.backoff_key()).await?;
            if let RetryStatus::Wait(remaining) = status {
                return Err(SessionError::BackingOff {
                    remaining_secs: remaining.num_seconds(),
                });
            }
        }

        let lock = AdvisoryLock::new(
            self.store.clone(),
            &format!("login:{}:{}", self.user_id, self.site_id),
        );
        if !lock.acquire(LOCK_RETRIES, LOCK_RETRY_DELAY).await? {
            // Whoever held the lock may have left us a session.
            if let Some(session) = self.usable_cached(force_refresh).await? {
                return Ok(session);
            }
            return Err(SessionError::LockTimeout);
        }

        let result = self.refresh_locked(force_refresh).await;
        if let Err(e) = lock.release().await {
            warn!(
                "Session[{}:{}]: failed to release login lock: {}",
                self.user_id, self.site_id, e
            );
        }
        result
    }

    /// Body of `get_session` once the login lock is held.
    async fn refresh_locked(&self, force_refresh: bool) -> Result<SessionRecord, SessionError> {
        if let Some(session) = self.usable_cached(force_refresh).await? {
            debug!(
                "Session[{}:{}]: another caller refreshed while we waited",
                self.user_id, self.site_id
            );
            self.metrics.incr(names::SESSION_CACHE_HITS);
            return Ok(session);
        }

        if let Some(record) = self.halted().await? {
            return Err(SessionError::Halted {
                until: record.halted_until.unwrap_or(record.last_failure_at),
                reason: record.reason,
            });
        }

        let credentials = self.credentials().await;
        self.metrics.incr(names::LOGINS);
        info!("Session[{}:{}]: logging in", self.user_id, self.site_id);

        match self.adapter.login(self.client.as_ref(), &credentials).await {
            Ok(Some(session)) => {
                let key = self.session_key();
                store::put_json(self.store.as_ref(), &key, &session, Some(SESSION_TTL)).await?;
                self.store.delete(&self.halt_key()).await?;
                if let Some(tracker) = &self.backoff {
                    tracker.record_success(&self.backoff_key()).await?;
                }
                Ok(session)
            }
            Ok(None) => {
                self.record_login_failure("the site rejected the saved credentials")
                    .await?;
                Err(SessionError::LoginRejected)
            }
            Err(e) => {
                warn!("Session[{}:{}]: login request failed: {}", self.user_id, self.site_id, e);
                if let Some(tracker) = &self.backoff {
                    if !matches!(e, SiteError::Gateway(_)) {
                        tracker
                            .record_failure(&self.backoff_key(), BACKOFF_BASE, BACKOFF_MAX)
                            .await?;
                    }
                }
                Err(SessionError::Site(e))
            }
        }
    }

    async fn record_login_failure(&self, reason: &str) -> Result<(), StoreError> {
        self.metrics.incr(names::LOGIN_FAILURES);
        let now = Utc::now();
        let previous = self.failure_record().await?;
        let failures = previous.map_or(0, |r| r.failures) + 1;
        let halted_until = if failures >= LOGIN_HALT_THRESHOLD {
            Some(now + chrono::Duration::days(36500))
        } else {
            None
        };
        let record = LoginFailureRecord {
            failures,
            last_failure_at: now,
            halted_until,
            reason: reason.to_string(),
        };
        store::put_json(self.store.as_ref(), &self.halt_key(), &record, None).await?;

        if let Some(tracker) = &self.backoff {
            tracker
                .record_failure(&self.backoff_key(), BACKOFF_BASE, BACKOFF_MAX)
                .await?;
        }

        if halted_until.is_some() {
            warn!(
                "Session[{}:{}]: login halted after {} failure(s): {}",
                self.user_id, self.site_id, failures, reason
            );
            notify::deliver(
                self.notifier.as_ref(),
                Notification::new(
                    &self.user_id,
                    &self.site_id,
                    NotificationKind::LoginHalted,
                    "Login stopped",
                    &format!(
                        "Logging in to {} failed ({}). Monitoring is paused until you \
                         update your credentials and resume.",
                        self.site_id, reason
                    ),
                ),
            )
            .await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::gateway::tests::CountingTransport;
    use crate::metrics::NoopMetrics;
    use crate::notify::tests::RecordingNotifier;
    use crate::site::base::tests::ScriptedSite;
    use crate::store::MemoryStore;

    struct Fixture {
        store: Arc<dyn KvStore>,
        site: Arc<ScriptedSite>,
        notifier: Arc<RecordingNotifier>,
    }

    impl Fixture {
        fn new(site: ScriptedSite) -> Self {
            Self {
                store: Arc::new(MemoryStore::new()),
                site: Arc::new(site),
                notifier: Arc::new(RecordingNotifier::default()),
            }
        }

        fn manager(&self, password: &str) -> SessionManager {
            SessionManager::new(
                "u1",
                "city",
                self.store.clone(),
                self.site.clone(),
                Arc::new(CountingTransport::default()),
                Credentials {
                    username: "taro".to_string(),
                    password: password.to_string(),
                },
                self.notifier.clone(),
                Arc::new(NoopMetrics),
            )
        }

        async fn seed_session(&self, age: chrono::Duration) {
            let mut session = SessionRecord::new("old-token".to_string(), None);
            session.created_at = Utc::now() - age;
            session.last_used = session.created_at;
            store::put_json(self.store.as_ref(), "session:u1:city", &session, None)
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_fresh_cache_skips_login() {
        let fx = Fixture::new(ScriptedSite::default());
        fx.seed_session(chrono::Duration::minutes(5)).await;
        let session = fx.manager("pw").get_session(false).await.unwrap();
        assert_eq!(session.token, "old-token");
        assert_eq!(fx.site.logins.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cache_hit_updates_last_used() {
        let fx = Fixture::new(ScriptedSite::default());
        fx.seed_session(chrono::Duration::minutes(5)).await;
        let manager = fx.manager("pw");
        let before = Utc::now();

        let session = manager.get_session(false).await.unwrap();
        assert!(session.last_used >= before);
        let stored = manager.cached().await.unwrap().unwrap();
        assert_eq!(stored.last_used, session.last_used);
        assert!(stored.created_at < before - chrono::Duration::minutes(4));
    }

    #[tokio::test]
    async fn test_stale_cache_logs_in_and_persists() {
        let fx = Fixture::new(ScriptedSite::default());
        fx.seed_session(chrono::Duration::minutes(45)).await;
        let manager = fx.manager("pw");
        let session = manager.get_session(false).await.unwrap();
        assert_eq!(session.token, "token-1");
        assert_eq!(manager.cached().await.unwrap().unwrap().token, "token-1");
        // The lock is released afterwards.
        assert!(fx.store.get("lock:login:u1:city").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_forced_refresh_logs_in_once() {
        let fx = Fixture::new(ScriptedSite {
            login_delay: Duration::from_millis(100),
            ..Default::default()
        });
        fx.seed_session(chrono::Duration::hours(2)).await;
        let manager = Arc::new(fx.manager("pw"));

        let mut handles = Vec::new();
        for _ in 0..5 {
            let m = manager.clone();
            handles.push(tokio::spawn(async move { m.get_session(true).await }));
        }
        let mut tokens = Vec::new();
        for h in handles {
            tokens.push(h.await.unwrap().unwrap().token);
        }

        assert_eq!(fx.site.logins.load(Ordering::SeqCst), 1);
        assert!(tokens.iter().all(|t| t == "token-1"), "{:?}", tokens);
    }

    #[tokio::test]
    async fn test_rejection_halts_until_resume() {
        let fx = Fixture::new(ScriptedSite::default());
        let manager = fx.manager("");

        let err = manager.get_session(false).await.unwrap_err();
        assert!(matches!(err, SessionError::LoginRejected));
        assert_eq!(fx.notifier.kinds(), vec![NotificationKind::LoginHalted]);

        let err = manager.get_session(true).await.unwrap_err();
        assert!(matches!(err, SessionError::Halted { .. }));
        assert_eq!(fx.site.logins.load(Ordering::SeqCst), 1);

        manager.resume().await.unwrap();
        manager
            .set_credentials(Credentials {
                username: "taro".to_string(),
                password: "fixed".to_string(),
            })
            .await;
        let session = manager.get_session(false).await.unwrap();
        assert_eq!(session.token, "token-2");
        assert!(manager.failure_record().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_backoff_applies_to_external_paths() {
        let fx = Fixture::new(ScriptedSite::default());
        let tracker = BackoffTracker::new(fx.store.clone());
        let manager = fx.manager("").with_backoff(tracker.clone());

        assert!(matches!(
            manager.get_session(false).await.unwrap_err(),
            SessionError::LoginRejected
        ));
        assert_eq!(tracker.state("backoff:u1:city").await.unwrap().unwrap().failures, 1);

        manager.resume().await.unwrap();
        assert!(tracker.state("backoff:u1:city").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_invalidate_forces_login() {
        let fx = Fixture::new(ScriptedSite::default());
        fx.seed_session(chrono::Duration::minutes(1)).await;
        let manager = fx.manager("pw");
        manager.invalidate().await.unwrap();
        assert_eq!(manager.get_session(false).await.unwrap().token, "token-1");
    }
}
