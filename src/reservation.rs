//! Reservation execution: quota, allow-list, booking, and history.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::schema::QuotaSection;
use crate::error::{ReservationError, SiteError, StoreError};
use crate::gateway::Gateway;
use crate::lock::AdvisoryLock;
use crate::metrics::{names, MetricsSink};
use crate::notify::{self, Notification, NotificationKind, Notifier};
use crate::session::SessionRecord;
use crate::site::{ReservationOutcome, ReservationRequest, SiteAdapter};
use crate::store::{self, KvStore};
use crate::target::{BookedSlot, BookingStrategy, MonitoringTarget, TargetStatus};

/// Oldest history records are dropped past this many.
pub const HISTORY_CAP: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingOutcome {
    Success,
    Failure,
}

/// One booking attempt that reached the site.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingRecord {
    pub user_id: String,
    pub site_id: String,
    pub target_id: String,
    pub facility_id: String,
    pub date: NaiveDate,
    pub time_slot: String,
    pub outcome: BookingOutcome,
    #[serde(default)]
    pub message: String,
    /// Made in mock mode; never counted against quotas.
    #[serde(default)]
    pub dry_run: bool,
    pub at: DateTime<Utc>,
}

impl BookingRecord {
    fn counts_toward_quota(&self, since: DateTime<Utc>) -> bool {
        self.outcome == BookingOutcome::Success && !self.dry_run && self.at >= since
    }
}

/// The user's booking history, oldest first.
pub async fn load_history(
    store: &dyn KvStore,
    user_id: &str,
) -> Result<Vec<BookingRecord>, StoreError> {
    Ok(store::get_json(store, &store::history_key(user_id))
        .await?
        .unwrap_or_default())
}

/// Append to the user's history under the `history:{user}` lock.
///
/// History is shared by every site agent of the user. When the lock cannot be
/// taken the write still happens; a lost record only loosens the quota.
pub async fn append_history(
    store: Arc<dyn KvStore>,
    record: BookingRecord,
) -> Result<(), StoreError> {
    let lock = AdvisoryLock::new(store.clone(), &format!("history:{}", record.user_id))
        .with_ttl(Duration::from_secs(5));
    let locked = lock.acquire(20, Duration::from_millis(50)).await?;
    if !locked {
        warn!("History: lock for {} busy, writing anyway", record.user_id);
    }

    let key = store::history_key(&record.user_id);
    let mut history = load_history(store.as_ref(), &record.user_id).await?;
    history.push(record);
    if history.len() > HISTORY_CAP {
        let excess = history.len() - HISTORY_CAP;
        history.drain(..excess);
    }
    let result = store::put_json(store.as_ref(), &key, &history, None).await;

    if locked {
        lock.release().await?;
    }
    result
}

/// Clears the in-progress flag when a reservation attempt ends.
struct InProgress<'a>(&'a AtomicBool);

impl Drop for InProgress<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Books slots for one (user, site).
pub struct ReservationExecutor {
    user_id: String,
    site_id: String,
    store: Arc<dyn KvStore>,
    adapter: Arc<dyn SiteAdapter>,
    gateway: Arc<Gateway>,
    notifier: Arc<dyn Notifier>,
    metrics: Arc<dyn MetricsSink>,
    quota: QuotaSection,
    routine_rejections: Vec<String>,
    in_progress: AtomicBool,
}

impl ReservationExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        user_id: &str,
        site_id: &str,
        store: Arc<dyn KvStore>,
        adapter: Arc<dyn SiteAdapter>,
        gateway: Arc<Gateway>,
        notifier: Arc<dyn Notifier>,
        metrics: Arc<dyn MetricsSink>,
        quota: QuotaSection,
        routine_rejections: Vec<String>,
    ) -> Self {
        Self {
            user_id: user_id.to_string(),
            site_id: site_id.to_string(),
            store,
            adapter,
            gateway,
            notifier,
            metrics,
            quota,
            routine_rejections,
            in_progress: AtomicBool::new(false),
        }
    }

    /// Whether a reservation is running right now.
    pub fn is_busy(&self) -> bool {
        self.in_progress.load(Ordering::SeqCst)
    }

    /// Whether `message` is an expected rejection such as "already full".
    pub fn is_routine_rejection(&self, message: &str) -> bool {
        let lower = message.to_lowercase();
        self.routine_rejections
            .iter()
            .any(|r| lower.contains(&r.to_lowercase()))
    }

    /// `Err(reason)` when a cap is reached. Mock-mode bookings never count.
    pub fn check_quota(&self, history: &[BookingRecord], now: DateTime<Utc>) -> Result<(), String> {
        let caps = [
            ("weekly", self.quota.weekly_cap, 7),
            ("monthly", self.quota.monthly_cap, 30),
        ];
        for (label, cap, days) in caps {
            let Some(cap) = cap else { continue };
            let since = now - chrono::Duration::days(days);
            let used = history.iter().filter(|r| r.counts_toward_quota(since)).count() as u32;
            if used >= cap {
                return Err(format!(
                    "{} booking cap of {} reached ({} booked in the last {} days)",
                    label, cap, used, days
                ));
            }
        }
        Ok(())
    }

    /// Try to book `date`/`time_slot` for `target`, updating it in place.
    ///
    /// A second call while one is running fails with `Busy` instead of waiting.
    pub async fn execute(
        &self,
        target: &mut MonitoringTarget,
        date: NaiveDate,
        time_slot: &str,
        session: &SessionRecord,
    ) -> Result<ReservationOutcome, ReservationError> {
        if self
            .in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ReservationError::Busy);
        }
        let _guard = InProgress(&self.in_progress);

        let now = Utc::now();
        let history = load_history(self.store.as_ref(), &self.user_id).await?;

        let already = target.has_booked(date, time_slot)
            || history.iter().any(|r| {
                r.outcome == BookingOutcome::Success
                    && !r.dry_run
                    && r.target_id == target.id
                    && r.date == date
                    && r.time_slot == time_slot
            });
        if already {
            return Err(ReservationError::AlreadyBooked);
        }

        // (a) quota
        if let Err(reason) = self.check_quota(&history, now) {
            info!(
                "Reservation[{}:{}]: skipped {} {} {}: {}",
                self.user_id, self.site_id, target.facility_id, date, time_slot, reason
            );
            notify::deliver(
                self.notifier.as_ref(),
                Notification::new(
                    &self.user_id,
                    &self.site_id,
                    NotificationKind::Quota,
                    "Booking limit reached",
                    &format!(
                        "{} {} {} is open but was not booked: {}.",
                        display_name(target),
                        date,
                        time_slot,
                        reason
                    ),
                ),
            )
            .await;
            return Err(ReservationError::QuotaExceeded(reason));
        }

        // (b) allow-list
        let safety = self.gateway.safety().await;
        if !safety.is_allowed(&target.facility_id, date, time_slot, now) {
            warn!(
                "Reservation[{}:{}]: {} {} {} is not on the allow-list",
                self.user_id, self.site_id, target.facility_id, date, time_slot
            );
            return Err(ReservationError::NotAllowListed {
                facility_id: target.facility_id.clone(),
                date: date.to_string(),
                time_slot: time_slot.to_string(),
            });
        }

        // (c) book through the gateway
        let dry_run = safety.mock_mode;
        let request = ReservationRequest {
            facility_id: &target.facility_id,
            date,
            time_slot,
            session,
            options: &target.options,
            dry_run,
        };
        let result = self
            .adapter
            .make_reservation(self.gateway.as_ref(), request)
            .await;

        // (d) outcome
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(SiteError::Gateway(e)) => {
                warn!(
                    "Reservation[{}:{}]: gateway refused booking: {}",
                    self.user_id, self.site_id, e
                );
                return Err(ReservationError::Site(SiteError::Gateway(e)));
            }
            Err(SiteError::SessionExpired) => return Err(SiteError::SessionExpired.into()),
            Err(e) => {
                self.metrics.incr(names::BOOKING_FAILURES);
                target.last_error = Some(e.to_string());
                let message = e.to_string();
                self.record(target, date, time_slot, BookingOutcome::Failure, &message, dry_run)
                    .await?;
                return Err(e.into());
            }
        };

        if outcome.success {
            self.metrics.incr(names::BOOKINGS);
            if !dry_run {
                target.booked.push(BookedSlot {
                    date,
                    time_slot: time_slot.to_string(),
                });
            }
            target.last_error = None;
            match target.strategy {
                BookingStrategy::FirstMatch => target.set_status(TargetStatus::Completed),
                BookingStrategy::All => target.updated_at = now,
            }
            self.record(target, date, time_slot, BookingOutcome::Success, &outcome.message, dry_run)
                .await?;
            info!(
                "Reservation[{}:{}]: booked {} {} {}{}",
                self.user_id,
                self.site_id,
                target.facility_id,
                date,
                time_slot,
                if dry_run { " (dry run)" } else { "" }
            );
            notify::deliver(
                self.notifier.as_ref(),
                Notification::new(
                    &self.user_id,
                    &self.site_id,
                    NotificationKind::Booked,
                    if dry_run { "Booked (dry run)" } else { "Booked" },
                    &format!("{} {} {}", display_name(target), date, time_slot),
                ),
            )
            .await;
            return Ok(outcome);
        }

        self.metrics.incr(names::BOOKING_FAILURES);
        target.last_error = Some(outcome.message.clone());
        self.record(target, date, time_slot, BookingOutcome::Failure, &outcome.message, dry_run)
            .await?;

        if self.is_routine_rejection(&outcome.message) {
            info!(
                "Reservation[{}:{}]: {} {} {} rejected: {}",
                self.user_id, self.site_id, target.facility_id, date, time_slot, outcome.message
            );
        } else {
            warn!(
                "Reservation[{}:{}]: booking {} {} {} failed: {}",
                self.user_id, self.site_id, target.facility_id, date, time_slot, outcome.message
            );
            target.set_status(TargetStatus::Failed);
            notify::deliver(
                self.notifier.as_ref(),
                Notification::new(
                    &self.user_id,
                    &self.site_id,
                    NotificationKind::BookingFailed,
                    "Booking failed",
                    &format!(
                        "{} {} {}: {}",
                        display_name(target),
                        date,
                        time_slot,
                        outcome.message
                    ),
                ),
            )
            .await;
        }
        Err(ReservationError::Failed(outcome.message))
    }

    async fn record(
        &self,
        target: &MonitoringTarget,
        date: NaiveDate,
        time_slot: &str,
        outcome: BookingOutcome,
        message: &str,
        dry_run: bool,
    ) -> Result<(), StoreError> {
        append_history(
            self.store.clone(),
            BookingRecord {
                user_id: self.user_id.clone(),
                site_id: self.site_id.clone(),
                target_id: target.id.clone(),
                facility_id: target.facility_id.clone(),
                date,
                time_slot: time_slot.to_string(),
                outcome,
                message: message.to_string(),
                dry_run,
                at: Utc::now(),
            },
        )
        .await
    }
}

fn display_name(target: &MonitoringTarget) -> &str {
    if target.facility_name.is_empty() {
        &target.facility_id
    } else {
        &target.facility_name
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::config::schema::Config;
    use crate::gateway::tests::CountingTransport;
    use crate::gateway::{AllowedTarget, GatewayPolicy, GatewayState, SafetyConfig};
    use crate::metrics::InMemoryMetrics;
    use crate::notify::tests::RecordingNotifier;
    use crate::site::base::tests::ScriptedSite;
    use crate::store::MemoryStore;
    use crate::target::DateSpec;

    fn date() -> NaiveDate {
        (Utc::now() + chrono::Duration::days(3)).date_naive()
    }

    struct Fixture {
        store: Arc<dyn KvStore>,
        site: Arc<ScriptedSite>,
        transport: Arc<CountingTransport>,
        notifier: Arc<RecordingNotifier>,
        metrics: Arc<InMemoryMetrics>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                store: Arc::new(MemoryStore::new()),
                site: Arc::new(ScriptedSite::default()),
                transport: Arc::new(CountingTransport::default()),
                notifier: Arc::new(RecordingNotifier::default()),
                metrics: Arc::new(InMemoryMetrics::new()),
            }
        }

        fn executor(&self, quota: QuotaSection, safety: SafetyConfig) -> ReservationExecutor {
            let mut config = Config::default();
            config.safety.platform_execution_enabled = true;
            let gateway = Gateway::new(
                "u1:city",
                self.transport.clone(),
                GatewayPolicy::from_config(&config).unwrap(),
                GatewayState {
                    safety,
                    ..Default::default()
                },
                self.metrics.clone(),
            );
            ReservationExecutor::new(
                "u1",
                "city",
                self.store.clone(),
                self.site.clone(),
                Arc::new(gateway),
                self.notifier.clone(),
                self.metrics.clone(),
                quota,
                config.routine_rejections,
            )
        }

        async fn seed_success(&self, days_ago: i64) {
            let record = BookingRecord {
                user_id: "u1".to_string(),
                site_id: "city".to_string(),
                target_id: "old".to_string(),
                facility_id: "court-9".to_string(),
                date: date(),
                time_slot: "18:00".to_string(),
                outcome: BookingOutcome::Success,
                message: String::new(),
                dry_run: false,
                at: Utc::now() - chrono::Duration::days(days_ago),
            };
            append_history(self.store.clone(), record).await.unwrap();
        }
    }

    fn open_safety() -> SafetyConfig {
        SafetyConfig {
            execution_enabled: true,
            allow_list: vec![AllowedTarget {
                facility_id: "court-1".to_string(),
                date: date(),
                time_slot: "09:00".to_string(),
                expires_at: Utc::now() + chrono::Duration::hours(1),
            }],
            ..Default::default()
        }
    }

    fn target() -> MonitoringTarget {
        let mut t = MonitoringTarget::new(
            "t1",
            "u1",
            "city",
            "court-1",
            DateSpec::Single { date: date() },
            vec!["09:00".to_string()],
        );
        t.auto_book = true;
        t
    }

    fn session() -> SessionRecord {
        SessionRecord::new("tok".to_string(), None)
    }

    #[tokio::test]
    async fn test_weekly_cap_rejects_third_booking() {
        let fx = Fixture::new();
        fx.seed_success(1).await;
        fx.seed_success(3).await;
        let executor = fx.executor(
            QuotaSection {
                weekly_cap: Some(2),
                monthly_cap: None,
            },
            open_safety(),
        );

        let mut t = target();
        let err = executor.execute(&mut t, date(), "09:00", &session()).await.unwrap_err();
        match &err {
            ReservationError::QuotaExceeded(reason) => {
                assert!(reason.contains("weekly booking cap of 2"), "{}", reason)
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(err.is_safety_block());
        assert_eq!(fx.site.bookings.load(Ordering::SeqCst), 0);
        assert_eq!(fx.notifier.kinds(), vec![NotificationKind::Quota]);
        assert_eq!(t.status, TargetStatus::Active);
    }

    #[tokio::test]
    async fn test_old_and_dry_run_bookings_do_not_count() {
        let fx = Fixture::new();
        fx.seed_success(10).await;
        let executor = fx.executor(
            QuotaSection {
                weekly_cap: Some(1),
                monthly_cap: Some(2),
            },
            open_safety(),
        );
        let mut history = load_history(fx.store.as_ref(), "u1").await.unwrap();
        history[0].at = Utc::now() - chrono::Duration::days(10);
        assert!(executor.check_quota(&history, Utc::now()).is_ok());

        history.push(BookingRecord {
            dry_run: true,
            at: Utc::now(),
            ..history[0].clone()
        });
        assert!(executor.check_quota(&history, Utc::now()).is_ok());

        history.push(BookingRecord {
            at: Utc::now(),
            ..history[0].clone()
        });
        let reason = executor.check_quota(&history, Utc::now()).unwrap_err();
        assert!(reason.starts_with("weekly"));
    }

    #[tokio::test]
    async fn test_success_books_and_completes_first_match() {
        let fx = Fixture::new();
        let executor = fx.executor(QuotaSection::default(), open_safety());
        let mut t = target();

        let outcome = executor.execute(&mut t, date(), "09:00", &session()).await.unwrap();
        assert!(outcome.success);
        assert_eq!(t.status, TargetStatus::Completed);
        assert!(t.has_booked(date(), "09:00"));
        assert_eq!(fx.transport.calls.load(Ordering::SeqCst), 1);
        assert_eq!(fx.metrics.get(names::BOOKINGS), 1);
        assert_eq!(fx.notifier.kinds(), vec![NotificationKind::Booked]);

        let history = load_history(fx.store.as_ref(), "u1").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].outcome, BookingOutcome::Success);
        assert!(!executor.is_busy());

        // A second attempt on the same slot is refused.
        let err = executor.execute(&mut t, date(), "09:00", &session()).await.unwrap_err();
        assert!(matches!(err, ReservationError::AlreadyBooked));
        assert_eq!(fx.site.bookings.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_strategy_all_keeps_target_active() {
        let fx = Fixture::new();
        let executor = fx.executor(QuotaSection::default(), open_safety());
        let mut t = target();
        t.strategy = BookingStrategy::All;
        executor.execute(&mut t, date(), "09:00", &session()).await.unwrap();
        assert_eq!(t.status, TargetStatus::Active);
        assert_eq!(t.booked.len(), 1);
    }

    #[tokio::test]
    async fn test_not_allow_listed_never_sends() {
        let fx = Fixture::new();
        let safety = SafetyConfig {
            execution_enabled: true,
            ..Default::default()
        };
        let executor = fx.executor(QuotaSection::default(), safety);
        let mut t = target();
        let err = executor.execute(&mut t, date(), "09:00", &session()).await.unwrap_err();
        assert!(matches!(err, ReservationError::NotAllowListed { .. }));
        assert_eq!(fx.transport.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_busy_flag_rejects_concurrent_call() {
        let fx = Fixture::new();
        let executor = fx.executor(QuotaSection::default(), open_safety());
        executor.in_progress.store(true, Ordering::SeqCst);
        let mut t = target();
        let err = executor.execute(&mut t, date(), "09:00", &session()).await.unwrap_err();
        assert!(matches!(err, ReservationError::Busy));
        // The rejected call must not clear the running call's flag.
        assert!(executor.is_busy());
    }

    #[tokio::test]
    async fn test_concurrent_execute_runs_once() {
        let mut fx = Fixture::new();
        fx.site = Arc::new(ScriptedSite {
            booking_delay: std::time::Duration::from_millis(50),
            ..Default::default()
        });
        let executor = fx.executor(QuotaSection::default(), open_safety());
        let mut first = target();
        let mut second = target();
        let session_a = session();
        let session_b = session();

        let (a, b) = tokio::join!(
            executor.execute(&mut first, date(), "09:00", &session_a),
            executor.execute(&mut second, date(), "09:00", &session_b),
        );
        let busy = [&a, &b]
            .iter()
            .filter(|r| matches!(r, Err(ReservationError::Busy)))
            .count();
        assert_eq!(busy, 1);
        assert!(a.is_ok() || b.is_ok());
        assert_eq!(fx.site.bookings.load(Ordering::SeqCst), 1);
        assert!(!executor.is_busy());
    }

    #[tokio::test]
    async fn test_routine_rejection_is_quiet() {
        let fx = Fixture::new();
        let executor = fx.executor(QuotaSection::default(), open_safety());
        fx.site.fail_booking_with("Already full");
        let mut t = target();
        let err = executor.execute(&mut t, date(), "09:00", &session()).await.unwrap_err();
        assert!(matches!(err, ReservationError::Failed(_)));
        assert_eq!(t.status, TargetStatus::Active);
        assert!(fx.notifier.kinds().is_empty());
        assert_eq!(
            load_history(fx.store.as_ref(), "u1").await.unwrap()[0].outcome,
            BookingOutcome::Failure
        );
    }

    #[tokio::test]
    async fn test_unexpected_rejection_fails_target_and_notifies() {
        let fx = Fixture::new();
        let executor = fx.executor(QuotaSection::default(), open_safety());
        fx.site.fail_booking_with("payment method required");
        let mut t = target();
        executor.execute(&mut t, date(), "09:00", &session()).await.unwrap_err();
        assert_eq!(t.status, TargetStatus::Failed);
        assert_eq!(t.last_error.as_deref(), Some("payment method required"));
        assert_eq!(fx.notifier.kinds(), vec![NotificationKind::BookingFailed]);
    }

    #[tokio::test]
    async fn test_mock_mode_books_as_dry_run() {
        let fx = Fixture::new();
        let mut safety = open_safety();
        safety.mock_mode = true;
        let executor = fx.executor(QuotaSection::default(), safety);
        let mut t = target();
        executor.execute(&mut t, date(), "09:00", &session()).await.unwrap();
        assert_eq!(fx.transport.calls.load(Ordering::SeqCst), 0);
        let history = load_history(fx.store.as_ref(), "u1").await.unwrap();
        assert!(history[0].dry_run);
        assert!(t.booked.is_empty());
    }

    #[tokio::test]
    async fn test_dry_run_does_not_block_real_booking() {
        let fx = Fixture::new();
        let mut safety = open_safety();
        safety.mock_mode = true;
        let executor = fx.executor(QuotaSection::default(), safety);
        let mut t = target();
        t.strategy = BookingStrategy::All;
        executor.execute(&mut t, date(), "09:00", &session()).await.unwrap();
        assert!(!t.has_booked(date(), "09:00"));

        executor
            .gateway
            .apply_safety(crate::gateway::SafetyPatch {
                mock_mode: Some(false),
                ..Default::default()
            })
            .await;
        let outcome = executor.execute(&mut t, date(), "09:00", &session()).await.unwrap();
        assert!(outcome.success);
        assert_eq!(fx.transport.calls.load(Ordering::SeqCst), 1);
        assert!(t.has_booked(date(), "09:00"));
    }

    #[tokio::test]
    async fn test_history_is_capped() {
        let fx = Fixture::new();
        fx.seed_success(40).await;
        let mut history = load_history(fx.store.as_ref(), "u1").await.unwrap();
        let first = history[0].clone();
        for i in 0..HISTORY_CAP - 1 {
            history.push(BookingRecord {
                target_id: format!("t{}", i),
                ..first.clone()
            });
        }
        store::put_json(fx.store.as_ref(), "history:u1", &history, None)
            .await
            .unwrap();

        fx.seed_success(0).await;
        let history = load_history(fx.store.as_ref(), "u1").await.unwrap();
        assert_eq!(history.len(), HISTORY_CAP);
        assert_eq!(history[0].target_id, "t0");
        assert_eq!(history[HISTORY_CAP - 1].target_id, "old");
    }
}
