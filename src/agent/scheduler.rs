//! The per-(user, site) monitoring agent.
//!
//! An [`Agent`] is an actor: its state sits behind one mutex, a single driver
//! task wakes it when its alarm is due, and every safety-relevant change is
//! written back to the store. Polling runs in two tiers:
//!
//! - **wide**: every active target, every `wideIntervalSecs`, checked in small
//!   concurrent batches;
//! - **hot**: one contested slot, every `hotIntervalSecs`, until a deadline.
//!
//! With no active targets the alarm is disarmed and the driver sleeps until a
//! control call re-arms it.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use futures_util::future::join_all;
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, error, info, warn};

use super::state::{AgentState, HotState, MonitorMode, TickSummary};
use crate::backoff::BackoffTracker;
use crate::config::schema::{Config, QuotaSection};
use crate::error::{ReservationError, SessionError, SiteError, StoreError};
use crate::gateway::{Gateway, GatewayPolicy, HttpClient, SafetyConfig, SafetyPatch};
use crate::metrics::{names, MetricsSink};
use crate::notify::{self, Notification, NotificationKind, Notifier};
use crate::reservation::ReservationExecutor;
use crate::session::{LoginFailureRecord, SessionManager, SessionRecord};
use crate::site::{Availability, Credentials, SiteAdapter};
use crate::store::{self, KvStore};
use crate::target::{
    expand_target, target_has_expired, BookedSlot, CheckItem, HolidayCalendar, MonitoringTarget,
    TargetStatus,
};

// ---------------------------------------------------------------------------
// Settings and shared collaborators
// ---------------------------------------------------------------------------

/// Timing and policy knobs, resolved once from the config.
#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub wide_interval: Duration,
    pub hot_interval: Duration,
    pub hot_duration: chrono::Duration,
    pub busy_retry: Duration,
    pub error_retry: Duration,
    pub check_concurrency: usize,
    pub contested_markers: Vec<String>,
    pub routine_rejections: Vec<String>,
    pub quota: QuotaSection,
    pub timezone: chrono_tz::Tz,
}

impl AgentSettings {
    pub fn from_config(config: &Config) -> Self {
        let t = &config.timing;
        Self {
            wide_interval: Duration::from_secs(t.wide_interval_secs),
            hot_interval: Duration::from_secs(t.hot_interval_secs),
            hot_duration: chrono::Duration::seconds(t.hot_duration_secs as i64),
            busy_retry: Duration::from_secs(t.busy_retry_secs),
            error_retry: Duration::from_secs(t.error_retry_secs),
            check_concurrency: t.check_concurrency.max(1),
            contested_markers: config.contested_markers.clone(),
            routine_rejections: config.routine_rejections.clone(),
            quota: config.quota.clone(),
            timezone: config.tz(),
        }
    }
}

/// Collaborators shared by every agent in the process.
#[derive(Clone)]
pub struct AgentDeps {
    pub store: Arc<dyn KvStore>,
    /// The real network transport behind each agent's gateway.
    pub transport: Arc<dyn HttpClient>,
    pub policy: GatewayPolicy,
    pub notifier: Arc<dyn Notifier>,
    pub metrics: Arc<dyn MetricsSink>,
    pub calendar: Arc<dyn HolidayCalendar>,
    pub settings: Arc<AgentSettings>,
}

// ---------------------------------------------------------------------------
// Diagnostics
// ---------------------------------------------------------------------------

/// Read-only view of an agent for the control surface.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSnapshot {
    pub user_id: String,
    pub site_id: String,
    pub mode: MonitorMode,
    pub username: String,
    pub targets: Vec<MonitoringTarget>,
    pub hot: Option<HotState>,
    pub safety: SafetyConfig,
    pub platform_execution_enabled: bool,
    pub breaker_open_until: Option<DateTime<Utc>>,
    pub requests_last_minute: u32,
    pub login_halt: Option<LoginFailureRecord>,
    pub session_created_at: Option<DateTime<Utc>>,
    pub next_alarm: Option<DateTime<Utc>>,
    pub last_tick: Option<TickSummary>,
    pub revision: u64,
}

/// Result of checking one item from [`Agent::force_check`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckReport {
    pub date: NaiveDate,
    pub time_slot: String,
    pub available: Option<bool>,
    pub status: Option<String>,
    pub contested: bool,
    pub error: Option<String>,
}

/// What the check loop should do after a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    NextTarget,
    Stop,
    /// The gateway breaker is open; nothing more can be sent.
    Breaker,
    /// Login is halted; the alarm must not be re-armed.
    Halted,
}

/// Clears the busy flag when a tick or forced check ends.
struct Busy<'a>(&'a AtomicBool);

impl Drop for Busy<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

type CheckResult = (CheckItem, Result<Availability, SiteError>);

/// Just the revision of a stored `AgentState`.
#[derive(Deserialize)]
struct StoredRevision {
    #[serde(default)]
    revision: u64,
}

// ---------------------------------------------------------------------------
// Agent
// ---------------------------------------------------------------------------

pub struct Agent {
    user_id: String,
    site_id: String,
    label: String,
    store: Arc<dyn KvStore>,
    adapter: Arc<dyn SiteAdapter>,
    gateway: Arc<Gateway>,
    sessions: SessionManager,
    executor: ReservationExecutor,
    notifier: Arc<dyn Notifier>,
    metrics: Arc<dyn MetricsSink>,
    calendar: Arc<dyn HolidayCalendar>,
    settings: Arc<AgentSettings>,
    state: Mutex<AgentState>,
    busy: AtomicBool,
    wake: Notify,
}

impl Agent {
    /// Restore the agent for `user_id` on the adapter's site from the store.
    pub async fn load(
        user_id: &str,
        adapter: Arc<dyn SiteAdapter>,
        deps: &AgentDeps,
    ) -> Result<Self, StoreError> {
        let site_id = adapter.site_id().to_string();
        let label = format!("{}:{}", user_id, site_id);
        let key = store::agent_key(user_id, &site_id);
        let state = store::get_json::<AgentState>(deps.store.as_ref(), &key)
            .await?
            .unwrap_or_else(|| AgentState::new(user_id, &site_id));

        let gateway = Arc::new(Gateway::new(
            &label,
            deps.transport.clone(),
            deps.policy.clone(),
            state.gateway.clone(),
            deps.metrics.clone(),
        ));
        let sessions = SessionManager::new(
            user_id,
            &site_id,
            deps.store.clone(),
            adapter.clone(),
            gateway.clone(),
            state.credentials.clone(),
            deps.notifier.clone(),
            deps.metrics.clone(),
        );
        let executor = ReservationExecutor::new(
            user_id,
            &site_id,
            deps.store.clone(),
            adapter.clone(),
            gateway.clone(),
            deps.notifier.clone(),
            deps.metrics.clone(),
            deps.settings.quota.clone(),
            deps.settings.routine_rejections.clone(),
        );

        info!(
            "Agent[{}]: restored with {} target(s), alarm {:?}",
            label,
            state.targets.len(),
            state.next_alarm
        );

        Ok(Self {
            user_id: user_id.to_string(),
            site_id,
            label,
            store: deps.store.clone(),
            adapter,
            gateway,
            sessions,
            executor,
            notifier: deps.notifier.clone(),
            metrics: deps.metrics.clone(),
            calendar: deps.calendar.clone(),
            settings: deps.settings.clone(),
            state: Mutex::new(state),
            busy: AtomicBool::new(false),
            wake: Notify::new(),
        })
    }

    /// Throttle this agent's logins with the backoff tracker, for agents
    /// driven from one-shot commands rather than the driver loop.
    pub fn with_login_backoff(mut self) -> Self {
        self.sessions = self
            .sessions
            .with_backoff(BackoffTracker::new(self.store.clone()));
        self
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    pub async fn next_alarm(&self) -> Option<DateTime<Utc>> {
        self.state.lock().await.next_alarm
    }

    /// Today's date in the configured timezone.
    pub fn today(&self) -> NaiveDate {
        Utc::now().with_timezone(&self.settings.timezone).date_naive()
    }

    // -- alarm --------------------------------------------------------------

    fn arm(&self, state: &mut AgentState, delay: Duration) {
        let delay = chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        state.next_alarm = Some(Utc::now() + delay);
        self.wake.notify_one();
    }

    fn arm_at(&self, state: &mut AgentState, at: DateTime<Utc>) {
        state.next_alarm = Some(at);
        self.wake.notify_one();
    }

    fn disarm(&self, state: &mut AgentState) {
        if state.next_alarm.take().is_some() {
            debug!("Agent[{}]: alarm disarmed", self.label);
        }
        self.wake.notify_one();
    }

    fn state_key(&self) -> String {
        store::agent_key(&self.user_id, &self.site_id)
    }

    /// Write `state` back, unless the store already holds a newer revision
    /// from another process; that one is adopted by the next sync instead.
    async fn persist(&self, state: &mut AgentState) -> Result<(), StoreError> {
        let key = self.state_key();
        if let Some(stored) = store::get_json::<StoredRevision>(self.store.as_ref(), &key).await? {
            if stored.revision > state.revision {
                debug!(
                    "Agent[{}]: store holds revision {} (ours {}), not overwriting",
                    self.label, stored.revision, state.revision
                );
                return Ok(());
            }
        }
        state.gateway = self.gateway.export_state().await;
        store::put_json(self.store.as_ref(), &key, state, None).await
    }

    /// Adopt control changes another process wrote since this agent last saw
    /// its state. Returns true when a newer revision was adopted.
    async fn sync_control(&self, state: &mut AgentState) -> Result<bool, StoreError> {
        let Some(stored) =
            store::get_json::<AgentState>(self.store.as_ref(), &self.state_key()).await?
        else {
            return Ok(false);
        };
        if stored.revision <= state.revision {
            return Ok(false);
        }
        info!(
            "Agent[{}]: adopting control changes (revision {} -> {})",
            self.label, state.revision, stored.revision
        );
        self.gateway.restore(stored.gateway.clone()).await;
        self.sessions.set_credentials(stored.credentials.clone()).await;
        *state = stored;
        self.wake.notify_one();
        Ok(true)
    }

    /// Pick up control changes while no alarm is armed.
    async fn sync_idle(&self) {
        let mut state = self.state.lock().await;
        if let Err(e) = self.sync_control(&mut state).await {
            warn!("Agent[{}]: could not read persisted state: {}", self.label, e);
        }
    }

    /// Drive the agent until the task is aborted.
    pub async fn run(self: Arc<Self>) {
        debug!("Agent[{}]: driver started", self.label);
        loop {
            let alarm = self.next_alarm().await;
            match alarm {
                None => {
                    tokio::select! {
                        _ = self.wake.notified() => {}
                        _ = tokio::time::sleep(self.settings.wide_interval) => {
                            self.sync_idle().await
                        }
                    }
                }
                Some(at) => {
                    let delay = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                    let deadline = tokio::time::Instant::now() + delay;
                    tokio::select! {
                        _ = tokio::time::sleep_until(deadline) => self.tick_guarded().await,
                        _ = self.wake.notified() => {}
                    }
                }
            }
        }
    }

    // -- control surface ----------------------------------------------------

    /// Replace targets and credentials. Arms the alarm when any target is active.
    pub async fn initialize(
        &self,
        targets: Vec<MonitoringTarget>,
        credentials: Credentials,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        self.sync_control(&mut state).await?;
        let (mine, rejected): (Vec<_>, Vec<_>) = targets.into_iter().partition(|t| {
            t.user_id == self.user_id && t.site_id == self.site_id && t.validate().is_ok()
        });
        for t in &rejected {
            match t.validate() {
                Err(reason) => warn!("Agent[{}]: ignoring invalid target: {}", self.label, reason),
                Ok(()) => warn!(
                    "Agent[{}]: ignoring target '{}' owned by {}:{}",
                    self.label, t.id, t.user_id, t.site_id
                ),
            }
        }

        let credentials_changed = state.credentials.username != credentials.username
            || state.credentials.password != credentials.password;
        state.targets = mine;
        state.credentials = credentials.clone();
        state.hot = None;
        if credentials_changed {
            self.sessions.set_credentials(credentials).await;
            self.sessions.invalidate().await?;
        }

        if state.has_active_targets() {
            self.arm(&mut state, Duration::ZERO);
        } else {
            self.disarm(&mut state);
        }
        state.revision += 1;
        info!(
            "Agent[{}]: initialized with {} target(s)",
            self.label,
            state.targets.len()
        );
        self.persist(&mut state).await
    }

    pub async fn snapshot(&self) -> Result<AgentSnapshot, StoreError> {
        let login_halt = self.sessions.failure_record().await?;
        let session_created_at = self.sessions.cached().await?.map(|s| s.created_at);
        let gateway = self.gateway.export_state().await;
        let state = self.state.lock().await;
        Ok(AgentSnapshot {
            user_id: self.user_id.clone(),
            site_id: self.site_id.clone(),
            mode: state.mode(),
            username: state.credentials.username.clone(),
            targets: state.targets.clone(),
            hot: state.hot.clone(),
            requests_last_minute: gateway.requests_in_window(Utc::now()),
            safety: gateway.safety,
            platform_execution_enabled: self.gateway.platform_execution_enabled(),
            breaker_open_until: gateway.breaker_open_until,
            login_halt,
            session_created_at,
            next_alarm: state.next_alarm,
            last_tick: state.last_tick.clone(),
            revision: state.revision,
        })
    }

    /// Check every item of one target now and report what the site says.
    ///
    /// Read-only: nothing is booked and target status is left alone.
    pub async fn force_check(&self, target_id: &str) -> anyhow::Result<Vec<CheckReport>> {
        if self.busy.swap(true, Ordering::SeqCst) {
            anyhow::bail!("agent {} is busy, try again shortly", self.label);
        }
        let _busy = Busy(&self.busy);

        let target = self
            .state
            .lock()
            .await
            .targets
            .iter()
            .find(|t| t.id == target_id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("unknown target '{}'", target_id))?;
        let items = expand_target(&target, self.today(), self.calendar.as_ref());
        let session = self.sessions.get_session(false).await?;

        let mut reports = Vec::with_capacity(items.len());
        for chunk in items.chunks(self.settings.check_concurrency) {
            for (item, result) in self.check_batch(&target, chunk, &session).await {
                reports.push(match result {
                    Ok(a) => CheckReport {
                        date: item.date,
                        time_slot: item.time_slot,
                        available: Some(a.available),
                        contested: self.is_contested(&a.current_status),
                        status: Some(a.current_status),
                        error: None,
                    },
                    Err(e) => CheckReport {
                        date: item.date,
                        time_slot: item.time_slot,
                        available: None,
                        status: None,
                        contested: false,
                        error: Some(e.to_string()),
                    },
                });
            }
        }
        info!(
            "Agent[{}]: forced check of '{}' covered {} item(s)",
            self.label,
            target_id,
            reports.len()
        );
        Ok(reports)
    }

    /// Apply a safety patch and persist the new configuration.
    pub async fn apply_safety(&self, patch: SafetyPatch) -> Result<SafetyConfig, StoreError> {
        let mut state = self.state.lock().await;
        self.sync_control(&mut state).await?;
        let safety = self.gateway.apply_safety(patch).await;
        state.revision += 1;
        self.persist(&mut state).await?;
        Ok(safety)
    }

    /// Clear a login halt and start polling again.
    pub async fn resume_login(&self) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        self.sync_control(&mut state).await?;
        self.sessions.resume().await?;
        if state.has_active_targets() {
            self.arm(&mut state, Duration::ZERO);
        }
        state.revision += 1;
        self.persist(&mut state).await
    }

    /// Wipe the agent back to an empty state. The blank state is written with
    /// a new revision so a running copy of the agent adopts it.
    pub async fn reset(&self) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        self.sync_control(&mut state).await?;
        for key in [
            store::session_key(&self.user_id, &self.site_id),
            store::login_halt_key(&self.user_id, &self.site_id),
            store::backoff_key(&self.user_id, &self.site_id),
        ] {
            self.store.delete(&key).await?;
        }
        self.gateway.reset().await;
        self.sessions.set_credentials(Credentials::default()).await;
        let revision = state.revision + 1;
        *state = AgentState::new(&self.user_id, &self.site_id);
        state.revision = revision;
        self.wake.notify_one();
        warn!("Agent[{}]: state wiped", self.label);
        self.persist(&mut state).await
    }

    // -- tick ---------------------------------------------------------------

    /// Run one tick; a panic inside it is treated like a failed tick so the
    /// driver keeps going.
    pub async fn tick_guarded(&self) {
        if AssertUnwindSafe(self.tick()).catch_unwind().await.is_ok() {
            return;
        }
        self.metrics.incr(names::TICK_ERRORS);
        error!(
            "Agent[{}]: tick panicked, retrying in {:?}",
            self.label, self.settings.error_retry
        );
        let mut state = self.state.lock().await;
        self.arm(&mut state, self.settings.error_retry);
    }

    /// One wake of the agent. Never fails: errors re-arm a short retry.
    pub async fn tick(&self) {
        if self.busy.swap(true, Ordering::SeqCst) {
            debug!("Agent[{}]: still busy, retrying shortly", self.label);
            let mut state = self.state.lock().await;
            self.arm(&mut state, self.settings.busy_retry);
            return;
        }
        let _busy = Busy(&self.busy);
        self.metrics.incr(names::TICKS);

        let mut state = self.state.lock().await;
        state.next_alarm = None;
        let mut summary = TickSummary {
            at: Some(Utc::now()),
            ..Default::default()
        };

        if let Err(e) = self.run_tick(&mut state, &mut summary).await {
            self.metrics.incr(names::TICK_ERRORS);
            summary.errors += 1;
            error!("Agent[{}]: tick failed: {:#}", self.label, e);
            self.arm(&mut state, self.settings.error_retry);
        }

        debug!(
            "Agent[{}]: tick done, checked={} available={} booked={} errors={} next={:?}",
            self.label,
            summary.checked,
            summary.available,
            summary.booked,
            summary.errors,
            state.next_alarm
        );
        state.last_tick = Some(summary);
        if let Err(e) = self.persist(&mut state).await {
            error!("Agent[{}]: failed to persist state: {}", self.label, e);
        }
    }

    async fn run_tick(
        &self,
        state: &mut AgentState,
        summary: &mut TickSummary,
    ) -> anyhow::Result<()> {
        self.sync_control(state).await?;

        if store::maintenance_enabled(self.store.as_ref()).await? {
            info!("Agent[{}]: maintenance mode, skipping tick", self.label);
            summary.skipped = Some("maintenance".to_string());
            self.arm(state, self.settings.wide_interval);
            return Ok(());
        }

        if let Some(record) = self.sessions.halted().await? {
            warn!(
                "Agent[{}]: login halted ({}), not re-arming",
                self.label, record.reason
            );
            summary.skipped = Some("login halted".to_string());
            self.disarm(state);
            return Ok(());
        }

        let today = self.today();
        let label = &self.label;
        state.targets.retain(|t| {
            let expired = target_has_expired(t, today);
            if expired {
                info!("Agent[{}]: dropping expired target '{}'", label, t.id);
            }
            !expired
        });
        self.settle_hot(state);

        if !state.has_active_targets() {
            info!("Agent[{}]: no active targets, going idle", self.label);
            summary.skipped = Some("no active targets".to_string());
            self.disarm(state);
            return Ok(());
        }

        let mut session = match self.session_or_flow(false).await? {
            Ok(session) => session,
            Err(flow) => return self.finish(state, flow).await,
        };

        let plan = self.plan(state, today);
        let mut relogged = false;
        let mut flow = Flow::Continue;

        'targets: for (idx, items) in plan {
            for chunk in items.chunks(self.settings.check_concurrency) {
                if self.executor.is_busy() {
                    debug!("Agent[{}]: booking in progress, ending checks", self.label);
                    break 'targets;
                }
                if !state.targets[idx].is_active() {
                    continue 'targets;
                }

                let target = state.targets[idx].clone();
                let mut results = self.check_batch(&target, chunk, &session).await;

                let expired: Vec<usize> = results
                    .iter()
                    .enumerate()
                    .filter(|(_, (_, r))| matches!(r, Err(SiteError::SessionExpired)))
                    .map(|(i, _)| i)
                    .collect();
                if !expired.is_empty() && !relogged {
                    relogged = true;
                    info!("Agent[{}]: session expired, logging in again", self.label);
                    self.sessions.invalidate().await?;
                    session = match self.session_or_flow(true).await? {
                        Ok(session) => session,
                        Err(f) => {
                            flow = f;
                            break 'targets;
                        }
                    };
                    let items: Vec<CheckItem> =
                        expired.iter().map(|&i| results[i].0.clone()).collect();
                    let retried = self.check_batch(&target, &items, &session).await;
                    for (i, result) in expired.into_iter().zip(retried) {
                        results[i] = result;
                    }
                }

                match self.handle_results(state, idx, results, &session, summary).await? {
                    Flow::Continue => {}
                    Flow::NextTarget => continue 'targets,
                    other => {
                        flow = other;
                        break 'targets;
                    }
                }
            }
        }

        self.finish(state, flow).await
    }

    /// Arm the next wake according to how the tick ended.
    async fn finish(&self, state: &mut AgentState, flow: Flow) -> anyhow::Result<()> {
        self.settle_hot(state);
        match flow {
            Flow::Halted => self.disarm(state),
            Flow::Breaker => {
                let until = self.gateway.breaker_open_until().await;
                self.persist(state).await?;
                match until {
                    Some(at) => self.arm_at(state, at),
                    None => self.arm(state, self.settings.wide_interval),
                }
            }
            _ if !state.has_active_targets() => {
                info!("Agent[{}]: no active targets left, going idle", self.label);
                self.disarm(state);
            }
            _ if state.hot.is_some() => self.arm(state, self.settings.hot_interval),
            _ => self.arm(state, self.settings.wide_interval),
        }
        Ok(())
    }

    /// Leave hot mode when its deadline passed or its target stopped being active.
    fn settle_hot(&self, state: &mut AgentState) {
        let Some(hot) = &state.hot else { return };
        let now = Utc::now();
        let target_active = state
            .targets
            .iter()
            .any(|t| t.id == hot.target_id && t.is_active());
        if now >= hot.deadline {
            info!("Agent[{}]: hot monitoring deadline reached", self.label);
            state.hot = None;
        } else if !target_active {
            info!("Agent[{}]: hot target settled, back to wide monitoring", self.label);
            state.hot = None;
        }
    }

    /// What to check this tick: the hot slot alone, or every active target.
    fn plan(&self, state: &AgentState, today: NaiveDate) -> Vec<(usize, Vec<CheckItem>)> {
        if let Some(hot) = &state.hot {
            if let Some(idx) = state.targets.iter().position(|t| t.id == hot.target_id) {
                return vec![(
                    idx,
                    vec![CheckItem {
                        date: hot.date,
                        time_slot: hot.time_slot.clone(),
                    }],
                )];
            }
        }
        state
            .active_by_priority()
            .into_iter()
            .map(|idx| {
                let target = &state.targets[idx];
                let items = expand_target(target, today, self.calendar.as_ref())
                    .into_iter()
                    .filter(|item| !target.has_booked(item.date, &item.time_slot))
                    .collect();
                (idx, items)
            })
            .collect()
    }

    /// Get a session, turning a halt into `Flow::Halted` and an open breaker
    /// into `Flow::Breaker`.
    async fn session_or_flow(&self, force: bool) -> anyhow::Result<Result<SessionRecord, Flow>> {
        match self.sessions.get_session(force).await {
            Ok(session) => Ok(Ok(session)),
            Err(SessionError::Halted { .. }) | Err(SessionError::LoginRejected) => {
                warn!("Agent[{}]: login halted, stopping", self.label);
                Ok(Err(Flow::Halted))
            }
            Err(SessionError::Site(e)) if e.is_breaker_trip() => {
                warn!("Agent[{}]: login blocked by breaker: {}", self.label, e);
                Ok(Err(Flow::Breaker))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Check `items` concurrently through the gateway.
    async fn check_batch(
        &self,
        target: &MonitoringTarget,
        items: &[CheckItem],
        session: &SessionRecord,
    ) -> Vec<CheckResult> {
        let credentials = self.sessions.credentials().await;
        let checks = items.iter().map(|item| {
            let credentials = &credentials;
            async move {
                self.metrics.incr(names::CHECKS);
                let result = self
                    .adapter
                    .check_availability(
                        self.gateway.as_ref(),
                        &target.facility_id,
                        item.date,
                        &item.time_slot,
                        credentials,
                        session,
                    )
                    .await;
                (item.clone(), result)
            }
        });
        join_all(checks).await
    }

    fn is_contested(&self, status: &str) -> bool {
        let lower = status.to_lowercase();
        self.settings
            .contested_markers
            .iter()
            .any(|m| lower.contains(&m.to_lowercase()))
    }

    async fn handle_results(
        &self,
        state: &mut AgentState,
        idx: usize,
        results: Vec<CheckResult>,
        session: &SessionRecord,
        summary: &mut TickSummary,
    ) -> anyhow::Result<Flow> {
        for (item, result) in results {
            summary.checked += 1;
            match result {
                Ok(a) if a.available => {
                    summary.available += 1;
                    self.metrics.incr(names::DETECTIONS);
                    let flow = self.on_available(state, idx, &item, session, summary).await?;
                    if flow != Flow::Continue {
                        return Ok(flow);
                    }
                }
                Ok(a) => {
                    if state.hot.is_none() && self.is_contested(&a.current_status) {
                        self.enter_hot(state, idx, &item, &a.current_status);
                    }
                }
                Err(e) if e.is_breaker_trip() => {
                    summary.errors += 1;
                    warn!("Agent[{}]: outbound calls blocked: {}", self.label, e);
                    return Ok(Flow::Breaker);
                }
                Err(e) => {
                    summary.errors += 1;
                    warn!(
                        "Agent[{}]: check {} {} {} failed: {}",
                        self.label, state.targets[idx].facility_id, item.date, item.time_slot, e
                    );
                    state.targets[idx].last_error = Some(e.to_string());
                }
            }
        }
        Ok(Flow::Continue)
    }

    fn enter_hot(&self, state: &mut AgentState, idx: usize, item: &CheckItem, status: &str) {
        let now = Utc::now();
        let deadline = now + self.settings.hot_duration;
        info!(
            "Agent[{}]: '{}' on {} {} {}, hot monitoring until {}",
            self.label, status, state.targets[idx].facility_id, item.date, item.time_slot, deadline
        );
        state.hot = Some(HotState {
            target_id: state.targets[idx].id.clone(),
            date: item.date,
            time_slot: item.time_slot.clone(),
            started_at: now,
            deadline,
        });
    }

    /// React to an open slot: notify, or book it.
    async fn on_available(
        &self,
        state: &mut AgentState,
        idx: usize,
        item: &CheckItem,
        session: &SessionRecord,
        summary: &mut TickSummary,
    ) -> anyhow::Result<Flow> {
        let target = &mut state.targets[idx];
        info!(
            "Agent[{}]: {} {} {} is open",
            self.label, target.facility_id, item.date, item.time_slot
        );

        if !target.auto_book {
            target.set_status(TargetStatus::Detected);
            let title = format!("Slot open: {}", facility_label(target));
            let body = format!("{} {} can be booked now.", item.date, item.time_slot);
            let note = Notification::new(
                &self.user_id,
                &self.site_id,
                NotificationKind::Detected,
                &title,
                &body,
            );
            notify::deliver(self.notifier.as_ref(), note).await;
            self.persist(state).await?;
            return Ok(Flow::NextTarget);
        }

        let result = self
            .executor
            .execute(target, item.date, &item.time_slot, session)
            .await;
        let still_active = target.is_active();
        let flow = match result {
            Ok(_) => {
                summary.booked += 1;
                if still_active {
                    Flow::Continue
                } else {
                    Flow::NextTarget
                }
            }
            Err(ReservationError::Busy) => Flow::Stop,
            Err(ReservationError::AlreadyBooked) => {
                target.booked.push(BookedSlot {
                    date: item.date,
                    time_slot: item.time_slot.clone(),
                });
                Flow::Continue
            }
            Err(e) if e.is_safety_block() => {
                // Not retried: the target waits for the user.
                target.last_error = Some(e.to_string());
                target.set_status(TargetStatus::Detected);
                if !matches!(e, ReservationError::QuotaExceeded(_)) {
                    let title = format!("Slot open: {}", facility_label(target));
                    let body = format!(
                        "{} {} is open but was not booked automatically: {}",
                        item.date, item.time_slot, e
                    );
                    let note = Notification::new(
                        &self.user_id,
                        &self.site_id,
                        NotificationKind::Detected,
                        &title,
                        &body,
                    );
                    notify::deliver(self.notifier.as_ref(), note).await;
                }
                Flow::NextTarget
            }
            Err(ReservationError::Site(e)) if e.is_breaker_trip() => Flow::Breaker,
            Err(ReservationError::Site(SiteError::SessionExpired)) => {
                summary.errors += 1;
                self.sessions.invalidate().await?;
                Flow::Stop
            }
            Err(ReservationError::Failed(_)) => {
                if still_active {
                    Flow::Continue
                } else {
                    Flow::NextTarget
                }
            }
            Err(e) => {
                summary.errors += 1;
                warn!("Agent[{}]: booking attempt failed: {}", self.label, e);
                Flow::Continue
            }
        };

        let target_id = state.targets[idx].id.clone();
        if state.hot.as_ref().map_or(false, |h| h.target_id == target_id) && flow != Flow::Breaker {
            info!("Agent[{}]: hot slot handled, back to wide monitoring", self.label);
            state.hot = None;
        }
        self.persist(state).await?;
        Ok(flow)
    }
}

fn facility_label(target: &MonitoringTarget) -> &str {
    if target.facility_name.is_empty() {
        &target.facility_id
    } else {
        &target.facility_name
    }
}
