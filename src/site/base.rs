//! Base trait for site adapters.

use std::fmt;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::SiteError;
use crate::gateway::HttpClient;
use crate::session::SessionRecord;

/// Login credentials for one site account.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Result of checking one slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Availability {
    pub available: bool,
    /// The raw status marker the site showed (e.g. "○", "×", "キャンセル待ち").
    pub current_status: String,
}

/// Everything a booking call needs.
#[derive(Debug, Clone)]
pub struct ReservationRequest<'a> {
    pub facility_id: &'a str,
    pub date: NaiveDate,
    pub time_slot: &'a str,
    pub session: &'a SessionRecord,
    /// Site-specific booking options (party size, purpose, ...).
    pub options: &'a serde_json::Value,
    pub dry_run: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationOutcome {
    pub success: bool,
    pub message: String,
}

/// Site-specific login, availability, and booking.
///
/// Implementations must send every request through `client`; the agent passes
/// its gateway there so the safety checks cover every site.
#[async_trait]
pub trait SiteAdapter: Send + Sync {
    /// Identifier used in targets and agent keys.
    fn site_id(&self) -> &str;

    /// Log in. `Ok(None)` means the site rejected the credentials.
    async fn login(
        &self,
        client: &dyn HttpClient,
        credentials: &Credentials,
    ) -> Result<Option<SessionRecord>, SiteError>;

    /// Check one (facility, date, slot).
    async fn check_availability(
        &self,
        client: &dyn HttpClient,
        facility_id: &str,
        date: NaiveDate,
        time_slot: &str,
        credentials: &Credentials,
        session: &SessionRecord,
    ) -> Result<Availability, SiteError>;

    /// Attempt a reservation.
    async fn make_reservation(
        &self,
        client: &dyn HttpClient,
        request: ReservationRequest<'_>,
    ) -> Result<ReservationOutcome, SiteError>;
}
