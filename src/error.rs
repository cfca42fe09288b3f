//! Error types shared across the agent's components.

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Failure talking to the key-value store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("store value could not be (de)serialized: {0}")]
    Serde(#[from] serde_json::Error),
}

/// The configuration cannot be used as written.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid booking URL pattern '{pattern}': {source}")]
    BookingPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    /// Without patterns no request is ever treated as a booking confirmation.
    #[error("safety.bookingUrlPatterns is empty")]
    NoBookingPatterns,
}

/// Rejections raised by the safety-guarded gateway.
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    /// The breaker is open; nothing was sent and the rate counter is untouched.
    #[error("circuit breaker open until {until}")]
    CircuitOpen { until: DateTime<Utc> },

    /// This call pushed the trailing minute over the ceiling and opened the breaker.
    #[error("rate limit exceeded ({count} requests in the last minute)")]
    RateLimited { count: u32 },

    /// A reservation-confirming request was refused before it left the process.
    #[error("safety block: {0}")]
    SafetyBlocked(String),

    #[error("transport error: {0}")]
    Transport(String),
}

/// Errors surfaced by a site adapter.
#[derive(Debug, Error)]
pub enum SiteError {
    /// The remote site no longer accepts the session token.
    #[error("session expired")]
    SessionExpired,

    /// Network hiccup or an unparsable page; the next tick retries.
    #[error("transient site error: {0}")]
    Transient(String),

    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

impl SiteError {
    /// Returns true when the error came from the rate limiter or breaker.
    pub fn is_breaker_trip(&self) -> bool {
        matches!(
            self,
            SiteError::Gateway(GatewayError::CircuitOpen { .. })
                | SiteError::Gateway(GatewayError::RateLimited { .. })
        )
    }
}

/// Errors from obtaining a login session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Login is halted until an explicit resume.
    #[error("login halted until {until}: {reason}")]
    Halted { until: DateTime<Utc>, reason: String },

    #[error("login backing off for another {remaining_secs}s")]
    BackingOff { remaining_secs: i64 },

    #[error("timed out waiting for the login lock")]
    LockTimeout,

    /// The site answered but refused the credentials.
    #[error("login rejected by site")]
    LoginRejected,

    #[error(transparent)]
    Site(#[from] SiteError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Why a reservation attempt did not go ahead or did not succeed.
#[derive(Debug, Error)]
pub enum ReservationError {
    /// Another reservation for this agent is still running.
    #[error("another reservation is already in progress")]
    Busy,

    #[error("{0}")]
    QuotaExceeded(String),

    #[error("{facility_id} {date} {time_slot} is not on the allow-list")]
    NotAllowListed {
        facility_id: String,
        date: String,
        time_slot: String,
    },

    #[error("slot already booked")]
    AlreadyBooked,

    #[error("reservation failed: {0}")]
    Failed(String),

    #[error(transparent)]
    Site(#[from] SiteError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ReservationError {
    /// Safety rejections are never retried automatically.
    pub fn is_safety_block(&self) -> bool {
        matches!(
            self,
            ReservationError::QuotaExceeded(_)
                | ReservationError::NotAllowListed { .. }
                | ReservationError::Site(SiteError::Gateway(GatewayError::SafetyBlocked(_)))
        )
    }
}
