//! Remote action classification and canned responses for mock mode.

use std::collections::BTreeMap;

use regex::Regex;
use serde_json::json;
use url::Url;
use uuid::Uuid;

use super::http::{HttpRequest, HttpResponse};

/// What a request is trying to do on the remote site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteAction {
    Login,
    Availability,
    /// Confirms a reservation; the only action that mutates remote state.
    Reservation,
    Other,
}

impl RemoteAction {
    /// Classify a request URL. `booking_patterns` decide what counts as a
    /// reservation confirmation; the rest is guessed from the path.
    pub fn classify(url: &str, booking_patterns: &[Regex]) -> Self {
        if booking_patterns.iter().any(|re| re.is_match(url)) {
            return RemoteAction::Reservation;
        }
        let path = Url::parse(url)
            .map(|u| u.path().to_lowercase())
            .unwrap_or_else(|_| url.to_lowercase());
        if path.contains("login") || path.contains("auth") || path.contains("signin") {
            RemoteAction::Login
        } else if ["avail", "vacan", "calendar", "search", "slot"]
            .iter()
            .any(|needle| path.contains(needle))
        {
            RemoteAction::Availability
        } else {
            RemoteAction::Other
        }
    }
}

/// Canned answer for `request` in mock mode.
pub fn canned_response(action: RemoteAction, request: &HttpRequest) -> HttpResponse {
    let body = match action {
        RemoteAction::Login => json!({
            "ok": true,
            "token": format!("mock-session-{}", &Uuid::new_v4().to_string()[..8]),
        }),
        RemoteAction::Availability => json!({
            "available": true,
            "status": "mock-open",
        }),
        RemoteAction::Reservation => json!({
            "success": true,
            "message": "mock reservation accepted",
            "reservationId": format!("MOCK-{}", &Uuid::new_v4().to_string()[..8]),
        }),
        RemoteAction::Other => json!({ "ok": true, "url": request.url }),
    };

    let mut headers = BTreeMap::new();
    headers.insert("content-type".to_string(), "application/json".to_string());
    headers.insert("x-slotwatch-mock".to_string(), "1".to_string());
    HttpResponse {
        status: 200,
        headers,
        body: body.to_string(),
    }
}
