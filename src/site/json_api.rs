//! Adapter for booking sites that expose a small JSON API.
//!
//! Endpoints, relative to the configured base URL:
//!
//! - `POST api/login` with `{username, password}` → `{token, context?}`
//! - `GET api/availability?facility=&date=&slot=` → `{available, status}`
//! - `POST reserve/confirm` with the booking fields → `{success, message}`
//!
//! A 401 from the availability or booking endpoints means the session expired.

use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::{json, Value};
use tracing::debug;
use url::Url;

use super::base::{Availability, Credentials, ReservationOutcome, ReservationRequest, SiteAdapter};
use crate::error::SiteError;
use crate::gateway::{HttpClient, HttpRequest, HttpResponse};
use crate::session::SessionRecord;

pub struct JsonApiAdapter {
    site_id: String,
    base_url: Url,
}

impl JsonApiAdapter {
    /// Create an adapter for `base_url` (a trailing slash is added if missing).
    pub fn new(site_id: &str, base_url: &str) -> Result<Self, url::ParseError> {
        let normalized = if base_url.ends_with('/') {
            base_url.to_string()
        } else {
            format!("{}/", base_url)
        };
        Ok(Self {
            site_id: site_id.to_string(),
            base_url: Url::parse(&normalized)?,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, SiteError> {
        self.base_url
            .join(path)
            .map_err(|e| SiteError::Transient(format!("bad endpoint {}: {}", path, e)))
    }
}

fn parse_body(response: &HttpResponse) -> Result<Value, SiteError> {
    response
        .json()
        .map_err(|e| SiteError::Transient(format!("unparsable response: {}", e)))
}

fn check_status(response: &HttpResponse) -> Result<(), SiteError> {
    match response.status {
        401 | 403 => Err(SiteError::SessionExpired),
        s if (200..300).contains(&s) => Ok(()),
        s => Err(SiteError::Transient(format!("HTTP {}", s))),
    }
}

#[async_trait]
impl SiteAdapter for JsonApiAdapter {
    fn site_id(&self) -> &str {
        &self.site_id
    }

    async fn login(
        &self,
        client: &dyn HttpClient,
        credentials: &Credentials,
    ) -> Result<Option<SessionRecord>, SiteError> {
        let url = self.endpoint("api/login")?;
        let body = json!({
            "username": credentials.username,
            "password": credentials.password,
        });
        let response = client.send(HttpRequest::post_json(url.as_str(), &body)).await?;
        if matches!(response.status, 401 | 403) {
            return Ok(None);
        }
        check_status(&response)?;

        let data = parse_body(&response)?;
        match data.get("token").and_then(|v| v.as_str()) {
            Some(token) if !token.is_empty() => {
                let context = data.get("context").cloned().filter(|c| !c.is_null());
                Ok(Some(SessionRecord::new(token.to_string(), context)))
            }
            _ => Ok(None),
        }
    }

    async fn check_availability(
        &self,
        client: &dyn HttpClient,
        facility_id: &str,
        date: NaiveDate,
        time_slot: &str,
        _credentials: &Credentials,
        session: &SessionRecord,
    ) -> Result<Availability, SiteError> {
        let mut url = self.endpoint("api/availability")?;
        url.query_pairs_mut()
            .append_pair("facility", facility_id)
            .append_pair("date", &date.format("%Y-%m-%d").to_string())
            .append_pair("slot", time_slot);

        let request = HttpRequest::get(url.as_str())
            .header("Authorization", format!("Bearer {}", session.token));
        let response = client.send(request).await?;
        check_status(&response)?;

        let data = parse_body(&response)?;
        let available = data
            .get("available")
            .and_then(|v| v.as_bool())
            .ok_or_else(|| SiteError::Transient("missing 'available'".to_string()))?;
        let current_status = data
            .get("status")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        debug!(
            "{}: {} {} {} -> {} ({})",
            self.site_id, facility_id, date, time_slot, available, current_status
        );
        Ok(Availability {
            available,
            current_status,
        })
    }

    async fn make_reservation(
        &self,
        client: &dyn HttpClient,
        request: ReservationRequest<'_>,
    ) -> Result<ReservationOutcome, SiteError> {
        let url = self.endpoint("reserve/confirm")?;
        let body = json!({
            "facility": request.facility_id,
            "date": request.date.format("%Y-%m-%d").to_string(),
            "slot": request.time_slot,
            "options": request.options,
            "context": request.session.context,
            "dryRun": request.dry_run,
        });
        let http = HttpRequest::post_json(url.as_str(), &body)
            .header("Authorization", format!("Bearer {}", request.session.token));
        let response = client.send(http).await?;
        check_status(&response)?;

        let data = parse_body(&response)?;
        Ok(ReservationOutcome {
            success: data.get("success").and_then(|v| v.as_bool()).unwrap_or(false),
            message: data
                .get("message")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    use super::*;
    use crate::error::GatewayError;

    /// Replays canned responses and records the requests it saw.
    struct Replay {
        responses: Mutex<Vec<HttpResponse>>,
        seen: Mutex<Vec<HttpRequest>>,
    }

    impl Replay {
        fn new(responses: Vec<(u16, &str)>) -> Self {
            Self {
                responses: Mutex::new(
                    responses
                        .into_iter()
                        .rev()
                        .map(|(status, body)| HttpResponse {
                            status,
                            headers: BTreeMap::new(),
                            body: body.to_string(),
                        })
                        .collect(),
                ),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl HttpClient for Replay {
        async fn send(&self, request: HttpRequest) -> Result<HttpResponse, GatewayError> {
            self.seen.lock().unwrap().push(request);
            self.responses
                .lock()
                .unwrap()
                .pop()
                .ok_or_else(|| GatewayError::Transport("no more responses".to_string()))
        }
    }

    fn creds() -> Credentials {
        Credentials {
            username: "taro".to_string(),
            password: "pw".to_string(),
        }
    }

    #[tokio::test]
    async fn test_login_success_and_rejection() {
        let adapter = JsonApiAdapter::new("city", "https://city.example/booking").unwrap();
        let client = Replay::new(vec![(200, r#"{"token":"abc","context":{"k":1}}"#), (401, "")]);

        let session = adapter.login(&client, &creds()).await.unwrap().unwrap();
        assert_eq!(session.token, "abc");
        assert_eq!(session.context, Some(json!({"k": 1})));
        assert!(adapter.login(&client, &creds()).await.unwrap().is_none());

        let seen = client.seen.lock().unwrap();
        assert_eq!(seen[0].url, "https://city.example/booking/api/login");
    }

    #[tokio::test]
    async fn test_availability_query_and_expiry() {
        let adapter = JsonApiAdapter::new("city", "https://city.example/").unwrap();
        let client = Replay::new(vec![
            (200, r#"{"available":false,"status":"キャンセル待ち"}"#),
            (401, ""),
            (200, "<html>maintenance</html>"),
        ]);
        let session = SessionRecord::new("tok".to_string(), None);
        let date = NaiveDate::from_ymd_opt(2026, 11, 7).unwrap();

        let a = adapter
            .check_availability(&client, "court-1", date, "09:00", &creds(), &session)
            .await
            .unwrap();
        assert!(!a.available);
        assert_eq!(a.current_status, "キャンセル待ち");

        let expired = adapter
            .check_availability(&client, "court-1", date, "09:00", &creds(), &session)
            .await;
        assert!(matches!(expired, Err(SiteError::SessionExpired)));

        let garbled = adapter
            .check_availability(&client, "court-1", date, "09:00", &creds(), &session)
            .await;
        assert!(matches!(garbled, Err(SiteError::Transient(_))));

        let seen = client.seen.lock().unwrap();
        assert!(seen[0].url.contains("date=2026-11-07"));
        assert_eq!(seen[0].headers.get("Authorization").unwrap(), "Bearer tok");
    }

    #[tokio::test]
    async fn test_reservation_posts_to_confirm() {
        let adapter = JsonApiAdapter::new("city", "https://city.example").unwrap();
        let client = Replay::new(vec![(200, r#"{"success":true,"message":"ok"}"#)]);
        let session = SessionRecord::new("tok".to_string(), None);
        let options = json!({});
        let outcome = adapter
            .make_reservation(
                &client,
                ReservationRequest {
                    facility_id: "court-1",
                    date: NaiveDate::from_ymd_opt(2026, 11, 7).unwrap(),
                    time_slot: "09:00",
                    session: &session,
                    options: &options,
                    dry_run: true,
                },
            )
            .await
            .unwrap();
        assert!(outcome.success);
        let seen = client.seen.lock().unwrap();
        assert_eq!(seen[0].url, "https://city.example/reserve/confirm");
        assert!(seen[0].body.as_deref().unwrap().contains("\"dryRun\":true"));
    }
}
