//! HTTP client for the check-in backend.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::{header, Client};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, warn};
use url::Url;

use super::ApiError;
use crate::cache::{HttpRequest, HttpResponse, Network};
use crate::connectivity::Reachability;
use crate::models::{
    CheckInRequest, CheckInResponse, NewEvent, NewSession, RegisterResponse, Registration,
    SyncAck, SyncBatch, TimeRange,
};
use crate::sync::RemoteApi;

// ============================================================================
// Constants
// ============================================================================

/// Default backend location: the development server with the API mounted under `/api`.
pub const DEFAULT_API_BASE_URL: &str = "http://localhost:5000/api";

/// Maximum number of retries for rate-limited (429) requests.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
const INITIAL_BACKOFF_MS: u64 = 1000;

/// Timeout for reachability probes. Kept short so a dead link is noticed quickly.
const PROBE_TIMEOUT_SECS: u64 = 5;

/// API client for the check-in backend.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: Url,
    token: Option<String>,
    timeout_secs: u64,
}

impl ApiClient {
    /// Create a client for `base_url` with a per-request timeout.
    pub fn new(base_url: &str, timeout_secs: u64) -> anyhow::Result<Self> {
        let mut base_url =
            Url::parse(base_url).with_context(|| format!("Invalid API base URL: {}", base_url))?;
        // Url::join replaces the last segment unless the path ends with '/'
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url,
            token: None,
            timeout_secs,
        })
    }

    /// Create a new ApiClient with the given token, sharing the connection pool.
    pub fn with_token(&self, token: String) -> Self {
        Self {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            token: Some(token),
            timeout_secs: self.timeout_secs,
        }
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn has_token(&self) -> bool {
        self.token.is_some()
    }

    /// Absolute URL for an API path such as `events/3/sessions`.
    pub fn endpoint(&self, path: &str) -> Result<Url, ApiError> {
        self.base_url
            .join(path.trim_start_matches('/'))
            .map_err(|e| ApiError::InvalidResponse(format!("Bad endpoint '{}': {}", path, e)))
    }

    // ===== Read endpoints (routed through the response cache) =====

    pub fn events_url(&self) -> Result<Url, ApiError> {
        self.endpoint("events")
    }

    pub fn sessions_url(&self, event_id: i64) -> Result<Url, ApiError> {
        self.endpoint(&format!("events/{}/sessions", event_id))
    }

    pub fn users_url(&self) -> Result<Url, ApiError> {
        self.endpoint("users")
    }

    pub fn dashboard_url(&self, event_id: Option<i64>, time_range: TimeRange) -> Result<Url, ApiError> {
        let mut url = self.endpoint("dashboard")?;
        {
            let mut query = url.query_pairs_mut();
            if let Some(event_id) = event_id {
                query.append_pair("event_id", &event_id.to_string());
            }
            query.append_pair("time_range", time_range.as_str());
        }
        Ok(url)
    }

    fn auth_headers(&self) -> Result<header::HeaderMap, ApiError> {
        let mut headers = header::HeaderMap::new();
        if let Some(ref token) = self.token {
            let value = header::HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|_| ApiError::InvalidResponse("Token is not a valid header value".to_string()))?;
            headers.insert(header::AUTHORIZATION, value);
        }
        Ok(headers)
    }

    /// Classify a transport failure.
    fn transport_error(&self, e: reqwest::Error) -> ApiError {
        if e.is_timeout() {
            ApiError::Timeout(self.timeout_secs)
        } else if e.is_connect() {
            ApiError::Unreachable(e.to_string())
        } else {
            ApiError::NetworkError(e)
        }
    }

    /// Check if response is successful.
    /// Returns Ok(Some(response)) for success, Ok(None) for rate limit (should retry),
    /// or Err for other errors.
    async fn check_response_for_retry(
        response: reqwest::Response,
    ) -> Result<Option<reqwest::Response>, ApiError> {
        if response.status().is_success() {
            Ok(Some(response))
        } else if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            Ok(None)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body))
        }
    }

    async fn post<T: DeserializeOwned, B: Serialize>(&self, url: Url, body: &B) -> Result<T, ApiError> {
        let mut retries = 0;
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            let response = self
                .client
                .post(url.clone())
                .headers(self.auth_headers()?)
                .json(body)
                .send()
                .await
                .map_err(|e| self.transport_error(e))?;

            match Self::check_response_for_retry(response).await? {
                Some(response) => {
                    let text = response.text().await.map_err(|e| self.transport_error(e))?;
                    return serde_json::from_str(&text).map_err(|e| {
                        ApiError::InvalidResponse(format!("Failed to parse response from {}: {}", url, e))
                    });
                }
                None => {
                    // Rate limited
                    retries += 1;
                    if retries > MAX_RATE_LIMIT_RETRIES {
                        return Err(ApiError::RateLimited);
                    }
                    warn!(url = %url, retry = retries, backoff_ms = backoff_ms, "Rate limited, backing off");
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms *= 2; // Exponential backoff
                }
            }
        }
    }

    // ===== Write endpoints =====

    pub async fn register(&self, registration: &Registration) -> Result<RegisterResponse, ApiError> {
        debug!(phone = %registration.phone, "POST /register");
        self.post(self.endpoint("register")?, registration).await
    }

    pub async fn check_in(&self, request: &CheckInRequest) -> Result<CheckInResponse, ApiError> {
        debug!(
            identifier_type = request.identifier_type.as_str(),
            session_id = request.session_id,
            "POST /checkin"
        );
        self.post(self.endpoint("checkin")?, request).await
    }

    pub async fn sync_batch(&self, batch: &SyncBatch) -> Result<SyncAck, ApiError> {
        debug!(items = batch.len(), "POST /sync");
        self.post(self.endpoint("sync")?, batch).await
    }

    pub async fn create_event(&self, event: &NewEvent) -> Result<serde_json::Value, ApiError> {
        self.post(self.endpoint("events")?, event).await
    }

    pub async fn create_session(
        &self,
        event_id: i64,
        session: &NewSession,
    ) -> Result<serde_json::Value, ApiError> {
        self.post(self.endpoint(&format!("events/{}/sessions", event_id))?, session)
            .await
    }
}

#[async_trait]
impl Network for ApiClient {
    async fn fetch(&self, request: &HttpRequest) -> Result<HttpResponse, ApiError> {
        let mut builder = self
            .client
            .request(request.method.clone(), request.url.clone())
            .headers(request.headers.clone());

        // Credentials only go to the backend's own origin
        if request.url.origin() == self.base_url.origin()
            && !request.headers.contains_key(header::AUTHORIZATION)
        {
            builder = builder.headers(self.auth_headers()?);
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().await.map_err(|e| self.transport_error(e))?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await.map_err(|e| self.transport_error(e))?;

        Ok(HttpResponse {
            status,
            headers,
            body: body.to_vec(),
        })
    }
}

#[async_trait]
impl RemoteApi for ApiClient {
    async fn register(&self, registration: &Registration) -> Result<RegisterResponse, ApiError> {
        ApiClient::register(self, registration).await
    }

    async fn check_in(&self, request: &CheckInRequest) -> Result<CheckInResponse, ApiError> {
        ApiClient::check_in(self, request).await
    }

    async fn sync_batch(&self, batch: &SyncBatch) -> Result<SyncAck, ApiError> {
        ApiClient::sync_batch(self, batch).await
    }
}

#[async_trait]
impl Reachability for ApiClient {
    /// Any HTTP answer from the backend origin counts as reachable.
    async fn probe(&self) -> bool {
        let result = self
            .client
            .get(self.base_url.clone())
            .timeout(Duration::from_secs(PROBE_TIMEOUT_SECS))
            .send()
            .await;
        match result {
            Ok(_) => true,
            Err(e) => {
                debug!(error = %e, "Reachability probe failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CheckInStatus, IdentifierType};
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> ApiClient {
        ApiClient::new(&server.uri(), 5).unwrap()
    }

    fn checkin_request() -> CheckInRequest {
        CheckInRequest {
            identifier_type: IdentifierType::FallbackId,
            identifier_value: "4821".to_string(),
            event_id: 1,
            session_id: 2,
            device_id: "kiosk-1".to_string(),
            method: IdentifierType::FallbackId,
        }
    }

    #[test]
    fn test_endpoint_keeps_base_path() {
        let api = ApiClient::new("https://checkin.example.org/v1", 5).unwrap();
        assert_eq!(
            api.sessions_url(3).unwrap().as_str(),
            "https://checkin.example.org/v1/events/3/sessions"
        );
        assert_eq!(
            api.dashboard_url(Some(3), TimeRange::Week).unwrap().as_str(),
            "https://checkin.example.org/v1/dashboard?event_id=3&time_range=week"
        );
        assert_eq!(
            api.dashboard_url(None, TimeRange::AllTime).unwrap().as_str(),
            "https://checkin.example.org/v1/dashboard?time_range=all_time"
        );
    }

    #[tokio::test]
    async fn test_register_sends_bearer_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/register"))
            .and(header("Authorization", "Bearer secret"))
            .and(body_partial_json(json!({"name": "Ada", "phone": "5551234567"})))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "user_id": 12,
                "fallback_id": "4821",
                "message": "User registered successfully"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let api = client(&server).with_token("secret".to_string());
        let resp = api
            .register(&Registration {
                name: "Ada".to_string(),
                phone: "5551234567".to_string(),
                email: None,
                event_id: None,
            })
            .await
            .unwrap();
        assert_eq!(resp.user_id, 12);
        assert_eq!(resp.fallback_id.as_deref(), Some("4821"));
    }

    #[tokio::test]
    async fn test_check_in_conflict_is_definitive() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/checkin"))
            .respond_with(
                ResponseTemplate::new(409).set_body_json(json!({"status": "error", "message": "Duplicate"})),
            )
            .mount(&server)
            .await;

        let err = client(&server).check_in(&checkin_request()).await.unwrap_err();
        assert!(matches!(err, ApiError::Conflict(ref m) if m == "Duplicate"));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_check_in_warning_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/checkin"))
            .and(body_partial_json(json!({"identifier_type": "fallback_id", "method": "fallback_id"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "status": "warning",
                "message": "Already checked in",
                "user": {"id": 12, "name": "Ada"}
            })))
            .mount(&server)
            .await;

        let resp = client(&server).check_in(&checkin_request()).await.unwrap();
        assert_eq!(resp.status, CheckInStatus::Warning);
        assert_eq!(resp.user.map(|u| u.id), Some(12));
    }

    #[tokio::test]
    async fn test_rate_limit_retries_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/sync"))
            .respond_with(ResponseTemplate::new(429))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/sync"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"users": [], "checkins": []})))
            .mount(&server)
            .await;

        let ack = client(&server).sync_batch(&SyncBatch::default()).await.unwrap();
        assert!(ack.users.is_empty());
    }

    #[tokio::test]
    async fn test_fetch_returns_error_statuses_as_responses() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/dashboard"))
            .and(query_param("time_range", "today"))
            .and(header("Authorization", "Bearer secret"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let api = client(&server).with_token("secret".to_string());
        let url = api.dashboard_url(None, TimeRange::Today).unwrap();
        let response = api.fetch(&HttpRequest::get(url)).await.unwrap();
        assert_eq!(response.status, reqwest::StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_unreachable_host_is_transient() {
        // Nothing listens on port 9 locally
        let api = ApiClient::new("http://127.0.0.1:9", 2).unwrap();
        let err = api.sync_batch(&SyncBatch::default()).await.unwrap_err();
        assert!(err.is_transient());
        assert!(!api.probe().await);
    }
}
