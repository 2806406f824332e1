use chrono::{DateTime, Duration, Utc};
use reqwest::header::{HeaderValue, CONTENT_TYPE, ETAG};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::request::{HttpResponse, RequestIdentity};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheStrategy {
    CacheFirst,
    NetworkFirst,
}

impl CacheStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStrategy::CacheFirst => "CacheFirst",
            CacheStrategy::NetworkFirst => "NetworkFirst",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CacheFirst" => Some(CacheStrategy::CacheFirst),
            "NetworkFirst" => Some(CacheStrategy::NetworkFirst),
            _ => None,
        }
    }
}

/// A stored response.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: RequestIdentity,
    pub status: u16,
    pub content_type: Option<String>,
    pub payload: Vec<u8>,
    pub strategy: CacheStrategy,
    pub stored_at: DateTime<Utc>,
    /// Response `ETag` when the server sent one, otherwise SHA-256 of the payload.
    pub etag_or_hash: String,
}

impl CacheEntry {
    pub fn from_response(key: RequestIdentity, response: &HttpResponse, strategy: CacheStrategy) -> Self {
        let etag_or_hash = match response.etag() {
            Some(etag) => etag.to_string(),
            None => {
                let mut hasher = Sha256::new();
                hasher.update(&response.body);
                hex::encode(hasher.finalize())
            }
        };

        Self {
            key,
            status: response.status.as_u16(),
            content_type: response.content_type().map(String::from),
            payload: response.body.clone(),
            strategy,
            stored_at: Utc::now(),
            etag_or_hash,
        }
    }

    /// Rebuild the HTTP response this entry was stored from.
    pub fn to_response(&self) -> HttpResponse {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::OK);
        let mut response = HttpResponse::new(status, self.payload.clone());
        if let Some(ct) = self.content_type.as_deref().and_then(|ct| HeaderValue::from_str(ct).ok()) {
            response.headers.insert(CONTENT_TYPE, ct);
        }
        if let Ok(etag) = HeaderValue::from_str(&self.etag_or_hash) {
            response.headers.insert(ETAG, etag);
        }
        response
    }

    pub fn age_minutes(&self) -> i64 {
        (Utc::now() - self.stored_at).num_minutes()
    }

    pub fn age_display(&self) -> String {
        let minutes = self.age_minutes();
        if minutes < 1 {
            // Also covers clock skew
            "just now".to_string()
        } else if minutes < 60 {
            format!("{}m ago", minutes)
        } else if minutes < 1440 {
            format!("{}h ago", minutes / 60)
        } else {
            format!("{}d ago", minutes / 1440)
        }
    }

    /// Whether the entry has outlived a route's `max_age`.
    pub fn is_expired(&self, max_age: Option<Duration>) -> bool {
        match max_age {
            Some(max_age) => Utc::now() - self.stored_at > max_age,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderMap;
    use reqwest::Method;
    use url::Url;

    fn identity() -> RequestIdentity {
        let url = Url::parse("http://localhost:5000/api/events").unwrap();
        RequestIdentity::new(&Method::GET, &url, &HeaderMap::new(), &[])
    }

    #[test]
    fn test_from_response_prefers_etag() {
        let mut response = HttpResponse::new(StatusCode::OK, b"[]".to_vec());
        response.headers.insert(ETAG, HeaderValue::from_static("\"abc\""));
        let entry = CacheEntry::from_response(identity(), &response, CacheStrategy::NetworkFirst);
        assert_eq!(entry.etag_or_hash, "\"abc\"");
    }

    #[test]
    fn test_from_response_hashes_payload_without_etag() {
        let response = HttpResponse::new(StatusCode::OK, b"[]".to_vec());
        let entry = CacheEntry::from_response(identity(), &response, CacheStrategy::CacheFirst);
        assert_eq!(entry.etag_or_hash.len(), 64);

        let same = CacheEntry::from_response(identity(), &response, CacheStrategy::CacheFirst);
        assert_eq!(entry.etag_or_hash, same.etag_or_hash);
    }

    #[test]
    fn test_to_response_restores_content_type() {
        let response = HttpResponse::json(StatusCode::OK, &serde_json::json!({"id": 1})).unwrap();
        let entry = CacheEntry::from_response(identity(), &response, CacheStrategy::NetworkFirst);
        let restored = entry.to_response();
        assert_eq!(restored.status, StatusCode::OK);
        assert_eq!(restored.content_type(), Some("application/json"));
        assert_eq!(restored.body, response.body);
    }

    #[test]
    fn test_age_and_expiry() {
        let response = HttpResponse::new(StatusCode::OK, Vec::new());
        let mut entry = CacheEntry::from_response(identity(), &response, CacheStrategy::CacheFirst);
        assert_eq!(entry.age_display(), "just now");
        assert!(!entry.is_expired(Some(Duration::hours(1))));

        entry.stored_at = Utc::now() - Duration::hours(3);
        assert_eq!(entry.age_display(), "3h ago");
        assert!(entry.is_expired(Some(Duration::hours(1))));
        assert!(!entry.is_expired(None));
    }
}
