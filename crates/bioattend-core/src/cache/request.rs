use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE, ETAG};
use reqwest::{Method, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

/// An outgoing request as seen by the cache router.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Vec<u8>>,
}

impl HttpRequest {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
        }
    }

    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post_json<B: Serialize>(url: Url, body: &B) -> serde_json::Result<Self> {
        let mut request = Self::new(Method::POST, url);
        request.body = Some(serde_json::to_vec(body)?);
        request
            .headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(request)
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Cache key for this request, taking `vary_headers` into account.
    pub fn identity(&self, vary_headers: &[String]) -> RequestIdentity {
        RequestIdentity::new(&self.method, &self.url, &self.headers, vary_headers)
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: StatusCode, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    pub fn json<B: Serialize>(status: StatusCode, body: &B) -> serde_json::Result<Self> {
        let mut response = Self::new(status, serde_json::to_vec(body)?);
        response
            .headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(response)
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok())
    }

    pub fn etag(&self) -> Option<&str> {
        self.headers.get(ETAG).and_then(|v| v.to_str().ok())
    }

    pub fn parse_json<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.body)
    }
}

/// Request identity: method, normalised URL and the relevant headers.
///
/// The `key` is a SHA-256 digest of those parts, so keys are fixed-length and
/// never contain credentials in clear text.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestIdentity {
    key: String,
    method: String,
    url: String,
}

impl RequestIdentity {
    pub fn new(method: &Method, url: &Url, headers: &HeaderMap, vary_headers: &[String]) -> Self {
        let mut url = url.clone();
        url.set_fragment(None);

        let mut vary: Vec<String> = vary_headers.iter().map(|h| h.to_ascii_lowercase()).collect();
        vary.sort();
        vary.dedup();

        let mut input = format!("{}\n{}\n", method.as_str(), url.as_str());
        for name in &vary {
            let value = headers
                .get(name.as_str())
                .and_then(|v| v.to_str().ok())
                .unwrap_or("");
            input.push_str(&format!("{}:{}\n", name, value));
        }

        let mut hasher = Sha256::new();
        hasher.update(input.as_bytes());

        Self {
            key: hex::encode(hasher.finalize()),
            method: method.as_str().to_string(),
            url: url.to_string(),
        }
    }

    /// Rebuild an identity loaded from storage.
    pub(crate) fn from_parts(key: String, method: String, url: String) -> Self {
        Self { key, method, url }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}
