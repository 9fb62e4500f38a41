//! HTTP collaborator boundary
//!
//! Operations never touch `reqwest` directly. They build an [`ApiRequest`]
//! with the helpers in [`computer`] and hand it to an [`ApiClient`]; the
//! production client is [`HttpApiClient`], tests plug in fakes.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::error::{LoadError, Result, TransportError};

/// Request method
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Delete,
}

/// Transport-independent request description
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: Method,
    /// Unencoded path segments below the base URL
    pub segments: Vec<String>,
    /// Unencoded query pairs, in order
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
    pub timeout: Option<Duration>,
}

impl ApiRequest {
    pub fn new(method: Method, segments: &[&str]) -> Self {
        Self {
            method,
            segments: segments.iter().map(|s| s.to_string()).collect(),
            query: Vec::new(),
            body: None,
            timeout: None,
        }
    }

    pub fn query(mut self, key: &str, value: impl Into<String>) -> Self {
        self.query.push((key.to_string(), value.into()));
        self
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Unencoded path, for logs and assertions
    pub fn path(&self) -> String {
        format!("/{}", self.segments.join("/"))
    }

    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Raw response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: String,
}

impl ApiResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }
}

/// Executes one request against the target service
#[async_trait]
pub trait ApiClient: Send + Sync {
    async fn send(&self, request: ApiRequest) -> std::result::Result<ApiResponse, TransportError>;
}

/// Request builders for the `/computer` resource
pub mod computer {
    use super::{ApiRequest, Method};
    use crate::cursor::Cursor;
    use serde_json::Value;

    const RESOURCE: &str = "computer";

    /// `POST /computer`
    pub fn create(payload: Value) -> ApiRequest {
        ApiRequest::new(Method::Post, &[RESOURCE]).json(payload)
    }

    /// `GET /computer/pagination?createdAt=..&id=..&limit=..`
    ///
    /// Cursor parameters are omitted for the first page.
    pub fn paginate(cursor: Option<&Cursor>, limit: u32) -> ApiRequest {
        let mut request = ApiRequest::new(Method::Get, &[RESOURCE, "pagination"]);
        if let Some(cursor) = cursor {
            for (key, value) in cursor.query_pairs() {
                request = request.query(key, value);
            }
        }
        request.query("limit", limit.to_string())
    }

    /// `GET /computer/search/gpu/{term}`
    pub fn search_gpu(term: &str) -> ApiRequest {
        ApiRequest::new(Method::Get, &[RESOURCE, "search", "gpu", term])
    }

    /// `GET /computer/search/ram/{capacity}`
    pub fn search_ram(capacity_gb: u32) -> ApiRequest {
        ApiRequest::new(
            Method::Get,
            &[RESOURCE, "search", "ram", &capacity_gb.to_string()],
        )
    }

    /// `DELETE /computer/{name}`
    pub fn delete(name: &str) -> ApiRequest {
        ApiRequest::new(Method::Delete, &[RESOURCE, name])
    }
}

// ============================================================================
// REQWEST CLIENT
// ============================================================================

/// [`ApiClient`] backed by a pooled `reqwest::Client`
pub struct HttpApiClient {
    client: reqwest::Client,
    base: reqwest::Url,
}

impl HttpApiClient {
    /// Build a client for `base_url`
    pub fn new(base_url: &str, request_timeout: Duration, max_idle_per_host: usize) -> Result<Self> {
        let base = reqwest::Url::parse(base_url)
            .map_err(|_| LoadError::InvalidBaseUrl(base_url.to_string()))?;
        if base.cannot_be_a_base() {
            return Err(LoadError::InvalidBaseUrl(base_url.to_string()));
        }

        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .pool_max_idle_per_host(max_idle_per_host)
            .build()
            .map_err(|e| LoadError::ClientBuild(e.to_string()))?;

        Ok(Self { client, base })
    }

    /// Absolute URL for a request, percent-encoding segments and query
    pub fn url_for(&self, request: &ApiRequest) -> reqwest::Url {
        let mut url = self.base.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty();
            segments.extend(request.segments.iter());
        }
        if !request.query.is_empty() {
            url.query_pairs_mut().extend_pairs(request.query.iter());
        }
        url
    }
}

#[async_trait]
impl ApiClient for HttpApiClient {
    async fn send(&self, request: ApiRequest) -> std::result::Result<ApiResponse, TransportError> {
        let url = self.url_for(&request);
        debug!("{:?} {}", request.method, url);

        let mut builder = match request.method {
            Method::Get => self.client.get(url),
            Method::Post => self.client.post(url),
            Method::Delete => self.client.delete(url),
        };
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        Ok(ApiResponse { status, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::Cursor;
    use serde_json::json;

    fn client(base: &str) -> HttpApiClient {
        HttpApiClient::new(base, Duration::from_secs(5), 8).unwrap()
    }

    #[test]
    fn test_first_page_has_only_limit() {
        let request = computer::paginate(None, 50);
        let url = client("http://localhost:8080").url_for(&request);
        assert_eq!(url.as_str(), "http://localhost:8080/computer/pagination?limit=50");
    }

    #[test]
    fn test_cursor_page_query() {
        let cursor = Cursor::new("2024-05-01T10:00:00.123+00:00", 42);
        let request = computer::paginate(Some(&cursor), 20);
        assert_eq!(request.query_value("id"), Some("42"));
        let url = client("http://localhost:8080").url_for(&request);
        assert_eq!(
            url.as_str(),
            "http://localhost:8080/computer/pagination?createdAt=2024-05-01T10%3A00%3A00.123%2B00%3A00&id=42&limit=20"
        );
    }

    #[test]
    fn test_search_and_delete_paths() {
        let c = client("http://svc:9000/api/");
        assert_eq!(
            c.url_for(&computer::search_gpu("RTX 4090")).as_str(),
            "http://svc:9000/api/computer/search/gpu/RTX%204090"
        );
        assert_eq!(
            c.url_for(&computer::search_ram(64)).as_str(),
            "http://svc:9000/api/computer/search/ram/64"
        );
        assert_eq!(
            c.url_for(&computer::delete("PC-a/b")).as_str(),
            "http://svc:9000/api/computer/PC-a%2Fb"
        );
    }

    #[test]
    fn test_create_carries_body() {
        let request = computer::create(json!({ "name": "PC-1" }));
        assert_eq!(request.method, Method::Post);
        assert_eq!(request.path(), "/computer");
        assert_eq!(request.body.unwrap()["name"], "PC-1");
    }

    #[test]
    fn test_rejects_bad_base_url() {
        assert!(matches!(
            HttpApiClient::new("not a url", Duration::from_secs(1), 1),
            Err(LoadError::InvalidBaseUrl(_))
        ));
        assert!(matches!(
            HttpApiClient::new("mailto:ops@example.com", Duration::from_secs(1), 1),
            Err(LoadError::InvalidBaseUrl(_))
        ));
    }
}
