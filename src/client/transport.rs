use async_trait::async_trait;
use http::{header, HeaderMap, Method};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use crate::errors::ServiceError;

#[cfg(test)]
use mockall::automock;

/// One outbound operation against the inventory API, relative to the base URL.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
    /// Ask the server for an exact total count of a list read.
    pub exact_count: bool,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
            exact_count: false,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    pub fn query(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((key.into(), value.to_string()));
        self
    }

    pub fn json<T: Serialize>(mut self, body: &T) -> Result<Self, ServiceError> {
        self.body = Some(serde_json::to_value(body)?);
        Ok(self)
    }

    pub fn exact_count(mut self) -> Self {
        self.exact_count = true;
        self
    }
}

/// Status, headers and body of a response, before classification.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: String,
}

#[derive(Debug, Deserialize)]
struct RemoteErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default, alias = "error")]
    message: Option<String>,
}

impl RawResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Converts a non-2xx response to a `method` request into a classified error.
    ///
    /// A 409 on a write is the remote's stale-version answer and maps to
    /// `VersionConflict`; on a read it stays a plain `RemoteApi` error.
    pub fn error_for_status(self, method: &Method) -> Result<Self, ServiceError> {
        if self.is_success() {
            return Ok(self);
        }

        let (code, message) = match serde_json::from_str::<RemoteErrorBody>(&self.body) {
            Ok(parsed) => (parsed.code, parsed.message.unwrap_or_else(|| self.body.clone())),
            Err(_) => (None, self.body.clone()),
        };

        if self.status == 409 && is_write(method) {
            return Err(ServiceError::VersionConflict { code, message });
        }

        Err(ServiceError::RemoteApi {
            status: self.status,
            code,
            message,
        })
    }

    /// Total from a `Content-Range: <from>-<to>/<total>` header.
    pub fn total_count(&self) -> Option<u64> {
        let value = self.headers.get(header::CONTENT_RANGE)?.to_str().ok()?;
        let (_, total) = value.rsplit_once('/')?;
        total.trim().parse().ok()
    }
}

fn is_write(method: &Method) -> bool {
    matches!(*method, Method::PUT | Method::POST | Method::PATCH | Method::DELETE)
}

/// The wire. Implemented over reqwest in production and mocked in tests.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: &ApiRequest) -> Result<RawResponse, ServiceError>;
}

/// Transport bound to a single versioned collection root with a bearer credential.
#[derive(Clone)]
pub struct ReqwestTransport {
    client: Client,
    base_url: String,
    api_key: String,
}

impl ReqwestTransport {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self, ServiceError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ServiceError::ConfigError(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self::with_client(client, base_url, api_key))
    }

    /// Build a transport from an existing client (useful for testing).
    pub fn with_client(client: Client, base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }

    fn url_for(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: &ApiRequest) -> Result<RawResponse, ServiceError> {
        let url = self.url_for(&request.path);
        debug!(method = %request.method, url = %url, "Sending inventory API request");

        let mut builder = self
            .client
            .request(request.method.clone(), &url)
            .bearer_auth(&self.api_key)
            .header(header::ACCEPT, "application/json");

        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if request.exact_count {
            builder = builder.header("Prefer", "count=exact");
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| ServiceError::Transport(e.to_string()))?;

        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response
            .text()
            .await
            .map_err(|e| ServiceError::Transport(e.to_string()))?;

        Ok(RawResponse {
            status,
            headers,
            body,
        })
    }
}
