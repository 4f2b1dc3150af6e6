//! HTTP transport seam used by `RequestClient`.
//!
//! Production code talks to the backend through `ReqwestTransport`; tests
//! substitute a scripted transport so no network is needed.

use anyhow::Result;
use async_trait::async_trait;
use reqwest::{header, Client, Method};
use serde::Serialize;
use tracing::debug;

use super::RequestError;

/// A fully described outgoing request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub body: Option<String>,
    pub headers: Vec<(String, String)>,
}

impl HttpRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            body: None,
            headers: Vec::new(),
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::POST, url)
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    /// Replace any existing `Authorization` header with a bearer token.
    pub fn bearer(mut self, token: &str) -> Self {
        self.headers
            .retain(|(name, _)| !name.eq_ignore_ascii_case(header::AUTHORIZATION.as_str()));
        self.header(header::AUTHORIZATION.as_str(), format!("Bearer {}", token))
    }

    /// Serialize `body` as the JSON payload and set the content type.
    pub fn json<B: Serialize>(mut self, body: &B) -> Result<Self, RequestError> {
        let encoded = serde_json::to_string(body).map_err(|e| RequestError::Validation {
            field: "body".to_string(),
            message: e.to_string(),
        })?;
        self.body = Some(encoded);
        Ok(self.header(header::CONTENT_TYPE.as_str(), "application/json"))
    }

    /// Value of the first header with the given name (case-insensitive).
    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// The raw outcome of a request that reached the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: String,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_json(&self) -> bool {
        self.content_type
            .as_deref()
            .map(|ct| ct.contains("application/json"))
            .unwrap_or(false)
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Perform one request. Only failures to obtain a response are errors;
    /// non-2xx statuses are returned as ordinary responses.
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, RequestError>;
}

/// Transport backed by a shared `reqwest::Client`.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self> {
        let client = Client::builder().build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, RequestError> {
        debug!(method = %request.method, url = %request.url, "Sending request");

        let mut builder = self.client.request(request.method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.text().await?;

        Ok(HttpResponse {
            status,
            content_type,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_bearer_replaces_existing_authorization() {
        let request = HttpRequest::get("http://localhost/recipes")
            .header("authorization", "Bearer old")
            .header("Accept", "application/json")
            .bearer("new");

        assert_eq!(request.header_value("Authorization"), Some("Bearer new"));
        assert_eq!(request.headers.len(), 2);
    }

    #[test]
    fn test_json_sets_body_and_content_type() {
        let request = HttpRequest::post("http://localhost/auth/login")
            .json(&json!({"email": "a@b.c", "passwordHash": "pw"}))
            .expect("json body");

        assert_eq!(request.header_value("content-type"), Some("application/json"));
        let body: serde_json::Value =
            serde_json::from_str(request.body.as_deref().unwrap_or_default()).unwrap();
        assert_eq!(body["email"], "a@b.c");
    }

    #[test]
    fn test_response_classification() {
        let ok = HttpResponse {
            status: 204,
            content_type: Some("application/json; charset=utf-8".to_string()),
            body: String::new(),
        };
        assert!(ok.is_success());
        assert!(ok.is_json());

        let not_found = HttpResponse {
            status: 404,
            content_type: None,
            body: "missing".to_string(),
        };
        assert!(!not_found.is_success());
        assert!(!not_found.is_json());
    }
}
