//! Calls to the backend's `/auth` endpoints.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::api::{HttpRequest, RequestClient, RequestError};

/// Tokens issued by `/auth/login` and `/auth/register`.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    /// Access-token lifetime in seconds, when the backend states it.
    #[serde(default)]
    pub expires_in: Option<i64>,
}

/// Response of `/auth/refresh`.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshedToken {
    pub access_token: String,
    /// Present only when the backend rotates refresh tokens.
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<i64>,
}

impl std::fmt::Debug for TokenPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenPair")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

impl std::fmt::Debug for RefreshedToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RefreshedToken")
            .field("access_token", &"<redacted>")
            .field("rotated", &self.refresh_token.is_some())
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Credentials<'a> {
    email: &'a str,
    password_hash: &'a str,
}

/// Thin wrapper binding a `RequestClient` to the backend base URL.
#[derive(Clone)]
pub struct AuthApi {
    base_url: String,
    client: RequestClient,
}

impl AuthApi {
    pub fn new(base_url: impl Into<String>, client: RequestClient) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { base_url, client }
    }

    pub fn client(&self) -> &RequestClient {
        &self.client
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Absolute URL for a backend path such as `/recipes`.
    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<TokenPair, RequestError> {
        self.credentials_call("auth/login", email, password).await
    }

    pub async fn register(&self, email: &str, password: &str) -> Result<TokenPair, RequestError> {
        self.credentials_call("auth/register", email, password).await
    }

    pub async fn refresh(&self, refresh_token: &str) -> Result<RefreshedToken, RequestError> {
        if refresh_token.is_empty() {
            return Err(RequestError::validation("refreshToken", "No refresh token available"));
        }
        let request = HttpRequest::post(self.url("auth/refresh")).bearer(refresh_token);
        self.client.send_json(request).await
    }

    /// Server-side invalidation of the access token.
    pub async fn logout(&self, access_token: &str) -> Result<(), RequestError> {
        let request = HttpRequest::post(self.url("auth/logout")).bearer(access_token);
        self.client.send(request).await.map(|_| ())
    }

    async fn credentials_call(
        &self,
        path: &str,
        email: &str,
        password: &str,
    ) -> Result<TokenPair, RequestError> {
        let email = email.trim();
        if email.is_empty() {
            return Err(RequestError::validation("email", "Email is required"));
        }
        if password.is_empty() {
            return Err(RequestError::validation("password", "Password is required"));
        }

        debug!(path, email, "Submitting credentials");
        let request = HttpRequest::post(self.url(path)).json(&Credentials {
            email,
            password_hash: password,
        })?;
        self.client.send_json(request).await
    }
}

/// Text to show next to the login form for a failed sign-in.
pub fn login_failure_message(err: &RequestError) -> String {
    match err {
        RequestError::HttpStatus { code: 401, .. } => "Invalid username or password".to_string(),
        RequestError::HttpStatus { message, .. } => message.clone(),
        RequestError::Validation { message, .. } => message.clone(),
        RequestError::Transport { .. } => {
            "Unable to connect to server. Check your internet connection.".to_string()
        }
        RequestError::InvalidResponse { .. } => format!("Login failed: {}", err),
        RequestError::Cancelled => String::new(),
    }
}
