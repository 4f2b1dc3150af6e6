use thiserror::Error;

/// Maximum length for raw response bodies echoed into error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

/// Every way a call through `RequestClient` can settle without a body.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    /// The request never produced a response (DNS, connect, reset, ...).
    #[error("Network error: {message}")]
    Transport { message: String },

    /// The server answered with a non-2xx status.
    #[error("{message}")]
    HttpStatus { code: u16, message: String },

    /// Input was rejected before anything was sent.
    #[error("{field}: {message}")]
    Validation { field: String, message: String },

    /// A 2xx response whose body could not be decoded.
    #[error("Invalid response: {message}")]
    InvalidResponse { status: u16, message: String },

    /// The call was aborted by `RequestClient::cancel_all`.
    #[error("Request was cancelled")]
    Cancelled,
}

impl RequestError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            body.to_string()
        } else {
            let mut end = MAX_ERROR_BODY_LENGTH;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
        }
    }

    /// Build the error for a non-2xx response.
    ///
    /// Prefers the `message` field of a JSON body, falling back to a generic
    /// message naming the status.
    pub fn from_status(code: u16, body: &serde_json::Value) -> Self {
        let message = body
            .get("message")
            .and_then(|m| m.as_str())
            .filter(|m| !m.is_empty())
            .map(Self::truncate_body)
            .unwrap_or_else(|| format!("Request failed with status {}", code));
        RequestError::HttpStatus { code, message }
    }

    pub fn validation(field: &str, message: impl Into<String>) -> Self {
        RequestError::Validation {
            field: field.to_string(),
            message: message.into(),
        }
    }

    /// HTTP status the error carries, if the call reached the server.
    pub fn status(&self) -> Option<u16> {
        match self {
            RequestError::HttpStatus { code, .. } => Some(*code),
            RequestError::InvalidResponse { status, .. } => Some(*status),
            RequestError::Transport { .. }
            | RequestError::Validation { .. }
            | RequestError::Cancelled => None,
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        self.status() == Some(401)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, RequestError::Cancelled)
    }
}

impl From<reqwest::Error> for RequestError {
    fn from(err: reqwest::Error) -> Self {
        RequestError::Transport {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_status_prefers_server_message() {
        let err = RequestError::from_status(400, &json!({"message": "Email is already in use!"}));
        assert_eq!(
            err,
            RequestError::HttpStatus {
                code: 400,
                message: "Email is already in use!".to_string()
            }
        );
        assert_eq!(err.to_string(), "Email is already in use!");
    }

    #[test]
    fn test_from_status_falls_back_to_generic_message() {
        let err = RequestError::from_status(502, &serde_json::Value::Null);
        assert_eq!(err.to_string(), "Request failed with status 502");

        // A non-string message field is ignored
        let err = RequestError::from_status(500, &json!({"message": 42}));
        assert_eq!(err.to_string(), "Request failed with status 500");

        // Text bodies have no message field
        let err = RequestError::from_status(404, &json!("Not Found"));
        assert_eq!(err.to_string(), "Request failed with status 404");
    }

    #[test]
    fn test_long_server_message_is_truncated() {
        let long = "x".repeat(MAX_ERROR_BODY_LENGTH + 20);
        let err = RequestError::from_status(500, &json!({ "message": long }));
        let message = err.to_string();
        assert!(message.starts_with(&"x".repeat(MAX_ERROR_BODY_LENGTH)));
        assert!(message.contains("truncated, 520 total bytes"));
    }

    #[test]
    fn test_status_and_classification() {
        let unauthorized = RequestError::from_status(401, &serde_json::Value::Null);
        assert!(unauthorized.is_unauthorized());
        assert_eq!(unauthorized.status(), Some(401));

        let transport = RequestError::Transport {
            message: "connection refused".to_string(),
        };
        assert_eq!(transport.status(), None);
        assert!(!transport.is_unauthorized());

        assert!(RequestError::Cancelled.is_cancelled());
        assert_eq!(RequestError::Cancelled.status(), None);

        let invalid = RequestError::validation("email", "Email is required");
        assert_eq!(invalid.to_string(), "email: Email is required");
    }
}
