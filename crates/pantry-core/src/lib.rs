//! Pantry client core library.
//!
//! Session lifecycle and request plumbing shared by pantry front ends:
//! - `api`: the `RequestClient` and its transport
//! - `auth`: `SessionManager`, persisted sessions, auth endpoints
//! - `config`: environment configuration and user preferences

pub mod api;
pub mod auth;
pub mod config;

mod test_utils;

pub use api::{HttpRequest, RequestClient, RequestError, RequestState};
pub use auth::{SessionError, SessionManager, SessionState};
pub use config::{Config, ConfigError};
