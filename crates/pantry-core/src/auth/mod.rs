//! Authentication module for the session lifecycle.
//!
//! This module provides:
//! - `SessionManager`: login/logout, persistence, and silent token refresh
//! - `Session`, `SessionRecord`: the in-memory identity and its stored form
//! - `SessionStore`: key-value storage backends (file, OS keychain, memory)
//! - `AuthApi`: calls to the backend's `/auth` endpoints
//!
//! Access tokens are renewed shortly before they expire; a failed renewal
//! ends the session.

pub mod endpoints;
pub mod keychain;
pub mod manager;
pub mod session;
pub mod store;

pub use endpoints::{login_failure_message, AuthApi, RefreshedToken, TokenPair};
pub use keychain::KeyringStore;
pub use manager::{SessionError, SessionManager};
pub use session::{LogoutReason, Session, SessionEvent, SessionRecord, SessionState};
pub use store::{FileStore, MemoryStore, SessionStore};
