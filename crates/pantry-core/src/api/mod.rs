//! Generic request client for the pantry REST backend.
//!
//! This module provides the `RequestClient`, which issues HTTP calls through a
//! pluggable `Transport`, tracks every call that has not settled, and can
//! cancel all of them at once (e.g. when a view is torn down).

pub mod client;
pub mod error;
pub mod transport;

pub use client::{RequestClient, RequestState};
pub use error::RequestError;
pub use transport::{HttpRequest, HttpResponse, ReqwestTransport, Transport};
