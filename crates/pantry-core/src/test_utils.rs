//! Test Utilities Module
//!
//! Provides a scripted transport and fixtures for exercising the request
//! client and session manager without a network.
//! This module is only compiled when running tests.

#![cfg(test)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::oneshot;

use crate::api::{HttpRequest, HttpResponse, RequestClient, RequestError, Transport};

pub const BASE_URL: &str = "http://pantry.test/api";

/// A canned reply for one request.
pub enum Reply {
    Respond(HttpResponse),
    Fail(RequestError),
    /// Wait until the test sends the outcome.
    Gated(oneshot::Receiver<Result<HttpResponse, RequestError>>),
    /// Never settle.
    Hang,
}

impl Reply {
    pub fn json(status: u16, body: Value) -> Self {
        Reply::Respond(json_response(status, body))
    }

    pub fn text(status: u16, body: &str) -> Self {
        Reply::Respond(HttpResponse {
            status,
            content_type: Some("text/plain".to_string()),
            body: body.to_string(),
        })
    }

    /// A reply held back until the returned sender fires.
    pub fn gated() -> (Self, oneshot::Sender<Result<HttpResponse, RequestError>>) {
        let (tx, rx) = oneshot::channel();
        (Reply::Gated(rx), tx)
    }
}

pub fn json_response(status: u16, body: Value) -> HttpResponse {
    HttpResponse {
        status,
        content_type: Some("application/json".to_string()),
        body: body.to_string(),
    }
}

/// Transport that answers from per-route queues, matched by URL suffix, and
/// records every request it receives.
#[derive(Default)]
pub struct ScriptedTransport {
    routes: Mutex<Vec<(String, VecDeque<Reply>)>>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue `reply` for the next request whose URL ends with `suffix`.
    pub fn on(&self, suffix: &str, reply: Reply) {
        let mut routes = self.routes.lock().unwrap();
        match routes.iter_mut().find(|(s, _)| s == suffix) {
            Some((_, queue)) => queue.push_back(reply),
            None => routes.push((suffix.to_string(), VecDeque::from([reply]))),
        }
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Number of requests received whose URL ends with `suffix`.
    pub fn count(&self, suffix: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.url.ends_with(suffix))
            .count()
    }

    fn next_reply(&self, url: &str) -> Option<Reply> {
        let mut routes = self.routes.lock().unwrap();
        routes
            .iter_mut()
            .find(|(suffix, _)| url.ends_with(suffix.as_str()))
            .and_then(|(_, queue)| queue.pop_front())
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, RequestError> {
        let url = request.url.clone();
        self.requests.lock().unwrap().push(request);

        match self.next_reply(&url) {
            Some(Reply::Respond(response)) => Ok(response),
            Some(Reply::Fail(err)) => Err(err),
            Some(Reply::Gated(rx)) => rx.await.unwrap_or_else(|_| {
                Err(RequestError::Transport {
                    message: "gate dropped".to_string(),
                })
            }),
            Some(Reply::Hang) => futures::future::pending().await,
            None => Err(RequestError::Transport {
                message: format!("no scripted reply for {}", url),
            }),
        }
    }
}

/// A request client over a fresh scripted transport.
pub fn scripted_client() -> (RequestClient, Arc<ScriptedTransport>) {
    let transport = ScriptedTransport::new();
    (RequestClient::new(transport.clone()), transport)
}
