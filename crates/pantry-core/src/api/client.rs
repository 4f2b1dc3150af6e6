//! Request client for the pantry REST backend.
//!
//! `RequestClient` issues one HTTP call per `send`, keeps an abort handle for
//! every call that has not settled yet, and publishes the loading / status /
//! error side channels of the most recent call through a `watch` channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::Result;
use futures::future::{AbortHandle, Abortable, Aborted};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, warn};

use super::transport::{HttpRequest, HttpResponse, ReqwestTransport, Transport};
use super::RequestError;

/// Observable side channels of a `RequestClient`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct RequestState {
    /// At least one call is in flight.
    pub loading: bool,
    /// Status of the last settled call; `None` if it never reached the server.
    pub status: Option<u16>,
    /// Message of the last failed call; empty after a success.
    pub error: String,
}

/// Cheap to clone; clones share the pending set and side channels.
#[derive(Clone)]
pub struct RequestClient {
    inner: Arc<Inner>,
}

struct Inner {
    transport: Arc<dyn Transport>,
    pending: Mutex<HashMap<u64, AbortHandle>>,
    next_id: AtomicU64,
    state: watch::Sender<RequestState>,
}

impl Inner {
    fn pending(&self) -> MutexGuard<'_, HashMap<u64, AbortHandle>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(&self, handle: AbortHandle) -> PendingGuard<'_> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.pending().insert(id, handle);
        PendingGuard { inner: self, id }
    }
}

/// Removes a call from the pending set however its future ends, including
/// when the caller drops it mid-flight.
struct PendingGuard<'a> {
    inner: &'a Inner,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        let remaining = {
            let mut pending = self.inner.pending();
            pending.remove(&self.id);
            pending.len()
        };
        self.inner.state.send_modify(|s| s.loading = remaining > 0);
    }
}

impl RequestClient {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        let (state, _) = watch::channel(RequestState::default());
        Self {
            inner: Arc::new(Inner {
                transport,
                pending: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
                state,
            }),
        }
    }

    /// Create a client backed by a fresh `reqwest` connection pool.
    pub fn with_reqwest() -> Result<Self> {
        Ok(Self::new(Arc::new(ReqwestTransport::new()?)))
    }

    /// Snapshot of the side channels.
    pub fn state(&self) -> RequestState {
        self.inner.state.borrow().clone()
    }

    pub fn is_loading(&self) -> bool {
        self.inner.state.borrow().loading
    }

    pub fn last_status(&self) -> Option<u16> {
        self.inner.state.borrow().status
    }

    pub fn last_error(&self) -> String {
        self.inner.state.borrow().error.clone()
    }

    /// Receiver notified on every side-channel change.
    pub fn subscribe(&self) -> watch::Receiver<RequestState> {
        self.inner.state.subscribe()
    }

    /// Number of calls issued and not yet settled.
    pub fn pending_count(&self) -> usize {
        self.inner.pending().len()
    }

    /// Issue one request and return its decoded body.
    ///
    /// Bodies are `null` when empty, parsed JSON when possible, and otherwise
    /// the raw text as a JSON string. Any non-2xx status is an error.
    pub async fn send(&self, request: HttpRequest) -> Result<Value, RequestError> {
        self.dispatch(request).await.map(|(_, body)| body)
    }

    /// Like `send`, deserializing the body into `T`.
    pub async fn send_json<T: DeserializeOwned>(
        &self,
        request: HttpRequest,
    ) -> Result<T, RequestError> {
        let (status, body) = self.dispatch(request).await?;
        serde_json::from_value(body).map_err(|e| {
            let err = RequestError::InvalidResponse {
                status,
                message: e.to_string(),
            };
            self.inner.state.send_modify(|s| s.error = err.to_string());
            err
        })
    }

    /// Abort every pending call. Returns how many were aborted.
    ///
    /// Aborted calls settle as `RequestError::Cancelled` and leave the status
    /// and error side channels untouched.
    pub fn cancel_all(&self) -> usize {
        let handles: Vec<AbortHandle> = self.inner.pending().drain().map(|(_, h)| h).collect();
        for handle in &handles {
            handle.abort();
        }
        self.inner.state.send_modify(|s| s.loading = false);
        if !handles.is_empty() {
            debug!(count = handles.len(), "Cancelled pending requests");
        }
        handles.len()
    }

    async fn dispatch(&self, request: HttpRequest) -> Result<(u16, Value), RequestError> {
        let inner = &self.inner;
        inner.state.send_modify(|s| {
            s.loading = true;
            s.status = None;
            s.error.clear();
        });

        let method = request.method.clone();
        let url = request.url.clone();

        let (handle, registration) = AbortHandle::new_pair();
        let guard = inner.register(handle);
        let outcome = Abortable::new(inner.transport.execute(request), registration).await;
        drop(guard);

        let (status, result) = match outcome {
            Err(Aborted) => {
                debug!(%method, %url, "Request was aborted");
                return Err(RequestError::Cancelled);
            }
            Ok(Err(err)) => (None, Err(err)),
            Ok(Ok(response)) => {
                let status = response.status;
                (Some(status), Self::decode(response).map(|body| (status, body)))
            }
        };

        inner.state.send_modify(|s| {
            s.status = status;
            s.error = match &result {
                Ok(_) => String::new(),
                Err(e) => e.to_string(),
            };
        });

        if let Err(ref e) = result {
            warn!(%method, %url, status = ?status, error = %e, "Request failed");
        }
        result
    }

    fn decode(response: HttpResponse) -> Result<Value, RequestError> {
        let status = response.status;
        let parsed: Result<Value, serde_json::Error> = if response.body.is_empty() {
            Ok(Value::Null)
        } else if response.is_json() {
            serde_json::from_str(&response.body)
        } else {
            Ok(serde_json::from_str(&response.body)
                .unwrap_or_else(|_| Value::String(response.body.clone())))
        };

        if !response.is_success() {
            // An undecodable error body still reports the status
            let body = parsed.unwrap_or(Value::Null);
            return Err(RequestError::from_status(status, &body));
        }

        parsed.map_err(|_| RequestError::InvalidResponse {
            status,
            message: "Invalid JSON response from server".to_string(),
        })
    }
}
