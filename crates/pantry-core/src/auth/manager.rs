//! Session lifecycle: login, persistence, silent refresh and logout.
//!
//! `SessionManager` owns the authenticated identity and moves it through
//! `Anonymous`, `Authenticated` and `Refreshing`. Every transition writes the
//! persisted record and the in-memory state under the same lock, so the two
//! never disagree once a transition returns.
//!
//! While authenticated, a single background timer renews the access token
//! `refresh_margin` before it expires. Refresh attempts are serialized, and a
//! result that arrives after the session ended is dropped.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::{HttpRequest, RequestClient, RequestError};
use crate::config::SessionSettings;

use super::endpoints::AuthApi;
use super::session::{
    truncate_to_millis, LogoutReason, Session, SessionEvent, SessionRecord, SessionState,
};
use super::store::SessionStore;

/// Capacity of the session event channel.
/// Identity changes are rare; 16 leaves room for slow subscribers.
const EVENT_CHANNEL_CAPACITY: usize = 16;

/// Longest access-token lifetime accepted from the backend.
const MAX_TOKEN_LIFETIME_SECS: i64 = 365 * 24 * 60 * 60;

/// `now + secs` for a backend-stated token lifetime; `None` when the lifetime
/// is not positive or exceeds `MAX_TOKEN_LIFETIME_SECS`.
fn expiry_in(secs: i64) -> Option<DateTime<Utc>> {
    if !(1..=MAX_TOKEN_LIFETIME_SECS).contains(&secs) {
        return None;
    }
    Duration::try_seconds(secs).and_then(|lifetime| Utc::now().checked_add_signed(lifetime))
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Not logged in")]
    NotAuthenticated,

    #[error("Access token is empty")]
    EmptyAccessToken,

    #[error(transparent)]
    Request(#[from] RequestError),

    #[error("Session refresh failed: {0}")]
    RefreshFailed(RequestError),

    #[error("Session storage failed: {0:#}")]
    Storage(anyhow::Error),
}

/// Cheap to clone; clones share one session.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

struct Inner {
    api: AuthApi,
    store: Arc<dyn SessionStore>,
    settings: SessionSettings,
    state: watch::Sender<SessionState>,
    events: broadcast::Sender<SessionEvent>,
    core: Mutex<Core>,
    /// Held for the whole of a refresh attempt.
    refresh_gate: tokio::sync::Mutex<()>,
}

#[derive(Default)]
struct Core {
    /// Bumped on login and logout; a refresh started under another epoch is stale.
    epoch: u64,
    timer: Option<RefreshTimer>,
    next_timer_id: u64,
}

struct RefreshTimer {
    id: u64,
    due: DateTime<Utc>,
    handle: JoinHandle<()>,
}

impl SessionManager {
    /// Create an anonymous manager without touching storage.
    pub fn new(api: AuthApi, store: Arc<dyn SessionStore>, settings: SessionSettings) -> Self {
        let (state, _) = watch::channel(SessionState::Anonymous);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                api,
                store,
                settings,
                state,
                events,
                core: Mutex::new(Core::default()),
                refresh_gate: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Create a manager and restore any persisted session.
    pub async fn start(
        api: AuthApi,
        store: Arc<dyn SessionStore>,
        settings: SessionSettings,
    ) -> Self {
        let manager = Self::new(api, store, settings);
        manager.restore().await;
        manager
    }

    pub fn api(&self) -> &AuthApi {
        &self.inner.api
    }

    pub fn state(&self) -> SessionState {
        self.inner.state.borrow().clone()
    }

    pub fn is_logged_in(&self) -> bool {
        self.inner.state.borrow().is_logged_in()
    }

    pub fn session(&self) -> Option<Session> {
        self.inner.state.borrow().session().cloned()
    }

    pub fn access_token(&self) -> Option<String> {
        self.inner
            .state
            .borrow()
            .access_token()
            .filter(|t| !t.is_empty())
            .map(str::to_string)
    }

    pub fn email(&self) -> Option<String> {
        self.inner.state.borrow().email().map(str::to_string)
    }

    /// Receiver of the current state, notified on every transition.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    /// Receiver of login / refresh / logout events.
    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// When the silent refresh is scheduled to run, if armed.
    pub fn next_refresh_at(&self) -> Option<DateTime<Utc>> {
        self.inner.core().timer.as_ref().map(|t| t.due)
    }

    // =========================================================================
    // Identity changes
    // =========================================================================

    /// Start a session from issued tokens.
    ///
    /// Without an `expiry` the access token is assumed to live for the
    /// configured token window. The record is persisted before the in-memory
    /// state changes; on a storage error nothing changes.
    pub fn login(
        &self,
        email: &str,
        access_token: &str,
        refresh_token: &str,
        expiry: Option<DateTime<Utc>>,
    ) -> Result<(), SessionError> {
        if access_token.is_empty() {
            return Err(SessionError::EmptyAccessToken);
        }
        let expiry = expiry.unwrap_or_else(|| Utc::now() + self.inner.settings.token_window);
        let session = Session::new(email, access_token, refresh_token, expiry);

        {
            // Store I/O runs under the lock: storage and memory change as one
            let mut core = self.inner.core();
            self.inner.persist(&session)?;
            core.epoch += 1;
            self.inner.state.send_replace(SessionState::Authenticated(session.clone()));
            let delay = session.refresh_delay(Utc::now(), self.inner.settings.refresh_margin);
            self.inner.rearm(&mut core, &session, delay);
        }

        info!(email, "Logged in");
        self.inner.notify(SessionEvent::LoggedIn {
            email: email.to_string(),
        });
        Ok(())
    }

    /// End the session, clearing memory and storage.
    ///
    /// Safe to call without a session; storage is cleared either way.
    pub fn logout(&self) {
        self.inner.end_session(LogoutReason::User);
    }

    /// Authenticate with credentials and start the resulting session.
    pub async fn sign_in(&self, email: &str, password: &str) -> Result<(), SessionError> {
        let tokens = self.inner.api.login(email, password).await?;
        let expiry = issued_expiry(tokens.expires_in);
        self.login(email.trim(), &tokens.access_token, &tokens.refresh_token, expiry)
    }

    /// Create an account and start the resulting session.
    pub async fn register(&self, email: &str, password: &str) -> Result<(), SessionError> {
        let tokens = self.inner.api.register(email, password).await?;
        let expiry = issued_expiry(tokens.expires_in);
        self.login(email.trim(), &tokens.access_token, &tokens.refresh_token, expiry)
    }

    /// Invalidate the access token server-side (best effort), then log out.
    pub async fn sign_out(&self) {
        if let Some(token) = self.access_token() {
            if let Err(e) = self.inner.api.logout(&token).await {
                warn!(error = %e, "Server-side logout failed");
            }
        }
        self.logout();
    }

    // =========================================================================
    // Restore and refresh
    // =========================================================================

    /// Load the persisted session, renewing it once if it already expired.
    pub async fn restore(&self) -> SessionState {
        let raw = match self.inner.store.read(&self.inner.settings.storage_key) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "Failed to read persisted session");
                None
            }
        };

        let Some(raw) = raw else {
            debug!("No persisted session");
            return self.state();
        };

        let session = match serde_json::from_str::<SessionRecord>(&raw) {
            Ok(record) => record.into_session(),
            Err(e) => {
                warn!(error = %e, "Discarding unreadable session record");
                self.inner.clear_storage();
                return self.state();
            }
        };

        if !session.is_logged_in() {
            warn!("Discarding session record without an access token");
            self.inner.clear_storage();
            return self.state();
        }

        if !session.is_expired_at(Utc::now()) {
            {
                let mut core = self.inner.core();
                core.epoch += 1;
                self.inner.state.send_replace(SessionState::Authenticated(session.clone()));
                let delay = session.refresh_delay(Utc::now(), self.inner.settings.refresh_margin);
                self.inner.rearm(&mut core, &session, delay);
            }
            info!(email = %session.email, "Restored session");
            return self.state();
        }

        debug!(email = %session.email, "Persisted session expired; refreshing");
        {
            let mut core = self.inner.core();
            core.epoch += 1;
            self.inner.disarm(&mut core);
            self.inner.state.send_replace(SessionState::Refreshing(session));
        }
        if let Err(e) = self.inner.refresh(None).await {
            debug!(error = %e, "Restored session could not be renewed");
        }
        self.state()
    }

    /// Renew the access token now.
    pub async fn refresh(&self) -> Result<(), SessionError> {
        self.inner.refresh(None).await
    }

    /// Renew the access token unless `stale_token` has already been replaced.
    ///
    /// Used when a request reports 401: concurrent callers holding the same
    /// rejected token cause a single renewal.
    pub async fn refresh_if_current(&self, stale_token: &str) -> Result<(), SessionError> {
        self.inner.refresh(Some(stale_token.to_string())).await
    }

    /// Send `request` with the session's bearer token.
    ///
    /// A 401 triggers one refresh and one retry; a second 401 is returned
    /// to the caller without ending the session.
    pub async fn send_authorized(
        &self,
        client: &RequestClient,
        request: HttpRequest,
    ) -> Result<Value, SessionError> {
        let token = self.access_token().ok_or(SessionError::NotAuthenticated)?;

        match client.send(request.clone().bearer(&token)).await {
            Err(e) if e.is_unauthorized() => {
                debug!("Access token rejected; refreshing");
                self.refresh_if_current(&token).await?;
                let token = self.access_token().ok_or(SessionError::NotAuthenticated)?;
                Ok(client.send(request.bearer(&token)).await?)
            }
            other => Ok(other?),
        }
    }

    /// Disarm the refresh timer and abort this manager's pending calls.
    /// The session itself is left as it is.
    pub fn shutdown(&self) {
        let mut core = self.inner.core();
        self.inner.disarm(&mut core);
        drop(core);
        self.inner.api.client().cancel_all();
    }
}

/// Expiry for tokens issued at login; an unusable lifetime falls back to the
/// configured window.
fn issued_expiry(expires_in: Option<i64>) -> Option<DateTime<Utc>> {
    let secs = expires_in?;
    let expiry = expiry_in(secs);
    if expiry.is_none() {
        warn!(expires_in = secs, "Ignoring out-of-range token lifetime");
    }
    expiry
}

impl Inner {
    fn core(&self) -> MutexGuard<'_, Core> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    fn persist(&self, session: &Session) -> Result<(), SessionError> {
        let record = session.to_record().ok_or(SessionError::EmptyAccessToken)?;
        let contents = serde_json::to_string(&record)
            .map_err(|e| SessionError::Storage(anyhow::Error::new(e)))?;
        self.store
            .write(&self.settings.storage_key, &contents)
            .map_err(SessionError::Storage)
    }

    fn clear_storage(&self) {
        if let Err(e) = self.store.remove(&self.settings.storage_key) {
            warn!(error = %e, "Failed to clear persisted session");
        }
    }

    fn end_session(&self, reason: LogoutReason) {
        let previous = {
            let mut core = self.core();
            self.end_session_locked(&mut core)
        };
        if previous.is_logged_in() {
            info!(?reason, "Logged out");
            self.notify(SessionEvent::LoggedOut { reason });
        }
    }

    fn end_session_locked(&self, core: &mut Core) -> SessionState {
        core.epoch += 1;
        self.disarm(core);
        self.clear_storage();
        self.state.send_replace(SessionState::Anonymous)
    }

    fn disarm(&self, core: &mut Core) {
        if let Some(timer) = core.timer.take() {
            timer.handle.abort();
            debug!(timer = timer.id, "Refresh timer cancelled");
        }
    }

    /// Cancel any armed timer, then schedule a renewal for `session` after
    /// `delay`. `None` leaves it unscheduled.
    fn rearm(self: &Arc<Self>, core: &mut Core, session: &Session, delay: Option<StdDuration>) {
        self.disarm(core);

        let now = Utc::now();
        let Some(delay) = delay else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No async runtime available; silent refresh disabled");
            return;
        };

        core.next_timer_id += 1;
        let id = core.next_timer_id;
        let due = Duration::from_std(delay)
            .ok()
            .and_then(|delay| now.checked_add_signed(delay))
            .unwrap_or(now);
        let weak: Weak<Inner> = Arc::downgrade(self);
        let token = session.access_token.clone();

        let handle = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            inner.timer_fired(id);
            if let Err(e) = inner.refresh(Some(token)).await {
                debug!(error = %e, "Scheduled refresh did not renew the session");
            }
        });

        debug!(timer = id, delay_secs = delay.as_secs(), "Refresh timer armed");
        core.timer = Some(RefreshTimer { id, due, handle });
    }

    /// Detach the firing timer so the refresh it starts cannot abort itself.
    fn timer_fired(&self, id: u64) {
        let mut core = self.core();
        if core.timer.as_ref().map(|t| t.id) == Some(id) {
            core.timer = None;
            debug!(timer = id, "Refresh timer fired");
        }
    }

    async fn refresh(self: &Arc<Self>, stale_token: Option<String>) -> Result<(), SessionError> {
        let _gate = self.refresh_gate.lock().await;

        let (epoch, session) = {
            let mut core = self.core();
            let current = self.state.borrow().clone();
            let session = match current {
                SessionState::Anonymous => return Err(SessionError::NotAuthenticated),
                SessionState::Authenticated(session) | SessionState::Refreshing(session) => session,
            };
            if let Some(stale) = stale_token {
                if session.access_token != stale {
                    debug!("Access token already renewed");
                    return Ok(());
                }
            }
            self.disarm(&mut core);
            self.state.send_replace(SessionState::Refreshing(session.clone()));
            (core.epoch, session)
        };

        let outcome = self.api.refresh(&session.refresh_token).await;

        let mut core = self.core();
        if core.epoch != epoch {
            debug!("Discarding refresh result for a session that has ended");
            return Err(SessionError::NotAuthenticated);
        }

        let refreshed = match outcome {
            Ok(refreshed) if !refreshed.access_token.is_empty() => refreshed,
            Ok(_) => {
                return Err(self.fail_refresh(
                    &mut core,
                    RequestError::InvalidResponse {
                        status: 200,
                        message: "Refresh response carried no access token".to_string(),
                    },
                ))
            }
            Err(RequestError::Cancelled) => {
                // Aborted by shutdown: keep the session, leave it unscheduled
                self.state.send_replace(SessionState::Authenticated(session));
                return Err(SessionError::Request(RequestError::Cancelled));
            }
            Err(e) => return Err(self.fail_refresh(&mut core, e)),
        };

        let expiry = match refreshed.expires_in {
            None => Utc::now() + self.settings.token_window,
            Some(secs) => match expiry_in(secs) {
                Some(expiry) => expiry,
                None => {
                    return Err(self.fail_refresh(
                        &mut core,
                        RequestError::InvalidResponse {
                            status: 200,
                            message: format!("Refresh response carried an invalid lifetime: {}", secs),
                        },
                    ))
                }
            },
        };

        let mut renewed = session;
        renewed.access_token = refreshed.access_token;
        if let Some(rotated) = refreshed.refresh_token.filter(|t| !t.is_empty()) {
            renewed.refresh_token = rotated;
        }
        renewed.access_token_expiry = Some(truncate_to_millis(expiry));

        // Store I/O runs under the lock: storage and memory change as one
        if let Err(e) = self.persist(&renewed) {
            warn!(error = %e, "Failed to persist renewed session");
            let previous = self.end_session_locked(&mut core);
            drop(core);
            if previous.is_logged_in() {
                self.notify(SessionEvent::LoggedOut {
                    reason: LogoutReason::RefreshFailed,
                });
            }
            return Err(e);
        }
        self.state.send_replace(SessionState::Authenticated(renewed.clone()));
        let delay = renewed.renewal_delay(Utc::now(), self.settings.refresh_margin);
        self.rearm(&mut core, &renewed, delay);
        drop(core);

        info!(email = %renewed.email, "Access token renewed");
        self.notify(SessionEvent::Refreshed);
        Ok(())
    }

    fn fail_refresh(&self, core: &mut Core, error: RequestError) -> SessionError {
        warn!(error = %error, "Session refresh failed; logging out");
        let previous = self.end_session_locked(core);
        if previous.is_logged_in() {
            self.notify(SessionEvent::LoggedOut {
                reason: LogoutReason::RefreshFailed,
            });
        }
        SessionError::RefreshFailed(error)
    }
}
