//! Login state for one user of the API.
//!
//! The [`SessionController`] is the only writer of the current [`Identity`].
//! Login and logout go through it directly; a failed credential refresh
//! reaches it through the client's session-expired hook and ends the session
//! the same way a logout does.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use super::claims::{decode_identity, CodecError, Identity};
use super::credentials::{CredentialPair, CredentialStore};
use crate::api::{ApiClient, ApiError, Transport};
use crate::config::ClientConfig;

const EVENT_CAPACITY: usize = 16;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoginError {
    #[error("Empty input field value(s).")]
    EmptyCredentials,

    #[error("{0}")]
    Rejected(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Server issued an unreadable access token: {0}")]
    InvalidToken(CodecError),

    #[error("Credential storage error: {0}")]
    Storage(String),
}

impl From<ApiError> for LoginError {
    fn from(error: ApiError) -> Self {
        match error {
            ApiError::Http { status, detail } | ApiError::AuthorizationExpired { status, detail } => {
                if detail.is_empty() {
                    let reason = StatusCode::from_u16(status)
                        .ok()
                        .and_then(|s| s.canonical_reason())
                        .unwrap_or("Login failed");
                    LoginError::Rejected(reason.to_string())
                } else {
                    LoginError::Rejected(detail)
                }
            }
            ApiError::Network(msg) | ApiError::Timeout(msg) => LoginError::Network(msg),
            ApiError::InvalidResponse(msg) => LoginError::InvalidResponse(msg),
            ApiError::Storage(msg) => LoginError::Storage(msg),
            other => LoginError::Rejected(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogoutReason {
    UserRequested,
    /// The refresh token was refused or the refresh call failed.
    SessionExpired,
}

/// Session transitions. `LoggedIn` doubles as the signal for dependents to
/// drop any per-user state they hold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    LoggedIn(Identity),
    LoggedOut { reason: LogoutReason },
}

struct SessionState {
    store: Arc<dyn CredentialStore>,
    identity: watch::Sender<Option<Identity>>,
    events: broadcast::Sender<SessionEvent>,
    /// Login attempts in flight.
    loading: AtomicUsize,
    last_error: Mutex<Option<String>>,
}

impl SessionState {
    fn end_session(&self, reason: LogoutReason) {
        if let Err(e) = self.store.remove() {
            warn!(error = %e, "Failed to erase credentials");
        }
        self.clear_identity(reason);
    }

    /// Forget the identity without touching the store.
    fn clear_identity(&self, reason: LogoutReason) {
        let previous = self.identity.send_replace(None);

        // A second expiry notice for an already closed session is not news
        if previous.is_some() || reason == LogoutReason::UserRequested {
            info!(
                subject = previous.as_ref().map(|id| id.subject.as_str()),
                ?reason,
                "Logged out"
            );
            let _ = self.events.send(SessionEvent::LoggedOut { reason });
        }
    }

    fn rotate_identity(&self, pair: &CredentialPair) {
        match decode_identity(pair.access_token()) {
            Ok(identity) => {
                debug!(subject = %identity.subject, "Identity updated after refresh");
                self.identity.send_replace(Some(identity));
            }
            Err(e) => {
                warn!(error = %e, "Refreshed access token could not be decoded, ending session");
                if let Err(e) = self.store.compare_and_swap(Some(pair), None) {
                    warn!(error = %e, "Failed to erase undecodable credentials");
                }
                self.clear_identity(LogoutReason::SessionExpired);
            }
        }
    }

    fn record_error(&self, error: Option<&LoginError>) {
        if let Ok(mut last) = self.last_error.lock() {
            *last = error.map(|e| e.to_string());
        }
    }
}

/// Counts one login attempt as in flight until dropped, however it ends.
struct LoadingGuard<'a>(&'a AtomicUsize);

impl<'a> LoadingGuard<'a> {
    fn start(in_flight: &'a AtomicUsize) -> Self {
        in_flight.fetch_add(1, Ordering::SeqCst);
        Self(in_flight)
    }
}

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct SessionController {
    client: ApiClient,
    state: Arc<SessionState>,
}

impl SessionController {
    /// Create a controller talking HTTP through `reqwest`. Any pair already in
    /// `store` is decoded and the session resumes from it.
    pub fn new(config: ClientConfig, store: Arc<dyn CredentialStore>) -> Result<Self, ApiError> {
        Self::build(config, store, None)
    }

    pub fn with_transport(
        config: ClientConfig,
        store: Arc<dyn CredentialStore>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, ApiError> {
        Self::build(config, store, Some(transport))
    }

    fn build(
        config: ClientConfig,
        store: Arc<dyn CredentialStore>,
        transport: Option<Arc<dyn Transport>>,
    ) -> Result<Self, ApiError> {
        let (identity, _) = watch::channel(restore_identity(store.as_ref()));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let state = Arc::new(SessionState {
            store: Arc::clone(&store),
            identity,
            events,
            loading: AtomicUsize::new(0),
            last_error: Mutex::new(None),
        });

        let expired = Arc::clone(&state);
        let rotated = Arc::clone(&state);
        let mut builder = ApiClient::builder(config, store)
            .on_session_expired(Arc::new(move |error: &ApiError| {
                warn!(error = %error, "Session expired");
                // The coordinator has already erased the pair it refreshed
                expired.clear_identity(LogoutReason::SessionExpired);
            }))
            .on_credentials_rotated(Arc::new(move |pair: &CredentialPair| {
                rotated.rotate_identity(pair);
            }));
        if let Some(transport) = transport {
            builder = builder.transport(transport);
        }

        Ok(Self {
            client: builder.build()?,
            state,
        })
    }

    /// Exchange username and password for a credential pair and start a
    /// session with it. Both inputs are trimmed first.
    ///
    /// On failure the previous session, if any, is left as it was and the
    /// message is kept for [`last_error`](Self::last_error).
    pub async fn login(&self, username: &str, password: &str) -> Result<Identity, LoginError> {
        let username = username.trim();
        let password = password.trim();
        if username.is_empty() || password.is_empty() {
            let error = LoginError::EmptyCredentials;
            self.state.record_error(Some(&error));
            return Err(error);
        }

        let _loading = LoadingGuard::start(&self.state.loading);
        match self.authenticate(username, password).await {
            Ok(identity) => {
                self.state.record_error(None);
                Ok(identity)
            }
            Err(error) => {
                warn!(username, error = %error, "Login failed");
                self.state.record_error(Some(&error));
                Err(error)
            }
        }
    }

    async fn authenticate(&self, username: &str, password: &str) -> Result<Identity, LoginError> {
        let pair = self.client.exchange_password(username, password).await?;
        let identity = decode_identity(pair.access_token()).map_err(LoginError::InvalidToken)?;
        self.state
            .store
            .set(&pair)
            .map_err(|e| LoginError::Storage(e.to_string()))?;

        info!(subject = %identity.subject, role = %identity.role, "Logged in");
        self.state.identity.send_replace(Some(identity.clone()));
        let _ = self.state.events.send(SessionEvent::LoggedIn(identity.clone()));
        Ok(identity)
    }

    /// Forget the credential pair. Nothing is sent to the server.
    pub fn logout(&self) {
        self.state.end_session(LogoutReason::UserRequested);
    }

    pub fn identity(&self) -> Option<Identity> {
        self.state.identity.borrow().clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.state.identity.borrow().is_some()
    }

    pub fn subscribe_identity(&self) -> watch::Receiver<Option<Identity>> {
        self.state.identity.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.state.events.subscribe()
    }

    /// True while any login call is in flight.
    pub fn is_loading(&self) -> bool {
        self.state.loading.load(Ordering::SeqCst) > 0
    }

    /// Message of the most recent failed login, cleared by a successful one.
    pub fn last_error(&self) -> Option<String> {
        self.state.last_error.lock().ok().and_then(|last| last.clone())
    }

    /// Client for authenticated calls on behalf of this session.
    pub fn client(&self) -> &ApiClient {
        &self.client
    }
}

fn restore_identity(store: &dyn CredentialStore) -> Option<Identity> {
    let pair = match store.get() {
        Ok(Some(pair)) => pair,
        Ok(None) => return None,
        Err(e) => {
            warn!(error = %e, "Could not read stored credentials, starting logged out");
            return None;
        }
    };

    match decode_identity(pair.access_token()) {
        Ok(identity) => {
            info!(subject = %identity.subject, "Resumed stored session");
            Some(identity)
        }
        Err(e) => {
            warn!(error = %e, "Stored access token is unreadable, discarding it");
            if let Err(e) = store.remove() {
                warn!(error = %e, "Failed to erase unreadable credentials");
            }
            None
        }
    }
}
