//! Single-flight credential refresh.
//!
//! When a request comes back with the authorization-expired status the
//! coordinator either starts a refresh cycle (`IDLE`) or parks the request
//! behind the cycle already running (`REFRESHING`). A cycle performs exactly
//! one refresh call and then settles every parked request in arrival order:
//! replayed with the new credential on success, rejected with the refresh
//! error on failure.
//!
//! A cycle only replaces or erases the pair it started from. When a login
//! stores a different pair while the refresh call is out, the cycle leaves
//! that pair alone, fires no hook and replays the parked requests with it.
//!
//! The cycle runs on its own task. A caller that stops waiting cannot leave
//! the coordinator stuck in `REFRESHING`; its entry is still popped once and
//! its replay is skipped. A panicking hook fails the parked requests and
//! returns the coordinator to `IDLE`.

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, error, info, warn};

use super::dispatch::Dispatcher;
use super::request::{ApiRequest, ApiResponse};
use super::ApiError;
use crate::auth::{CredentialPair, CredentialStore};

/// Called once per failed cycle, after the credential pair is erased and
/// before any parked caller sees the error.
pub type SessionExpiredHook = Arc<dyn Fn(&ApiError) + Send + Sync>;

/// Called after a refresh stored a new credential pair.
pub type CredentialsRotatedHook = Arc<dyn Fn(&CredentialPair) + Send + Sync>;

type Reply = oneshot::Sender<Result<ApiResponse, ApiError>>;

struct PendingRequest {
    request: ApiRequest,
    reply: Reply,
}

#[derive(Default)]
struct RefreshState {
    refreshing: bool,
    queue: VecDeque<PendingRequest>,
    cycles: u64,
}

#[derive(Default, Clone)]
pub(crate) struct CoordinatorHooks {
    pub(crate) session_expired: Option<SessionExpiredHook>,
    pub(crate) credentials_rotated: Option<CredentialsRotatedHook>,
}

struct Inner {
    dispatcher: Arc<Dispatcher>,
    store: Arc<dyn CredentialStore>,
    refresh_timeout: Duration,
    hooks: CoordinatorHooks,
    state: Mutex<RefreshState>,
}

/// Owns the refresh state of one [`ApiClient`](super::ApiClient).
#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<Inner>,
}

impl RefreshCoordinator {
    pub(crate) fn new(
        dispatcher: Arc<Dispatcher>,
        store: Arc<dyn CredentialStore>,
        refresh_timeout: Duration,
        hooks: CoordinatorHooks,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                dispatcher,
                store,
                refresh_timeout,
                hooks,
                state: Mutex::new(RefreshState::default()),
            }),
        }
    }

    pub async fn is_refreshing(&self) -> bool {
        self.inner.state.lock().await.refreshing
    }

    /// Requests waiting on the running cycle, the triggering one included.
    pub async fn pending(&self) -> usize {
        self.inner.state.lock().await.queue.len()
    }

    /// Refresh cycles started since creation.
    pub async fn cycles(&self) -> u64 {
        self.inner.state.lock().await.cycles
    }

    /// Handle a request whose last attempt failed with `failure`, an
    /// authorization-expired error.
    pub(crate) async fn recover(
        &self,
        mut request: ApiRequest,
        failure: ApiError,
    ) -> Result<ApiResponse, ApiError> {
        if request.is_retry() {
            debug!(target = request.target(), "Replayed request expired again, giving up");
            return Err(failure);
        }
        request.mark_retried();

        let (reply, outcome) = oneshot::channel();
        {
            let mut state = self.inner.state.lock().await;
            if !state.refreshing {
                if self.inner.credential_rotated_since(&request) {
                    drop(state);
                    debug!(target = request.target(), "Credential already refreshed, replaying");
                    return self.inner.dispatcher.dispatch(&mut request).await;
                }
                state.refreshing = true;
                state.cycles += 1;
                state.queue.push_back(PendingRequest { request, reply });
                tokio::spawn(Arc::clone(&self.inner).run_cycle());
            } else {
                debug!(
                    target = request.target(),
                    queued = state.queue.len() + 1,
                    "Refresh in progress, queueing request"
                );
                state.queue.push_back(PendingRequest { request, reply });
            }
        }

        outcome.await.unwrap_or_else(|_| {
            Err(ApiError::InvalidResponse(
                "Refresh cycle ended without settling the request".to_string(),
            ))
        })
    }
}

impl Inner {
    /// True when the store now holds a different access token than the one
    /// this request failed with.
    fn credential_rotated_since(&self, request: &ApiRequest) -> bool {
        match self.store.access_token() {
            Ok(Some(current)) => request.sent_with() != Some(current.as_str()),
            _ => false,
        }
    }

    async fn run_cycle(self: Arc<Self>) {
        let cycle = AssertUnwindSafe(Arc::clone(&self).settle_cycle()).catch_unwind();
        if cycle.await.is_err() {
            error!("Refresh cycle panicked, abandoning queued requests");
            self.abandon_queue().await;
        }
    }

    async fn settle_cycle(self: Arc<Self>) {
        info!("Access credential expired, refreshing");
        let started_from = match self.store.get() {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "Could not read credentials for refresh, ending session");
                if let Err(e) = self.store.remove() {
                    warn!(error = %e, "Failed to erase unreadable credentials");
                }
                self.reject_queue(ApiError::Storage(e.to_string())).await;
                return;
            }
        };

        let outcome = match &started_from {
            Some(current) => self.refresh_credentials(current).await,
            None => Err(ApiError::NotAuthenticated),
        };

        // Only the pair this cycle started from may be replaced or erased
        let written = match &outcome {
            Ok(pair) => self.store.compare_and_swap(started_from.as_ref(), Some(pair)),
            Err(_) => self.store.compare_and_swap(started_from.as_ref(), None),
        };

        match (outcome, written) {
            (Ok(pair), Ok(true)) => {
                info!("Credential refresh succeeded, replaying queued requests");
                if let Some(hook) = &self.hooks.credentials_rotated {
                    hook(&pair);
                }
                self.replay_queue().await;
            }
            (Err(error), Ok(true)) => {
                warn!(error = %error, "Credential refresh failed, ending session");
                self.reject_queue(error).await;
            }
            (_, Ok(false)) => {
                info!("Credentials replaced during refresh, replaying with the stored pair");
                self.replay_queue().await;
            }
            (_, Err(e)) => {
                warn!(error = %e, "Failed to write credentials after refresh, ending session");
                if let Err(e) = self.store.remove() {
                    warn!(error = %e, "Failed to erase credentials after refresh failure");
                }
                self.reject_queue(ApiError::Storage(e.to_string())).await;
            }
        }
    }

    /// Exchange the refresh token of `current` for a new pair. Does not
    /// touch the store.
    async fn refresh_credentials(&self, current: &CredentialPair) -> Result<CredentialPair, ApiError> {
        let exchange = self.dispatcher.refresh(current.refresh_token());
        tokio::time::timeout(self.refresh_timeout, exchange)
            .await
            .map_err(|_| {
                ApiError::Timeout(format!(
                    "Credential refresh took longer than {:?}",
                    self.refresh_timeout
                ))
            })?
    }

    /// Replay parked requests one at a time, oldest first. The state stays
    /// `REFRESHING` until the queue is observed empty under the lock, so
    /// requests parked during the drain are replayed by this cycle too.
    async fn replay_queue(&self) {
        let mut replayed = 0usize;
        loop {
            let next = {
                let mut state = self.state.lock().await;
                match state.queue.pop_front() {
                    Some(pending) => pending,
                    None => {
                        state.refreshing = false;
                        break;
                    }
                }
            };

            let PendingRequest { mut request, reply } = next;
            if reply.is_closed() {
                debug!(target = request.target(), "Caller went away, skipping replay");
                continue;
            }
            let outcome = self.dispatcher.dispatch(&mut request).await;
            replayed += 1;
            if reply.send(outcome).is_err() {
                debug!(target = request.target(), "Caller went away during replay");
            }
        }
        debug!(replayed, "Refresh cycle complete");
    }

    /// Fail every parked request with the refresh error. The caller has
    /// already erased the pair.
    async fn reject_queue(&self, error: ApiError) {
        let abandoned: Vec<PendingRequest> = {
            let mut state = self.state.lock().await;
            state.refreshing = false;
            state.queue.drain(..).collect()
        };

        let fatal = ApiError::RefreshFailed(Box::new(error));
        if let Some(hook) = &self.hooks.session_expired {
            hook(&fatal);
        }

        debug!(rejected = abandoned.len(), "Rejecting queued requests");
        for pending in abandoned {
            let _ = pending.reply.send(Err(fatal.clone()));
        }
    }

    /// Return to `IDLE` after a cycle that died without settling its queue.
    async fn abandon_queue(&self) {
        let abandoned: Vec<PendingRequest> = {
            let mut state = self.state.lock().await;
            state.refreshing = false;
            state.queue.drain(..).collect()
        };
        for pending in abandoned {
            let _ = pending.reply.send(Err(ApiError::InvalidResponse(
                "Refresh cycle aborted".to_string(),
            )));
        }
    }
}
