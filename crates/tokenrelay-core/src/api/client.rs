//! API client for services that hand out short-lived bearer tokens.
//!
//! Every request goes through the request interceptor (credential attached),
//! the transport, and status classification. An authorization-expired
//! failure is handed to the [`RefreshCoordinator`]; anything else is returned
//! to the caller untouched.

use std::sync::Arc;
use std::time::Duration;

use serde::{de::DeserializeOwned, Serialize};

use super::dispatch::Dispatcher;
use super::interceptor::RequestInterceptor;
use super::refresh::{CoordinatorHooks, CredentialsRotatedHook, RefreshCoordinator, SessionExpiredHook};
use super::request::{ApiRequest, ApiResponse};
use super::transport::{ReqwestTransport, Transport};
use super::ApiError;
use crate::auth::{CredentialPair, CredentialStore};
use crate::config::ClientConfig;

/// Authenticated API client.
/// Clone is cheap and clones share the credential store and refresh state.
#[derive(Clone)]
pub struct ApiClient {
    dispatcher: Arc<Dispatcher>,
    coordinator: RefreshCoordinator,
    store: Arc<dyn CredentialStore>,
}

pub struct ApiClientBuilder {
    config: ClientConfig,
    store: Arc<dyn CredentialStore>,
    transport: Option<Arc<dyn Transport>>,
    refresh_timeout: Option<Duration>,
    hooks: CoordinatorHooks,
}

impl ApiClientBuilder {
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Override `refresh_timeout_secs` from the config.
    pub fn refresh_timeout(mut self, timeout: Duration) -> Self {
        self.refresh_timeout = Some(timeout);
        self
    }

    pub fn on_session_expired(mut self, hook: SessionExpiredHook) -> Self {
        self.hooks.session_expired = Some(hook);
        self
    }

    pub fn on_credentials_rotated(mut self, hook: CredentialsRotatedHook) -> Self {
        self.hooks.credentials_rotated = Some(hook);
        self
    }

    pub fn build(self) -> Result<ApiClient, ApiError> {
        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(ReqwestTransport::new(self.config.request_timeout())?),
        };
        let refresh_timeout = self
            .refresh_timeout
            .unwrap_or_else(|| self.config.refresh_timeout());

        let interceptor = RequestInterceptor::new(Arc::clone(&self.store));
        let dispatcher = Arc::new(Dispatcher::new(self.config, transport, interceptor));
        let coordinator = RefreshCoordinator::new(
            Arc::clone(&dispatcher),
            Arc::clone(&self.store),
            refresh_timeout,
            self.hooks,
        );

        Ok(ApiClient {
            dispatcher,
            coordinator,
            store: self.store,
        })
    }
}

impl ApiClient {
    /// Create a client that talks HTTP through `reqwest`.
    pub fn new(config: ClientConfig, store: Arc<dyn CredentialStore>) -> Result<Self, ApiError> {
        Self::builder(config, store).build()
    }

    pub fn builder(config: ClientConfig, store: Arc<dyn CredentialStore>) -> ApiClientBuilder {
        ApiClientBuilder {
            config,
            store,
            transport: None,
            refresh_timeout: None,
            hooks: CoordinatorHooks::default(),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        self.dispatcher.config()
    }

    pub fn store(&self) -> &Arc<dyn CredentialStore> {
        &self.store
    }

    pub fn coordinator(&self) -> &RefreshCoordinator {
        &self.coordinator
    }

    /// Send a request, refreshing the credential and replaying once if the
    /// server reports it expired.
    pub async fn execute(&self, request: ApiRequest) -> Result<ApiResponse, ApiError> {
        let mut request = request;
        match self.dispatcher.dispatch(&mut request).await {
            Err(error) if error.is_authorization_expired() => {
                self.coordinator.recover(request, error).await
            }
            outcome => outcome,
        }
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.execute(ApiRequest::get(path)).await?.json()
    }

    pub async fn post_json<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        self.execute(ApiRequest::post(path).json(body)?).await?.json()
    }

    pub async fn put_json<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        self.execute(ApiRequest::put(path).json(body)?).await?.json()
    }

    pub async fn delete(&self, path: &str) -> Result<ApiResponse, ApiError> {
        self.execute(ApiRequest::delete(path)).await
    }

    /// Call the login endpoint. The pair is returned, not stored.
    pub(crate) async fn exchange_password(
        &self,
        username: &str,
        password: &str,
    ) -> Result<CredentialPair, ApiError> {
        self.dispatcher.login(username, password).await
    }
}
