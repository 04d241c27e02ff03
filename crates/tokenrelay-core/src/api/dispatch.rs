use std::sync::Arc;

use reqwest::header::{HeaderValue, ACCEPT, AUTHORIZATION};
use reqwest::{Method, Url};
use serde::Deserialize;
use tracing::debug;

use super::interceptor::RequestInterceptor;
use super::request::{ApiRequest, ApiResponse, RequestBody};
use super::transport::{HttpRequest, Transport};
use super::ApiError;
use crate::auth::CredentialPair;
use crate::config::ClientConfig;

/// Token pair as returned by the login and refresh endpoints. The login
/// endpoint answers in snake_case, the refresh endpoint in camelCase.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(alias = "accessToken")]
    access_token: String,
    #[serde(alias = "refreshToken")]
    refresh_token: String,
}

impl From<TokenResponse> for CredentialPair {
    fn from(tokens: TokenResponse) -> Self {
        CredentialPair::new(tokens.access_token, tokens.refresh_token)
    }
}

/// Sends requests: resolves the URL, runs the request interceptor, performs
/// the exchange and classifies the status. Knows nothing about refreshing.
pub(crate) struct Dispatcher {
    config: ClientConfig,
    transport: Arc<dyn Transport>,
    interceptor: RequestInterceptor,
}

impl Dispatcher {
    pub(crate) fn new(
        config: ClientConfig,
        transport: Arc<dyn Transport>,
        interceptor: RequestInterceptor,
    ) -> Self {
        Self {
            config,
            transport,
            interceptor,
        }
    }

    pub(crate) fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn resolve_url(&self, request: &ApiRequest) -> Result<String, ApiError> {
        let url = self.config.endpoint_url(request.target());
        if request.query_pairs().is_empty() {
            return Ok(url);
        }
        let url = Url::parse_with_params(&url, request.query_pairs())
            .map_err(|e| ApiError::InvalidRequest(format!("{}: {}", url, e)))?;
        Ok(url.into())
    }

    /// Login and refresh endpoints never carry a credential and never count
    /// as expiry, whoever calls them.
    fn is_token_endpoint(&self, request: &ApiRequest) -> bool {
        let url = self.config.endpoint_url(request.target());
        url == self.config.login_url() || url == self.config.refresh_url()
    }

    /// Send `request` with the current credential attached. Records which
    /// access token went out so the coordinator can spot stale failures.
    pub(crate) async fn dispatch(&self, request: &mut ApiRequest) -> Result<ApiResponse, ApiError> {
        let url = self.resolve_url(request)?;
        let mut http = HttpRequest::new(request.method().clone(), url)
            .with_body(request.body().clone());
        http.headers = request.headers().clone();
        let exempt = self.is_token_endpoint(request);
        let token = if exempt {
            http.headers.remove(AUTHORIZATION);
            None
        } else {
            self.interceptor.attach(&mut http.headers)
        };
        request.set_sent_with(token);

        debug!(
            method = %request.method(),
            target = request.target(),
            retry = request.is_retry(),
            "Sending API request"
        );
        let response = self.transport.send(http).await?;
        if response.is_success() {
            Ok(ApiResponse::new(response.status, response.body))
        } else if exempt {
            Err(ApiError::Http {
                status: response.status,
                detail: ApiError::detail_from_body(&response.body),
            })
        } else {
            Err(ApiError::from_status(
                response.status,
                &response.body,
                self.config.authorization_expired_status,
            ))
        }
    }

    /// Exchange username and password for a credential pair. Bypasses the
    /// interceptor: the login call never carries or refreshes a credential.
    pub(crate) async fn login(&self, username: &str, password: &str) -> Result<CredentialPair, ApiError> {
        let body = RequestBody::Form(vec![
            ("username".to_string(), username.to_string()),
            ("password".to_string(), password.to_string()),
        ]);
        self.exchange_tokens(self.config.login_url(), body).await
    }

    /// Exchange a refresh token for a new credential pair.
    pub(crate) async fn refresh(&self, refresh_token: &str) -> Result<CredentialPair, ApiError> {
        let body = RequestBody::Json(serde_json::json!({ "token": refresh_token }));
        self.exchange_tokens(self.config.refresh_url(), body).await
    }

    async fn exchange_tokens(&self, url: String, body: RequestBody) -> Result<CredentialPair, ApiError> {
        let mut http = HttpRequest::new(Method::POST, url).with_body(body);
        http.headers
            .insert(ACCEPT, HeaderValue::from_static("application/json"));

        let response = self.transport.send(http).await?;
        if !response.is_success() {
            // Any status, including the expiry one, is a plain failure here
            return Err(ApiError::Http {
                status: response.status,
                detail: ApiError::detail_from_body(&response.body),
            });
        }
        let tokens: TokenResponse = serde_json::from_str(&response.body)
            .map_err(|e| ApiError::InvalidResponse(format!("Failed to parse token response: {}", e)))?;
        Ok(tokens.into())
    }
}
