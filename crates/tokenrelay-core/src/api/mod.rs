//! REST API client module.
//!
//! This module provides the `ApiClient` for calling an API that authorizes
//! requests with short-lived JWT bearer tokens. The access token is attached
//! to every request; when the server answers with the authorization-expired
//! status the `RefreshCoordinator` exchanges the refresh token for a new pair
//! exactly once and replays every affected request in arrival order.

pub mod client;
mod dispatch;
pub mod error;
pub mod interceptor;
pub mod refresh;
pub mod request;
pub mod transport;

pub use client::{ApiClient, ApiClientBuilder};
pub use error::ApiError;
pub use interceptor::RequestInterceptor;
pub use refresh::{CredentialsRotatedHook, RefreshCoordinator, SessionExpiredHook};
pub use request::{ApiRequest, ApiResponse, RequestBody};
pub use transport::{HttpRequest, HttpResponse, ReqwestTransport, Transport};
