//! tokenrelay core - authenticated HTTP client with single-flight credential
//! refresh.
//!
//! Requests made through [`ApiClient`] carry the stored access token. When
//! the server answers that the token has expired, one refresh call is made
//! no matter how many requests failed at once, and every affected request is
//! replayed in the order it arrived. If the refresh itself fails the stored
//! credentials are erased and the [`SessionController`] logs out.

pub mod api;
pub mod auth;
pub mod config;

#[cfg(test)]
pub(crate) mod test_support;

pub use api::{ApiClient, ApiClientBuilder, ApiError, ApiRequest, ApiResponse, Transport};
pub use auth::{
    CredentialPair, CredentialStore, FileCredentialStore, Identity, KeyringCredentialStore,
    LoginError, LogoutReason, MemoryCredentialStore, Role, SessionController, SessionEvent,
};
pub use config::{ClientConfig, StoreKind};
