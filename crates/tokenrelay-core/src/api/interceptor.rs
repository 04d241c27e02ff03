use std::sync::Arc;

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use tracing::warn;

use crate::auth::CredentialStore;

/// Attaches the stored access token to outgoing requests.
///
/// There is no error path: without a usable token the request is sent as is.
#[derive(Clone)]
pub struct RequestInterceptor {
    store: Arc<dyn CredentialStore>,
}

impl RequestInterceptor {
    pub fn new(store: Arc<dyn CredentialStore>) -> Self {
        Self { store }
    }

    /// Set `Authorization: Bearer <access token>` and return the token used.
    pub fn attach(&self, headers: &mut HeaderMap) -> Option<String> {
        let token = match self.store.access_token() {
            Ok(Some(token)) => token,
            Ok(None) => return None,
            Err(e) => {
                warn!(error = %e, "Could not read credentials, sending request without them");
                return None;
            }
        };

        match HeaderValue::from_str(&format!("Bearer {}", token)) {
            Ok(mut value) => {
                value.set_sensitive(true);
                headers.insert(AUTHORIZATION, value);
                Some(token)
            }
            Err(_) => {
                warn!("Stored access token is not a valid header value, sending request without it");
                None
            }
        }
    }
}
