use thiserror::Error;

/// Failure of a request issued through [`ApiClient`](super::ApiClient).
///
/// Clone is required: when a refresh cycle fails every queued caller is
/// rejected with the same error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    #[error("Authorization expired (status {status}): {detail}")]
    AuthorizationExpired { status: u16, detail: String },

    #[error("Request failed with status {status}: {detail}")]
    Http { status: u16, detail: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Not authenticated - no stored credentials")]
    NotAuthenticated,

    #[error("Credential storage error: {0}")]
    Storage(String),

    #[error("Session expired - credential refresh failed: {0}")]
    RefreshFailed(Box<ApiError>),
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl ApiError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            return body.to_string();
        }
        let mut end = MAX_ERROR_BODY_LENGTH;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
    }

    /// Human-readable message from an error body.
    ///
    /// Servers answer `{"detail": "..."}`; validation errors put a list there.
    pub fn detail_from_body(body: &str) -> String {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
            match value.get("detail") {
                Some(serde_json::Value::String(detail)) => return detail.clone(),
                Some(other) => return Self::truncate_body(&other.to_string()),
                None => {}
            }
        }
        Self::truncate_body(body.trim())
    }

    /// Classify a non-success response. `expired_status` is the status the
    /// API uses to say the access token is no longer accepted.
    pub fn from_status(status: u16, body: &str, expired_status: u16) -> Self {
        let detail = Self::detail_from_body(body);
        if status == expired_status {
            ApiError::AuthorizationExpired { status, detail }
        } else {
            ApiError::Http { status, detail }
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::AuthorizationExpired { status, .. } | ApiError::Http { status, .. } => {
                Some(*status)
            }
            ApiError::RefreshFailed(inner) => inner.status(),
            _ => None,
        }
    }

    pub fn detail(&self) -> Option<&str> {
        match self {
            ApiError::AuthorizationExpired { detail, .. } | ApiError::Http { detail, .. } => {
                Some(detail)
            }
            _ => None,
        }
    }

    /// The one condition that is recovered by refreshing and replaying.
    pub fn is_authorization_expired(&self) -> bool {
        matches!(self, ApiError::AuthorizationExpired { .. })
    }

    /// True when the session has been ended because of this error.
    pub fn is_session_fatal(&self) -> bool {
        matches!(self, ApiError::RefreshFailed(_))
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ApiError::Timeout(e.to_string())
        } else if e.is_decode() {
            ApiError::InvalidResponse(e.to_string())
        } else {
            ApiError::Network(e.to_string())
        }
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(e: serde_json::Error) -> Self {
        ApiError::InvalidResponse(e.to_string())
    }
}
