//! Access token decoding.
//!
//! Access tokens are JWTs. Only the payload segment is read here; signature
//! checks belong to the server that issued the token.

use std::fmt;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// `access_level` at or above this is an administrator.
const ADMIN_ACCESS_LEVEL: i64 = 2;

/// Account that is treated as an administrator even without a role claim.
const ROOT_SUBJECT: &str = "root";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Token is not a three-part JWT")]
    Malformed,

    #[error("Token payload is not valid base64url: {0}")]
    Encoding(String),

    #[error("Token payload is not a valid claim set: {0}")]
    Claims(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Basic,
    Admin,
    Other(String),
}

impl Role {
    fn from_claim(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "basic" | "user" => Role::Basic,
            "admin" | "administrator" => Role::Admin,
            _ => Role::Other(value.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Role::Basic => "basic",
            Role::Admin => "admin",
            Role::Other(name) => name,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Deserialize)]
struct RawClaims {
    sub: String,
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    access_level: Option<i64>,
    #[serde(default)]
    exp: Option<i64>,
}

/// Who the current access token says we are.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Identity {
    pub subject: String,
    pub role: Role,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Identity {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at.map(|at| Utc::now() >= at).unwrap_or(false)
    }

    pub fn time_until_expiry(&self) -> Option<Duration> {
        self.expires_at.map(|at| at - Utc::now())
    }
}

/// Decode the identity claims carried by an access token.
pub fn decode_identity(token: &str) -> Result<Identity, CodecError> {
    let mut segments = token.split('.');
    let payload = match (segments.next(), segments.next(), segments.next(), segments.next()) {
        (Some(header), Some(payload), Some(_signature), None)
            if !header.is_empty() && !payload.is_empty() =>
        {
            payload
        }
        _ => return Err(CodecError::Malformed),
    };

    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| CodecError::Encoding(e.to_string()))?;
    let claims: RawClaims =
        serde_json::from_slice(&bytes).map_err(|e| CodecError::Claims(e.to_string()))?;

    let role = match (&claims.role, claims.access_level) {
        (Some(role), _) => Role::from_claim(role),
        (None, Some(level)) if level >= ADMIN_ACCESS_LEVEL => Role::Admin,
        (None, Some(_)) => Role::Basic,
        (None, None) if claims.sub == ROOT_SUBJECT => Role::Admin,
        (None, None) => Role::Basic,
    };

    let expires_at = match claims.exp {
        Some(exp) => Some(
            DateTime::from_timestamp(exp, 0)
                .ok_or_else(|| CodecError::Claims(format!("exp {} is out of range", exp)))?,
        ),
        None => None,
    };

    Ok(Identity {
        subject: claims.sub,
        role,
        expires_at,
    })
}
