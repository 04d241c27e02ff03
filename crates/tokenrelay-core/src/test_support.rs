//! In-process fakes shared by the unit tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use reqwest::Method;
use tokio::sync::Notify;

use crate::api::{ApiError, HttpRequest, HttpResponse, RefreshCoordinator, RequestBody, Transport};
use crate::auth::CredentialPair;
use crate::config::ClientConfig;

pub(crate) const BASE_URL: &str = "http://api.test/v1/";

/// Far-future expiry so decoded identities never look expired.
const FAR_FUTURE_EXP: i64 = 4_102_444_800;

pub(crate) fn test_config() -> ClientConfig {
    ClientConfig {
        base_url: BASE_URL.to_string(),
        ..ClientConfig::default()
    }
}

/// Unsigned JWT for `subject`. Each `generation` expires one minute after
/// the previous one, so successive tokens decode to distinct identities.
pub(crate) fn token_for(subject: &str, generation: usize) -> String {
    let header = URL_SAFE_NO_PAD.encode(r#"{"alg":"HS256","typ":"JWT"}"#);
    let claims = serde_json::json!({
        "sub": subject,
        "role": "basic",
        "exp": FAR_FUTURE_EXP + 60 * generation as i64,
        "jti": generation,
    });
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
    format!("{}.{}.sig{}", header, payload, generation)
}

/// Pair the fake server has already stopped accepting.
pub(crate) fn expired_pair() -> CredentialPair {
    CredentialPair::new(token_for("testuser", 0), "refresh-0")
}

/// Poll until `n` requests are parked behind the running refresh.
pub(crate) async fn wait_for_pending(coordinator: &RefreshCoordinator, n: usize) {
    for _ in 0..1000 {
        if coordinator.pending().await >= n {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("expected {} pending requests, saw {}", n, coordinator.pending().await);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Seen {
    pub method: Method,
    pub path: String,
    pub bearer: Option<String>,
}

/// Stand-in for the authorization server and the API behind it.
///
/// `token` with a form body is login, `token` with a JSON body is refresh.
/// `status/<code>` answers `<code>`. Any other path answers 200 for the
/// current access token and 403 otherwise.
pub(crate) struct FakeAuthServer {
    valid_access: Mutex<Option<String>>,
    valid_refresh: Mutex<String>,
    generation: AtomicUsize,
    refresh_calls: AtomicUsize,
    login_calls: AtomicUsize,
    refuse_refresh: AtomicBool,
    opaque_refresh: AtomicBool,
    refresh_gate: Option<Arc<Notify>>,
    forbidden: Mutex<Vec<String>>,
    log: Mutex<Vec<Seen>>,
}

impl FakeAuthServer {
    pub(crate) fn new() -> Self {
        Self {
            valid_access: Mutex::new(None),
            valid_refresh: Mutex::new("refresh-0".to_string()),
            generation: AtomicUsize::new(0),
            refresh_calls: AtomicUsize::new(0),
            login_calls: AtomicUsize::new(0),
            refuse_refresh: AtomicBool::new(false),
            opaque_refresh: AtomicBool::new(false),
            refresh_gate: None,
            forbidden: Mutex::new(Vec::new()),
            log: Mutex::new(Vec::new()),
        }
    }

    /// Refresh calls block until the gate is notified.
    pub(crate) fn with_refresh_gate(mut self, gate: Arc<Notify>) -> Self {
        self.refresh_gate = Some(gate);
        self
    }

    pub(crate) fn refuse_refresh(&self) {
        self.refuse_refresh.store(true, Ordering::SeqCst);
    }

    /// Refresh hands out an access token that is not a JWT.
    pub(crate) fn issue_opaque_tokens(&self) {
        self.opaque_refresh.store(true, Ordering::SeqCst);
    }

    /// Answer 403 on `path` whatever credential is presented.
    pub(crate) fn forbid(&self, path: &str) {
        self.forbidden.lock().unwrap().push(path.to_string());
    }

    /// Stop accepting the current access token.
    pub(crate) fn expire_access(&self) {
        *self.valid_access.lock().unwrap() = None;
    }

    pub(crate) fn refresh_calls(&self) -> usize {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn login_calls(&self) -> usize {
        self.login_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn log(&self) -> Vec<Seen> {
        self.log.lock().unwrap().clone()
    }

    pub(crate) fn current_access(&self) -> Option<String> {
        self.valid_access.lock().unwrap().clone()
    }

    fn issue_pair(&self) -> (String, String) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let access = token_for("testuser", generation);
        let refresh = format!("refresh-{}", generation);
        *self.valid_access.lock().unwrap() = Some(access.clone());
        *self.valid_refresh.lock().unwrap() = refresh.clone();
        (access, refresh)
    }

    fn login(&self, fields: &[(String, String)]) -> HttpResponse {
        self.login_calls.fetch_add(1, Ordering::SeqCst);
        let field = |name: &str| {
            fields
                .iter()
                .find(|(key, _)| key == name)
                .map(|(_, value)| value.as_str())
        };
        if field("username") != Some("testuser") || field("password") != Some("testpass") {
            return HttpResponse::new(401, r#"{"detail":"Incorrect username or password"}"#);
        }
        let (access, refresh) = self.issue_pair();
        let body = serde_json::json!({
            "access_token": access,
            "refresh_token": refresh,
            "token_type": "bearer",
        });
        HttpResponse::new(200, body.to_string())
    }

    async fn refresh(&self, body: &serde_json::Value) -> HttpResponse {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.refresh_gate {
            gate.notified().await;
        }
        if self.refuse_refresh.load(Ordering::SeqCst) {
            return HttpResponse::new(401, r#"{"detail":"Invalid refresh token"}"#);
        }
        let presented = body.get("token").and_then(|t| t.as_str()).unwrap_or_default();
        let expected = self.valid_refresh.lock().unwrap().clone();
        if presented != expected {
            return HttpResponse::new(401, r#"{"detail":"Invalid refresh token"}"#);
        }
        let (mut access, refresh) = self.issue_pair();
        if self.opaque_refresh.load(Ordering::SeqCst) {
            access = "opaque".to_string();
            *self.valid_access.lock().unwrap() = Some(access.clone());
        }
        let body = serde_json::json!({ "accessToken": access, "refreshToken": refresh });
        HttpResponse::new(200, body.to_string())
    }
}

#[async_trait]
impl Transport for FakeAuthServer {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, ApiError> {
        let path = request
            .url
            .strip_prefix(BASE_URL)
            .unwrap_or(&request.url)
            .to_string();
        let bearer = request.bearer_token().map(str::to_string);
        self.log.lock().unwrap().push(Seen {
            method: request.method.clone(),
            path: path.clone(),
            bearer: bearer.clone(),
        });

        if path == "token" {
            return Ok(match &request.body {
                RequestBody::Form(fields) => self.login(fields),
                RequestBody::Json(value) => self.refresh(value).await,
                RequestBody::Empty => HttpResponse::new(422, r#"{"detail":"body required"}"#),
            });
        }

        if let Some(code) = path.strip_prefix("status/").and_then(|c| c.parse::<u16>().ok()) {
            return Ok(HttpResponse::new(code, r#"{"detail":"Scripted failure"}"#));
        }

        let forbidden = self.forbidden.lock().unwrap().contains(&path);
        if forbidden {
            return Ok(HttpResponse::new(403, r#"{"detail":"Not allowed"}"#));
        }
        let valid = self.current_access();
        if bearer.is_some() && bearer == valid {
            let body = serde_json::json!({ "path": path });
            Ok(HttpResponse::new(200, body.to_string()))
        } else {
            Ok(HttpResponse::new(403, r#"{"detail":"Token expired"}"#))
        }
    }
}

/// Answers every request with the same response and keeps what it was sent.
pub(crate) struct RecordingTransport {
    status: u16,
    body: String,
    requests: Mutex<Vec<HttpRequest>>,
}

impl RecordingTransport {
    pub(crate) fn replying(status: u16, body: &str) -> Self {
        Self {
            status,
            body: body.to_string(),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, ApiError> {
        self.requests.lock().unwrap().push(request);
        Ok(HttpResponse::new(self.status, self.body.clone()))
    }
}
