use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::ApiError;

/// Body of an outgoing request. Kept as data so the request can be replayed.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum RequestBody {
    #[default]
    Empty,
    Json(serde_json::Value),
    Form(Vec<(String, String)>),
}

/// Description of one API call, replayable after a credential refresh.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    method: Method,
    target: String,
    query: Vec<(String, String)>,
    headers: HeaderMap,
    body: RequestBody,
    retried: bool,
    sent_with: Option<String>,
}

impl ApiRequest {
    /// `target` is a path relative to the configured base URL, or an absolute URL.
    pub fn new(method: Method, target: impl Into<String>) -> Self {
        Self {
            method,
            target: target.into(),
            query: Vec::new(),
            headers: HeaderMap::new(),
            body: RequestBody::Empty,
            retried: false,
            sent_with: None,
        }
    }

    pub fn get(target: impl Into<String>) -> Self {
        Self::new(Method::GET, target)
    }

    pub fn post(target: impl Into<String>) -> Self {
        Self::new(Method::POST, target)
    }

    pub fn put(target: impl Into<String>) -> Self {
        Self::new(Method::PUT, target)
    }

    pub fn delete(target: impl Into<String>) -> Self {
        Self::new(Method::DELETE, target)
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn json<B: Serialize + ?Sized>(mut self, body: &B) -> Result<Self, ApiError> {
        let value =
            serde_json::to_value(body).map_err(|e| ApiError::InvalidRequest(e.to_string()))?;
        self.body = RequestBody::Json(value);
        Ok(self)
    }

    pub fn form(mut self, fields: Vec<(String, String)>) -> Self {
        self.body = RequestBody::Form(fields);
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn query_pairs(&self) -> &[(String, String)] {
        &self.query
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &RequestBody {
        &self.body
    }

    /// Whether this request already went through one refresh-and-replay.
    pub fn is_retry(&self) -> bool {
        self.retried
    }

    pub(crate) fn mark_retried(&mut self) {
        self.retried = true;
    }

    /// Access token attached the last time this request was sent.
    pub(crate) fn sent_with(&self) -> Option<&str> {
        self.sent_with.as_deref()
    }

    pub(crate) fn set_sent_with(&mut self, token: Option<String>) {
        self.sent_with = token;
    }
}

/// Successful (2xx) response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiResponse {
    status: u16,
    body: String,
}

impl ApiResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn into_body(self) -> String {
        self.body
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ApiError> {
        Ok(serde_json::from_str(&self.body)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::ACCEPT;

    #[test]
    fn test_builder_collects_parts() {
        let request = ApiRequest::post("chat")
            .query("stream", "false")
            .header(ACCEPT, HeaderValue::from_static("application/json"))
            .json(&serde_json::json!({"prompt": "hello"}))
            .expect("json body");

        assert_eq!(request.method(), &Method::POST);
        assert_eq!(request.target(), "chat");
        assert_eq!(request.query_pairs(), &[("stream".to_string(), "false".to_string())]);
        assert_eq!(request.headers().get(ACCEPT).map(|v| v.as_bytes()), Some(&b"application/json"[..]));
        assert_eq!(
            request.body(),
            &RequestBody::Json(serde_json::json!({"prompt": "hello"}))
        );
        assert!(!request.is_retry());
        assert!(request.sent_with().is_none());
    }

    #[test]
    fn test_response_json() {
        let response = ApiResponse::new(200, r#"[{"username":"root","access_level":2}]"#);
        let users: Vec<serde_json::Value> = response.json().expect("parse");
        assert_eq!(users[0]["username"], "root");

        let bad = ApiResponse::new(200, "<html>");
        assert!(matches!(bad.json::<serde_json::Value>(), Err(ApiError::InvalidResponse(_))));
    }
}
