//! Request-scoped input to authentication.

use std::collections::HashMap;

use http::{HeaderMap, HeaderName, HeaderValue, Method};
use tokio::sync::OnceCell;

use crate::auth::context::Principal;

/// Outcome of authenticating one request, computed at most once.
#[derive(Debug, Clone, Default)]
pub(crate) struct Resolution {
    pub(crate) principal: Option<Principal>,
    pub(crate) refreshed_token: Option<String>,
}

/// Everything the auth pipeline needs to know about an inbound request.
///
/// The resolved principal is memoized on the request itself, so calling
/// [`crate::auth::AuthService::authenticate`] repeatedly never re-runs a verifier.
#[derive(Debug)]
pub struct AuthRequest {
    method: Method,
    path: String,
    headers: HeaderMap,
    body: Vec<u8>,
    params: HashMap<String, String>,
    client_addr: Option<String>,
    pub(crate) resolution: OnceCell<Resolution>,
}

impl AuthRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: HeaderMap::new(),
            body: Vec::new(),
            params: HashMap::new(),
            client_addr: None,
            resolution: OnceCell::new(),
        }
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    /// Append a header. Invalid names or values are skipped.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            self.headers.append(name, value);
        }
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_params(mut self, params: HashMap<String, String>) -> Self {
        self.params = params;
        self
    }

    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    pub fn with_client_addr(mut self, addr: impl Into<String>) -> Self {
        self.client_addr = Some(addr.into());
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn params(&self) -> &HashMap<String, String> {
        &self.params
    }

    pub fn client_addr(&self) -> Option<&str> {
        self.client_addr.as_deref()
    }

    /// Whether authentication already ran for this request.
    pub fn is_resolved(&self) -> bool {
        self.resolution.initialized()
    }

    /// The resolved principal, if authentication ran and succeeded.
    pub fn principal(&self) -> Option<&Principal> {
        self.resolution.get().and_then(|r| r.principal.as_ref())
    }

    /// Replacement token minted by sliding refresh, to be returned out-of-band.
    pub fn refreshed_token(&self) -> Option<&str> {
        self.resolution
            .get()
            .and_then(|r| r.refreshed_token.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let req = AuthRequest::new(Method::POST, "/orders")
            .with_header("X-API-Key", "abc")
            .with_header("bad header", "ignored")
            .with_body(b"{}".to_vec())
            .with_param("page", "2")
            .with_client_addr("10.0.0.1");

        assert_eq!(req.method(), Method::POST);
        assert_eq!(req.path(), "/orders");
        assert_eq!(req.headers().get("x-api-key").unwrap(), "abc");
        assert_eq!(req.headers().len(), 1);
        assert_eq!(req.body(), b"{}");
        assert_eq!(req.params().get("page").map(String::as_str), Some("2"));
        assert_eq!(req.client_addr(), Some("10.0.0.1"));
    }

    #[test]
    fn test_unresolved_request() {
        let req = AuthRequest::new(Method::GET, "/");
        assert!(!req.is_resolved());
        assert!(req.principal().is_none());
        assert!(req.refreshed_token().is_none());
    }
}
