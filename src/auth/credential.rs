//! Credential extraction from request headers and the nonce parameter.

use std::collections::HashMap;
use std::fmt;

use http::HeaderMap;
use serde::{Deserialize, Serialize};

/// Supported credential formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scheme {
    Bearer,
    Basic,
    Hmac,
    ApiKey,
    Nonce,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bearer => "bearer",
            Self::Basic => "basic",
            Self::Hmac => "hmac",
            Self::ApiKey => "api_key",
            Self::Nonce => "nonce",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A raw credential as found on the request. Never persisted.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub scheme: Scheme,
    pub value: String,
    /// Where the value came from, e.g. `header:authorization`.
    pub source: String,
}

impl Credential {
    pub fn new(scheme: Scheme, value: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            scheme,
            value: value.into(),
            source: source.into(),
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("scheme", &self.scheme)
            .field("value", &"<redacted>")
            .field("source", &self.source)
            .finish()
    }
}

pub const AUTHORIZATION: &str = "authorization";
pub const X_AUTHORIZATION: &str = "x-authorization";
pub const X_AUTH_TOKEN: &str = "x-auth-token";
pub const X_API_KEY: &str = "x-api-key";
pub const X_AUTH_SIGNATURE: &str = "x-auth-signature";
pub const X_AUTH_NONCE: &str = "x-auth-nonce";
pub const X_AUTH_IDENTITY: &str = "x-auth-identity";
pub const X_AUTH_TIMESTAMP: &str = "x-auth-timestamp";

/// How the value of a recognised header is typed.
#[derive(Debug, Clone, Copy)]
enum HeaderKind {
    /// Scheme chosen by prefix; unprefixed values are bearer tokens.
    Generic,
    ApiKey,
    HmacSignature,
    Nonce,
}

/// Header lookup order. The first header present wins; the rest are ignored.
const HEADER_PRIORITY: [(&str, HeaderKind); 6] = [
    (AUTHORIZATION, HeaderKind::Generic),
    (X_AUTHORIZATION, HeaderKind::Generic),
    (X_AUTH_TOKEN, HeaderKind::Generic),
    (X_API_KEY, HeaderKind::ApiKey),
    (X_AUTH_SIGNATURE, HeaderKind::HmacSignature),
    (X_AUTH_NONCE, HeaderKind::Nonce),
];

const PREFIXES: [(&str, Scheme); 3] = [
    ("bearer ", Scheme::Bearer),
    ("basic ", Scheme::Basic),
    ("hmac ", Scheme::Hmac),
];

/// Strip `prefix` from `value`, ignoring ASCII case.
fn strip_prefix_ignore_case<'a>(value: &'a str, prefix: &str) -> Option<&'a str> {
    let head = value.get(..prefix.len())?;
    if head.eq_ignore_ascii_case(prefix) {
        value.get(prefix.len()..)
    } else {
        None
    }
}

fn classify_generic(value: &str) -> (Scheme, &str) {
    for (prefix, scheme) in PREFIXES {
        if let Some(rest) = strip_prefix_ignore_case(value, prefix) {
            return (scheme, rest.trim());
        }
    }
    (Scheme::Bearer, value)
}

/// First value of a header as a trimmed, non-empty string.
pub fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Turns request headers (and one fallback parameter) into a [`Credential`].
#[derive(Debug, Clone)]
pub struct CredentialExtractor {
    nonce_param: String,
}

impl Default for CredentialExtractor {
    fn default() -> Self {
        Self::new("_auth_nonce")
    }
}

impl CredentialExtractor {
    pub fn new(nonce_param: impl Into<String>) -> Self {
        Self {
            nonce_param: nonce_param.into(),
        }
    }

    /// Extract the single credential the request carries.
    ///
    /// Returns `None` for anonymous requests.
    pub fn extract(
        &self,
        headers: &HeaderMap,
        params: &HashMap<String, String>,
    ) -> Option<Credential> {
        for (name, kind) in HEADER_PRIORITY {
            let Some(value) = header_value(headers, name) else {
                continue;
            };
            let source = format!("header:{}", name);
            let credential = match kind {
                HeaderKind::Generic => {
                    let (scheme, rest) = classify_generic(value);
                    Credential::new(scheme, rest, source)
                }
                HeaderKind::ApiKey => Credential::new(Scheme::ApiKey, value, source),
                HeaderKind::HmacSignature => Credential::new(Scheme::Hmac, value, source),
                HeaderKind::Nonce => Credential::new(Scheme::Nonce, value, source),
            };
            return Some(credential);
        }

        params
            .get(&self.nonce_param)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
            .map(|v| Credential::new(Scheme::Nonce, v, format!("param:{}", self.nonce_param)))
    }
}
