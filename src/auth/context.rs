//! Claims, profiles and the request-scoped principal.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::auth::credential::Scheme;
use crate::rate_limit::Tier;
use crate::types::PrincipalId;

/// How the principal of a request was authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    Bearer,
    Basic,
    Hmac,
    ApiKey,
    Nonce,
    /// Ambient host session, used only when no credential was presented.
    Session,
}

impl AuthMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bearer => "bearer",
            Self::Basic => "basic",
            Self::Hmac => "hmac",
            Self::ApiKey => "api_key",
            Self::Nonce => "nonce",
            Self::Session => "session",
        }
    }
}

impl From<Scheme> for AuthMethod {
    fn from(scheme: Scheme) -> Self {
        match scheme {
            Scheme::Bearer => Self::Bearer,
            Scheme::Basic => Self::Basic,
            Scheme::Hmac => Self::Hmac,
            Scheme::ApiKey => Self::ApiKey,
            Scheme::Nonce => Self::Nonce,
        }
    }
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a verifier established about a credential. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrincipalClaims {
    pub principal_id: PrincipalId,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub extra: Map<String, Value>,
}

impl PrincipalClaims {
    /// Claims valid for `[issued_at, expires_at]` with no denormalized grants.
    pub fn new(
        principal_id: PrincipalId,
        issued_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            principal_id,
            issued_at,
            expires_at,
            roles: Vec::new(),
            capabilities: Vec::new(),
            extra: Map::new(),
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn remaining_at(&self, now: DateTime<Utc>) -> chrono::Duration {
        self.expires_at - now
    }
}

/// Cached projection of an identity's attributes.
///
/// Shared read-only between concurrent requests for the same identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub id: PrincipalId,
    pub email: Option<String>,
    pub display_name: Option<String>,
    pub roles: Vec<String>,
    /// Role-implied capabilities unioned with explicit grants, sorted.
    pub capabilities: Vec<String>,
    /// Subscription or plan name, e.g. "premium".
    pub subscription: Option<String>,
    #[serde(default)]
    pub attributes: Map<String, Value>,
}

impl Profile {
    /// Minimal profile built from token claims when the identity store is unreachable.
    pub fn from_claims(claims: &PrincipalClaims) -> Self {
        let subscription = claims
            .extra
            .get("subscription")
            .and_then(Value::as_str)
            .map(str::to_string);
        Self {
            id: claims.principal_id,
            email: None,
            display_name: None,
            roles: claims.roles.clone(),
            capabilities: claims.capabilities.clone(),
            subscription,
            attributes: Map::new(),
        }
    }

    pub fn is_premium(&self) -> bool {
        self.subscription
            .as_deref()
            .is_some_and(|s| s.eq_ignore_ascii_case("premium"))
    }
}

/// Resolved identity of one request.
///
/// Each request gets its own value; only the [`Profile`] behind the `Arc`
/// may be shared with other requests.
#[derive(Debug, Clone, PartialEq)]
pub struct Principal {
    id: PrincipalId,
    roles: Vec<String>,
    capabilities: Vec<String>,
    auth_method: AuthMethod,
    profile: Arc<Profile>,
}

impl Principal {
    /// Build a principal. Roles and capabilities come from the profile, which
    /// is authoritative over anything denormalized into a token.
    pub fn new(id: PrincipalId, auth_method: AuthMethod, profile: Arc<Profile>) -> Self {
        Self {
            id,
            roles: profile.roles.clone(),
            capabilities: profile.capabilities.clone(),
            auth_method,
            profile,
        }
    }

    pub fn id(&self) -> PrincipalId {
        self.id
    }

    pub fn roles(&self) -> &[String] {
        &self.roles
    }

    pub fn capabilities(&self) -> &[String] {
        &self.capabilities
    }

    pub fn auth_method(&self) -> AuthMethod {
        self.auth_method
    }

    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }

    pub fn is_premium(&self) -> bool {
        self.profile.is_premium()
    }

    /// Rate-limit tier of this principal.
    pub fn tier(&self) -> Tier {
        Tier::for_principal(Some(self))
    }

    /// Get a display-friendly name for this principal.
    pub fn display(&self) -> String {
        if let Some(name) = &self.profile.display_name {
            name.clone()
        } else if let Some(email) = &self.profile.email {
            email.clone()
        } else {
            format!("principal:{}", self.id)
        }
    }
}
