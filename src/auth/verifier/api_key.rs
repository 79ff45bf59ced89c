//! Static API keys.
//!
//! Keys are looked up by their SHA-256 hash, never by raw value. The built-in
//! [`StaticApiKeys`] table comes from settings; hosts with a key database plug
//! in their own [`ApiKeyResolver`].

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use super::{Verified, Verifier};
use crate::auth::context::PrincipalClaims;
use crate::auth::credential::{Credential, Scheme};
use crate::auth::error::{AuthError, AuthResult};
use crate::auth::request::AuthRequest;
use crate::crypto::hash_api_key;
use crate::types::{ApiKeyHash, PrincipalId};

/// An API key known to the resolver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedApiKey {
    pub principal_id: PrincipalId,
    /// Keys without an expiry are valid until removed.
    pub expires_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait ApiKeyResolver: Send + Sync {
    async fn resolve(&self, key_hash: &ApiKeyHash) -> anyhow::Result<Option<ResolvedApiKey>>;
}

/// Fixed key table, hashed at construction.
#[derive(Debug, Clone, Default)]
pub struct StaticApiKeys {
    keys: HashMap<ApiKeyHash, PrincipalId>,
}

impl StaticApiKeys {
    /// Build from raw key to principal id, as found in settings.
    pub fn from_raw(raw: &BTreeMap<String, u64>) -> anyhow::Result<Self> {
        let mut keys = HashMap::with_capacity(raw.len());
        for (key, id) in raw {
            if key.trim().is_empty() {
                anyhow::bail!("API key for principal {} is empty", id);
            }
            keys.insert(hash_api_key(key.trim()), PrincipalId::new(*id));
        }
        Ok(Self { keys })
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[async_trait]
impl ApiKeyResolver for StaticApiKeys {
    async fn resolve(&self, key_hash: &ApiKeyHash) -> anyhow::Result<Option<ResolvedApiKey>> {
        Ok(self.keys.get(key_hash).map(|id| ResolvedApiKey {
            principal_id: *id,
            expires_at: None,
        }))
    }
}

pub struct ApiKeyVerifier {
    resolver: Arc<dyn ApiKeyResolver>,
}

impl ApiKeyVerifier {
    pub fn new(resolver: Arc<dyn ApiKeyResolver>) -> Self {
        Self { resolver }
    }
}

#[async_trait]
impl Verifier for ApiKeyVerifier {
    fn scheme(&self) -> Scheme {
        Scheme::ApiKey
    }

    async fn verify(
        &self,
        credential: &Credential,
        _request: &AuthRequest,
    ) -> AuthResult<Verified> {
        if credential.value.is_empty() {
            return Err(AuthError::VerificationFailed);
        }

        let hash = hash_api_key(&credential.value);
        let resolved = match self.resolver.resolve(&hash).await {
            Ok(Some(resolved)) => resolved,
            Ok(None) => {
                debug!("Unknown API key");
                return Err(AuthError::VerificationFailed);
            }
            Err(e) => {
                warn!("API key lookup failed: {:#}", e);
                return Err(AuthError::from(e));
            }
        };

        let now = Utc::now();
        if resolved.expires_at.is_some_and(|exp| exp <= now) {
            debug!("API key for {} has expired", resolved.principal_id);
            return Err(AuthError::VerificationFailed);
        }

        let expires_at = resolved.expires_at.unwrap_or(DateTime::<Utc>::MAX_UTC);
        Ok(Verified::new(PrincipalClaims::new(
            resolved.principal_id,
            now,
            expires_at,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Method;

    struct ExpiringKeys {
        hash: ApiKeyHash,
        expires_at: DateTime<Utc>,
    }

    #[async_trait]
    impl ApiKeyResolver for ExpiringKeys {
        async fn resolve(&self, key_hash: &ApiKeyHash) -> anyhow::Result<Option<ResolvedApiKey>> {
            Ok((key_hash == &self.hash).then(|| ResolvedApiKey {
                principal_id: PrincipalId::new(5),
                expires_at: Some(self.expires_at),
            }))
        }
    }

    async fn run(verifier: &ApiKeyVerifier, key: &str) -> AuthResult<Verified> {
        let cred = Credential::new(Scheme::ApiKey, key, "header:x-api-key");
        verifier.verify(&cred, &AuthRequest::new(Method::GET, "/")).await
    }

    #[tokio::test]
    async fn test_static_keys() {
        let mut raw = BTreeMap::new();
        raw.insert("ag_live_key".to_string(), 77);
        let keys = StaticApiKeys::from_raw(&raw).unwrap();
        assert_eq!(keys.len(), 1);

        let verifier = ApiKeyVerifier::new(Arc::new(keys));
        let verified = run(&verifier, "ag_live_key").await.unwrap();
        assert_eq!(verified.claims.principal_id, PrincipalId::new(77));
        assert_eq!(verified.claims.expires_at, DateTime::<Utc>::MAX_UTC);

        assert_eq!(run(&verifier, "ag_other").await, Err(AuthError::VerificationFailed));
        assert_eq!(run(&verifier, "").await, Err(AuthError::VerificationFailed));
    }

    #[tokio::test]
    async fn test_expired_key_rejected() {
        let hash = hash_api_key("temp");
        let expired = ApiKeyVerifier::new(Arc::new(ExpiringKeys {
            hash: hash.clone(),
            expires_at: Utc::now() - chrono::Duration::seconds(1),
        }));
        assert!(run(&expired, "temp").await.is_err());

        let live = ApiKeyVerifier::new(Arc::new(ExpiringKeys {
            hash,
            expires_at: Utc::now() + chrono::Duration::hours(1),
        }));
        assert!(run(&live, "temp").await.is_ok());
    }

    #[test]
    fn test_empty_key_rejected() {
        let mut raw = BTreeMap::new();
        raw.insert("  ".to_string(), 1);
        assert!(StaticApiKeys::from_raw(&raw).is_err());
    }
}
