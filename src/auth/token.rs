//! Bearer token minting, decoding and the verified-token cache.
//!
//! Tokens are self-contained HS256 JWTs. `invalidate` only evicts cached
//! verification results: a token already handed to a client stays valid
//! until its `exp`, since there is no deny-list.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::auth::context::PrincipalClaims;
use crate::auth::error::{AuthError, AuthResult};
use crate::auth::principal_store::ProfileStore;
use crate::cache::{self, CacheBackend};
use crate::config::JwtSettings;
use crate::crypto::hash_token;
use crate::types::{PrincipalId, TokenHash};

/// Claim names owned by the issuer; callers cannot override them via extras.
const RESERVED_CLAIMS: [&str; 7] = [
    "iss",
    "iat",
    "exp",
    "jti",
    "principal_id",
    "roles",
    "capabilities",
];

/// Wire format of a minted token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    pub iss: String,
    pub iat: i64,
    pub exp: i64,
    pub jti: String,
    pub principal_id: PrincipalId,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TokenClaims {
    fn into_principal_claims(self) -> AuthResult<PrincipalClaims> {
        let issued_at = DateTime::from_timestamp(self.iat, 0).ok_or(AuthError::VerificationFailed)?;
        let expires_at =
            DateTime::from_timestamp(self.exp, 0).ok_or(AuthError::VerificationFailed)?;
        Ok(PrincipalClaims {
            principal_id: self.principal_id,
            issued_at,
            expires_at,
            roles: self.roles,
            capabilities: self.capabilities,
            extra: self.extra,
        })
    }
}

/// HS256 signer/verifier shared by the issuer and the bearer verifier.
pub struct JwtCodec {
    issuer: String,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtCodec {
    pub fn new(secret: &[u8], issuer: impl Into<String>) -> Self {
        let issuer = issuer.into();
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[issuer.as_str()]);
        validation.set_required_spec_claims(&["exp", "iss"]);
        // Expiry is checked against the caller's clock, not by the decoder.
        validation.validate_exp = false;
        validation.leeway = 0;
        Self {
            issuer,
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            validation,
        }
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    pub fn sign(&self, claims: &TokenClaims) -> AuthResult<String> {
        encode(&Header::new(Algorithm::HS256), claims, &self.encoding_key)
            .map_err(|e| AuthError::BackendUnavailable(format!("token signing failed: {}", e)))
    }

    /// Verify signature, algorithm, issuer and claim shape.
    ///
    /// Does not check expiry; see [`crate::auth::verifier::BearerVerifier`].
    pub fn decode(&self, token: &str) -> AuthResult<PrincipalClaims> {
        let data = decode::<TokenClaims>(token, &self.decoding_key, &self.validation).map_err(|e| {
            debug!("Bearer token rejected: {}", e);
            AuthError::VerificationFailed
        })?;
        data.claims.into_principal_claims()
    }
}

/// Read the `principal_id` claim without verifying the signature.
///
/// Only used to build cache keys; a forged payload changes the token hash and
/// therefore can never hit an entry written for a genuine token.
pub fn peek_principal_id(token: &str) -> Option<PrincipalId> {
    #[derive(Deserialize)]
    struct Peek {
        principal_id: PrincipalId,
    }

    let payload = token.split('.').nth(1)?;
    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(payload)
        .ok()?;
    serde_json::from_slice::<Peek>(&bytes)
        .ok()
        .map(|p| p.principal_id)
}

/// Verified-token cache entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedToken {
    pub token_hash: TokenHash,
    pub principal_id: PrincipalId,
    pub expires_at: DateTime<Utc>,
    pub claims: PrincipalClaims,
}

/// A freshly minted token.
#[derive(Debug, Clone, Serialize)]
pub struct IssuedToken {
    pub token: String,
    pub principal_id: PrincipalId,
    pub expires_at: DateTime<Utc>,
}

fn token_prefix(principal_id: PrincipalId) -> String {
    format!("auth:token:{}:", principal_id)
}

fn token_key(principal_id: PrincipalId, hash: &TokenHash) -> String {
    format!("{}{}", token_prefix(principal_id), hash)
}

/// Mints and invalidates bearer tokens and owns the verified-token cache.
pub struct TokenIssuer {
    codec: Arc<JwtCodec>,
    profiles: Arc<ProfileStore>,
    cache: Arc<dyn CacheBackend>,
    token_ttl: chrono::Duration,
    cache_ttl: Duration,
}

impl TokenIssuer {
    pub fn new(
        settings: &JwtSettings,
        codec: Arc<JwtCodec>,
        profiles: Arc<ProfileStore>,
        cache: Arc<dyn CacheBackend>,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            codec,
            profiles,
            cache,
            token_ttl: settings.token_ttl(),
            cache_ttl,
        }
    }

    pub fn codec(&self) -> &Arc<JwtCodec> {
        &self.codec
    }

    /// Mint a token with the default lifetime.
    pub async fn mint(
        &self,
        principal_id: PrincipalId,
        extra_claims: Map<String, Value>,
    ) -> AuthResult<IssuedToken> {
        self.mint_with_ttl(principal_id, extra_claims, self.token_ttl)
            .await
    }

    /// Mint a token valid for `ttl` from now.
    ///
    /// Roles and capabilities are denormalized from the profile so holders of
    /// the token can inspect them offline. Unknown identities cannot be issued
    /// a token; an unreachable identity store yields a token without grants.
    pub async fn mint_with_ttl(
        &self,
        principal_id: PrincipalId,
        mut extra_claims: Map<String, Value>,
        ttl: chrono::Duration,
    ) -> AuthResult<IssuedToken> {
        let (roles, capabilities) = match self.profiles.get(principal_id).await {
            Ok(Some(profile)) => (profile.roles.clone(), profile.capabilities.clone()),
            Ok(None) => {
                debug!("Refusing to mint for unknown identity {}", principal_id);
                return Err(AuthError::VerificationFailed);
            }
            Err(e) => {
                warn!("Minting for {} without grants: {}", principal_id, e);
                (Vec::new(), Vec::new())
            }
        };

        for reserved in RESERVED_CLAIMS {
            extra_claims.remove(reserved);
        }

        let now = Utc::now();
        let Some(expires_at) = now.checked_add_signed(ttl) else {
            debug!("Refusing to mint for {} with lifetime {}", principal_id, ttl);
            return Err(AuthError::VerificationFailed);
        };
        let claims = TokenClaims {
            iss: self.codec.issuer().to_string(),
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
            jti: uuid::Uuid::new_v4().to_string(),
            principal_id,
            roles,
            capabilities,
            extra: extra_claims,
        };
        let token = self.codec.sign(&claims)?;
        let principal_claims = claims.into_principal_claims()?;
        let expires_at = principal_claims.expires_at;

        self.cache_verified(&token, &principal_claims).await;
        info!("Issued token for principal {} (expires {})", principal_id, expires_at);

        Ok(IssuedToken {
            token,
            principal_id,
            expires_at,
        })
    }

    /// Evict every cached verification result for a principal.
    ///
    /// Tokens already held by clients remain verifiable until they expire.
    pub async fn invalidate(&self, principal_id: PrincipalId) -> AuthResult<()> {
        info!("Invalidating cached tokens for principal {}", principal_id);
        self.cache.delete_prefix(&token_prefix(principal_id)).await
    }

    /// Look a raw token up in the verified-token cache.
    pub async fn lookup_cached(&self, token: &str) -> AuthResult<Option<CachedToken>> {
        let Some(principal_id) = peek_principal_id(token) else {
            return Ok(None);
        };
        let hash = hash_token(token);
        let key = token_key(principal_id, &hash);
        let cached: Option<CachedToken> = cache::get_json(self.cache.as_ref(), &key).await?;
        Ok(cached.filter(|entry| {
            entry.token_hash == hash
                && entry.principal_id == principal_id
                && entry.expires_at > Utc::now()
        }))
    }

    /// Remember a successful verification.
    ///
    /// The entry never outlives the token: its TTL is capped by the remaining
    /// token lifetime. Cache failures are logged and ignored.
    pub async fn cache_verified(&self, token: &str, claims: &PrincipalClaims) {
        let remaining = match (claims.expires_at - Utc::now()).to_std() {
            Ok(d) if !d.is_zero() => d,
            _ => return,
        };
        let ttl = remaining.min(self.cache_ttl);
        let hash = hash_token(token);
        let key = token_key(claims.principal_id, &hash);
        let entry = CachedToken {
            token_hash: hash,
            principal_id: claims.principal_id,
            expires_at: claims.expires_at,
            claims: claims.clone(),
        };
        if let Err(e) = cache::set_json(self.cache.as_ref(), &key, &entry, ttl).await {
            warn!("Token cache write failed for {}: {}", claims.principal_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::principal_store::MemoryIdentityStore;
    use crate::auth::principal_store::tests::record;
    use crate::cache::MemoryCache;

    const SECRET: &[u8] = b"0123456789abcdef0123456789abcdef";

    async fn issuer() -> TokenIssuer {
        let store = MemoryIdentityStore::new();
        store
            .define_role("editor", vec!["edit_posts".to_string()])
            .await;
        store.upsert_identity(record(7, "ana", &["editor"]), "pw").await;
        let cache: Arc<dyn CacheBackend> = Arc::new(MemoryCache::default());
        let profiles = Arc::new(ProfileStore::new(
            Arc::new(store),
            cache.clone(),
            Duration::from_secs(3600),
        ));
        TokenIssuer::new(
            &JwtSettings::default(),
            Arc::new(JwtCodec::new(SECRET, "authgate")),
            profiles,
            cache,
            Duration::from_secs(3600),
        )
    }

    #[tokio::test]
    async fn test_mint_denormalizes_grants() {
        let issuer = issuer().await;
        let issued = issuer.mint(PrincipalId::new(7), Map::new()).await.unwrap();

        let claims = issuer.codec().decode(&issued.token).unwrap();
        assert_eq!(claims.principal_id, PrincipalId::new(7));
        assert_eq!(claims.roles, vec!["editor".to_string()]);
        assert_eq!(claims.capabilities, vec!["edit_posts".to_string()]);
        assert_eq!(claims.expires_at, issued.expires_at);
        assert_eq!((claims.expires_at - claims.issued_at).num_seconds(), 3600);
    }

    #[tokio::test]
    async fn test_mint_unknown_identity_fails() {
        let issuer = issuer().await;
        let err = issuer.mint(PrincipalId::new(404), Map::new()).await.unwrap_err();
        assert_eq!(err, AuthError::VerificationFailed);
    }

    #[tokio::test]
    async fn test_mint_rejects_unrepresentable_lifetime() {
        let issuer = issuer().await;
        let err = issuer
            .mint_with_ttl(PrincipalId::new(7), Map::new(), chrono::Duration::MAX)
            .await
            .unwrap_err();
        assert_eq!(err, AuthError::VerificationFailed);
    }

    #[tokio::test]
    async fn test_extra_claims_cannot_override_reserved() {
        let issuer = issuer().await;
        let mut extra = Map::new();
        extra.insert("principal_id".to_string(), Value::from(1));
        extra.insert("roles".to_string(), serde_json::json!(["administrator"]));
        extra.insert("device".to_string(), Value::from("cli"));

        let issued = issuer.mint(PrincipalId::new(7), extra).await.unwrap();
        let claims = issuer.codec().decode(&issued.token).unwrap();
        assert_eq!(claims.principal_id, PrincipalId::new(7));
        assert_eq!(claims.roles, vec!["editor".to_string()]);
        assert_eq!(claims.extra.get("device"), Some(&Value::from("cli")));
    }

    #[tokio::test]
    async fn test_decode_rejects_other_secret_and_issuer() {
        let issuer = issuer().await;
        let issued = issuer.mint(PrincipalId::new(7), Map::new()).await.unwrap();

        let other_secret = JwtCodec::new(b"ffffffffffffffffffffffffffffffff", "authgate");
        assert_eq!(other_secret.decode(&issued.token), Err(AuthError::VerificationFailed));

        let other_issuer = JwtCodec::new(SECRET, "someone-else");
        assert_eq!(other_issuer.decode(&issued.token), Err(AuthError::VerificationFailed));

        assert_eq!(issuer.codec().decode("not.a.jwt"), Err(AuthError::VerificationFailed));
    }

    #[tokio::test]
    async fn test_decode_requires_principal_id() {
        #[derive(Serialize)]
        struct NoPrincipal {
            iss: String,
            iat: i64,
            exp: i64,
        }
        let now = Utc::now().timestamp();
        let token = encode(
            &Header::new(Algorithm::HS256),
            &NoPrincipal {
                iss: "authgate".to_string(),
                iat: now,
                exp: now + 600,
            },
            &EncodingKey::from_secret(SECRET),
        )
        .unwrap();
        let codec = JwtCodec::new(SECRET, "authgate");
        assert_eq!(codec.decode(&token), Err(AuthError::VerificationFailed));
    }

    #[tokio::test]
    async fn test_peek_principal_id() {
        let issuer = issuer().await;
        let issued = issuer.mint(PrincipalId::new(7), Map::new()).await.unwrap();
        assert_eq!(peek_principal_id(&issued.token), Some(PrincipalId::new(7)));
        assert_eq!(peek_principal_id("garbage"), None);
        assert_eq!(peek_principal_id("a.!!!.c"), None);
    }

    #[tokio::test]
    async fn test_mint_then_invalidate_misses_cache_but_token_still_decodes() {
        let issuer = issuer().await;
        let issued = issuer.mint(PrincipalId::new(7), Map::new()).await.unwrap();

        let cached = issuer.lookup_cached(&issued.token).await.unwrap().unwrap();
        assert_eq!(cached.principal_id, PrincipalId::new(7));
        assert_eq!(cached.token_hash, hash_token(&issued.token));

        issuer.invalidate(PrincipalId::new(7)).await.unwrap();
        assert!(issuer.lookup_cached(&issued.token).await.unwrap().is_none());

        // Stateless token: still verifiable until it expires.
        let claims = issuer.codec().decode(&issued.token).unwrap();
        assert_eq!(claims.principal_id, PrincipalId::new(7));
    }

    #[tokio::test]
    async fn test_expired_claims_are_not_cached() {
        let issuer = issuer().await;
        let issued = issuer
            .mint_with_ttl(PrincipalId::new(7), Map::new(), chrono::Duration::seconds(-5))
            .await
            .unwrap();
        assert!(issuer.lookup_cached(&issued.token).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cache_entry_ttl_bounded_by_token_lifetime() {
        let issuer = issuer().await;
        let issued = issuer
            .mint_with_ttl(PrincipalId::new(7), Map::new(), chrono::Duration::seconds(2))
            .await
            .unwrap();
        assert!(issuer.lookup_cached(&issued.token).await.unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(2100)).await;
        assert!(issuer.lookup_cached(&issued.token).await.unwrap().is_none());
    }
}
