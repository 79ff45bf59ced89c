//! Request authentication: extraction, verification, hydration, refresh.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use super::context::{AuthMethod, Principal, PrincipalClaims, Profile};
use super::credential::{Credential, CredentialExtractor, Scheme};
use super::error::AuthResult;
use super::principal_store::{IdentityStore, ProfileStore};
use super::request::{AuthRequest, Resolution};
use super::token::{IssuedToken, JwtCodec, TokenIssuer};
use super::verifier::{
    ApiKeyResolver, ApiKeyVerifier, BasicVerifier, BearerOptions, BearerVerifier, HmacOptions,
    HmacVerifier, NonceOptions, NonceVerifier, SessionVerifier, StaticApiKeys, Verified, Verifier,
    VerifierSet,
};
use crate::cache::CacheBackend;
use crate::config::AuthSettings;
use crate::rate_limit::{RateDecision, RateLimiter, Tier};
use crate::types::PrincipalId;

/// Assembles an [`AuthService`] from settings and host-provided collaborators.
pub struct AuthServiceBuilder {
    settings: AuthSettings,
    identities: Arc<dyn IdentityStore>,
    cache: Arc<dyn CacheBackend>,
    sessions: Option<Arc<dyn SessionVerifier>>,
    api_keys: Option<Arc<dyn ApiKeyResolver>>,
    overrides: Vec<Arc<dyn Verifier>>,
}

impl AuthServiceBuilder {
    /// Use a host session for nonce verification and, if enabled, fallback.
    pub fn sessions(mut self, sessions: Arc<dyn SessionVerifier>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    /// Resolve API keys through the host instead of the settings table.
    pub fn api_key_resolver(mut self, resolver: Arc<dyn ApiKeyResolver>) -> Self {
        self.api_keys = Some(resolver);
        self
    }

    /// Replace the built-in verifier for the verifier's scheme.
    pub fn verifier(mut self, verifier: Arc<dyn Verifier>) -> Self {
        self.overrides.push(verifier);
        self
    }

    pub fn build(self) -> anyhow::Result<AuthService> {
        let settings = self.settings;
        settings.validate()?;

        let codec = Arc::new(JwtCodec::new(
            settings.jwt.secret.as_bytes(),
            settings.jwt.issuer.clone(),
        ));
        let profiles = Arc::new(ProfileStore::new(
            self.identities.clone(),
            self.cache.clone(),
            settings.profile_ttl(),
        ));
        let issuer = Arc::new(TokenIssuer::new(
            &settings.jwt,
            codec.clone(),
            profiles.clone(),
            self.cache.clone(),
            settings.token_cache_ttl(),
        ));
        let bearer = BearerOptions::from_settings(&settings.jwt);

        let mut verifiers = VerifierSet::new();
        verifiers.insert(Arc::new(BearerVerifier::new(codec, bearer)));
        if !settings.hmac.secret.is_empty() {
            let options = HmacOptions::from_settings(&settings.hmac)?;
            verifiers.insert(Arc::new(HmacVerifier::new(options)));
        }
        let api_keys = match self.api_keys {
            Some(resolver) => Some(resolver),
            None if !settings.api_keys.is_empty() => {
                let keys = StaticApiKeys::from_raw(&settings.api_keys)?;
                Some(Arc::new(keys) as Arc<dyn ApiKeyResolver>)
            }
            None => None,
        };
        if let Some(resolver) = api_keys {
            verifiers.insert(Arc::new(ApiKeyVerifier::new(resolver)));
        }
        if let Some(sessions) = &self.sessions {
            let options = NonceOptions::from_settings(&settings.nonce)?;
            verifiers.insert(Arc::new(NonceVerifier::new(sessions.clone(), options)));
        }
        verifiers.insert(Arc::new(BasicVerifier::new(self.identities.clone())));
        for verifier in self.overrides {
            verifiers.insert(verifier);
        }

        let rate_limiter = Arc::new(RateLimiter::new(
            self.cache.clone(),
            settings.rate_limit.clone(),
        ));

        info!(
            "Auth service ready ({} schemes, session fallback {})",
            verifiers.ordered().count(),
            if settings.session_fallback { "on" } else { "off" }
        );

        Ok(AuthService {
            extractor: CredentialExtractor::new(settings.nonce.param_name.clone()),
            verifiers,
            bearer,
            issuer,
            profiles,
            sessions: self.sessions,
            session_fallback: settings.session_fallback,
            rate_limiter,
        })
    }
}

/// Authenticates requests and owns the token lifecycle.
///
/// Shared between all request handlers; per-request state lives on the
/// [`AuthRequest`].
pub struct AuthService {
    extractor: CredentialExtractor,
    verifiers: VerifierSet,
    bearer: BearerOptions,
    issuer: Arc<TokenIssuer>,
    profiles: Arc<ProfileStore>,
    sessions: Option<Arc<dyn SessionVerifier>>,
    session_fallback: bool,
    rate_limiter: Arc<RateLimiter>,
}

impl AuthService {
    pub fn builder(
        settings: AuthSettings,
        identities: Arc<dyn IdentityStore>,
        cache: Arc<dyn CacheBackend>,
    ) -> AuthServiceBuilder {
        AuthServiceBuilder {
            settings,
            identities,
            cache,
            sessions: None,
            api_keys: None,
            overrides: Vec::new(),
        }
    }

    pub fn issuer(&self) -> &Arc<TokenIssuer> {
        &self.issuer
    }

    pub fn profiles(&self) -> &Arc<ProfileStore> {
        &self.profiles
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    /// Resolve the principal behind a request.
    ///
    /// Runs at most once per request; later calls return the memoized
    /// result. `None` means unauthenticated, whatever the reason.
    pub async fn authenticate(&self, request: &AuthRequest) -> Option<Principal> {
        request
            .resolution
            .get_or_init(|| self.resolve(request))
            .await
            .principal
            .clone()
    }

    /// Mint a bearer token for an identity.
    pub async fn mint(
        &self,
        principal_id: PrincipalId,
        extra_claims: Map<String, Value>,
    ) -> AuthResult<IssuedToken> {
        self.issuer.mint(principal_id, extra_claims).await
    }

    /// Evict cached verifications of an identity's tokens.
    pub async fn invalidate(&self, principal_id: PrincipalId) -> AuthResult<()> {
        self.issuer.invalidate(principal_id).await
    }

    pub fn tier_for(&self, principal: Option<&Principal>) -> Tier {
        Tier::for_principal(principal)
    }

    /// Authenticate the request and count it against its tier's quota.
    ///
    /// Authenticated callers are counted per principal, anonymous callers
    /// per client address.
    pub async fn admit(&self, request: &AuthRequest, resource: &str) -> RateDecision {
        let principal = self.authenticate(request).await;
        let tier = self.tier_for(principal.as_ref());
        let identifier = match &principal {
            Some(p) => format!("principal:{}", p.id()),
            None => format!("addr:{}", request.client_addr().unwrap_or("unknown")),
        };
        self.rate_limiter.allow(&identifier, resource, tier).await
    }

    async fn resolve(&self, request: &AuthRequest) -> Resolution {
        let Some(credential) = self.extractor.extract(request.headers(), request.params()) else {
            return self.resolve_session(request).await;
        };

        let Some(verified) = self.verify(&credential, request).await else {
            debug!("No verifier accepted the {} credential", credential.scheme);
            return Resolution::default();
        };

        let Verified {
            claims,
            refresh_due,
        } = verified;
        let Some(principal) = self
            .hydrate(&claims, AuthMethod::from(credential.scheme))
            .await
        else {
            return Resolution::default();
        };

        let refreshed_token = if refresh_due && credential.scheme == Scheme::Bearer {
            self.refresh(&claims).await
        } else {
            None
        };

        Resolution {
            principal: Some(principal),
            refreshed_token,
        }
    }

    async fn verify(&self, credential: &Credential, request: &AuthRequest) -> Option<Verified> {
        let Some(verifier) = self.verifiers.get(credential.scheme) else {
            debug!("No verifier registered for {}", credential.scheme);
            return None;
        };

        if credential.scheme == Scheme::Bearer {
            if let Some(hit) = self.cached_bearer(&credential.value, Utc::now()).await {
                return Some(hit);
            }
        }

        match verifier.verify(credential, request).await {
            Ok(verified) => {
                if credential.scheme == Scheme::Bearer {
                    self.issuer
                        .cache_verified(&credential.value, &verified.claims)
                        .await;
                }
                Some(verified)
            }
            Err(e) => {
                debug!("{} verification failed: {}", credential.scheme, e);
                None
            }
        }
    }

    async fn cached_bearer(&self, token: &str, now: DateTime<Utc>) -> Option<Verified> {
        match self.issuer.lookup_cached(token).await {
            Ok(Some(entry)) => {
                let refresh_due = self.bearer.refresh_due(&entry.claims, now);
                Some(Verified {
                    claims: entry.claims,
                    refresh_due,
                })
            }
            Ok(None) => None,
            Err(e) => {
                warn!("Token cache unavailable, verifying directly: {}", e);
                None
            }
        }
    }

    /// Attach the profile. Unknown or deactivated identities are rejected;
    /// an unreachable identity store degrades to a claims-only profile.
    async fn hydrate(&self, claims: &PrincipalClaims, method: AuthMethod) -> Option<Principal> {
        let profile = match self.profiles.get(claims.principal_id).await {
            Ok(Some(profile)) => profile,
            Ok(None) => {
                debug!("Identity {} not found or inactive", claims.principal_id);
                return None;
            }
            Err(e) => {
                warn!(
                    "Profile unavailable for {}, using token claims: {}",
                    claims.principal_id, e
                );
                Arc::new(Profile::from_claims(claims))
            }
        };
        Some(Principal::new(claims.principal_id, method, profile))
    }

    async fn refresh(&self, claims: &PrincipalClaims) -> Option<String> {
        match self
            .issuer
            .mint(claims.principal_id, claims.extra.clone())
            .await
        {
            Ok(issued) => {
                info!("Refreshed token for principal {}", claims.principal_id);
                Some(issued.token)
            }
            Err(e) => {
                warn!("Token refresh failed for {}: {}", claims.principal_id, e);
                None
            }
        }
    }

    async fn resolve_session(&self, request: &AuthRequest) -> Resolution {
        let Some(sessions) = self.sessions.as_ref().filter(|_| self.session_fallback) else {
            return Resolution::default();
        };
        let principal_id = match sessions.session_identity(request).await {
            Ok(Some(id)) => id,
            Ok(None) => return Resolution::default(),
            Err(e) => {
                warn!("Session lookup failed: {:#}", e);
                return Resolution::default();
            }
        };

        let claims = PrincipalClaims::new(principal_id, Utc::now(), DateTime::<Utc>::MAX_UTC);
        Resolution {
            principal: self.hydrate(&claims, AuthMethod::Session).await,
            refreshed_token: None,
        }
    }
}
