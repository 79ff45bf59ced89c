//! Session nonces issued by the host application.
//!
//! A nonce proves the request was produced by a page the host rendered for an
//! existing session. Session management itself belongs to the host, which
//! exposes it through [`SessionVerifier`].

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use super::{Verified, Verifier};
use crate::auth::context::PrincipalClaims;
use crate::auth::credential::{Credential, Scheme};
use crate::auth::error::{AuthError, AuthResult};
use crate::auth::request::AuthRequest;
use crate::config::NonceSettings;
use crate::types::PrincipalId;

#[async_trait]
pub trait SessionVerifier: Send + Sync {
    /// Identity of the session attached to the request (cookie or similar).
    async fn session_identity(&self, request: &AuthRequest) -> anyhow::Result<Option<PrincipalId>>;

    /// Whether `nonce` was issued for `action` in the request's session.
    async fn verify_nonce(
        &self,
        request: &AuthRequest,
        nonce: &str,
        action: &str,
    ) -> anyhow::Result<bool>;
}

#[derive(Debug, Clone)]
pub struct NonceOptions {
    pub action: String,
}

impl NonceOptions {
    pub fn from_settings(settings: &NonceSettings) -> anyhow::Result<Self> {
        if settings.action.trim().is_empty() {
            anyhow::bail!("nonce action must not be empty");
        }
        Ok(Self {
            action: settings.action.trim().to_string(),
        })
    }
}

pub struct NonceVerifier {
    sessions: Arc<dyn SessionVerifier>,
    options: NonceOptions,
}

impl NonceVerifier {
    pub fn new(sessions: Arc<dyn SessionVerifier>, options: NonceOptions) -> Self {
        Self { sessions, options }
    }
}

#[async_trait]
impl Verifier for NonceVerifier {
    fn scheme(&self) -> Scheme {
        Scheme::Nonce
    }

    async fn verify(&self, credential: &Credential, request: &AuthRequest) -> AuthResult<Verified> {
        if credential.value.is_empty() {
            return Err(AuthError::VerificationFailed);
        }

        let identity = self.sessions.session_identity(request).await.map_err(|e| {
            warn!("Session lookup failed: {:#}", e);
            AuthError::from(e)
        })?;
        let Some(principal_id) = identity else {
            debug!("Nonce presented without a session");
            return Err(AuthError::VerificationFailed);
        };

        let valid = self
            .sessions
            .verify_nonce(request, &credential.value, &self.options.action)
            .await
            .map_err(|e| {
                warn!("Nonce check failed: {:#}", e);
                AuthError::from(e)
            })?;
        if !valid {
            debug!("Invalid nonce for {}", principal_id);
            return Err(AuthError::VerificationFailed);
        }

        Ok(Verified::new(PrincipalClaims::new(
            principal_id,
            Utc::now(),
            DateTime::<Utc>::MAX_UTC,
        )))
    }
}
