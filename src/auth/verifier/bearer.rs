//! Bearer/JWT verification.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;

use super::{Verified, Verifier};
use crate::auth::context::PrincipalClaims;
use crate::auth::credential::{Credential, Scheme};
use crate::auth::error::{AuthError, AuthResult};
use crate::auth::request::AuthRequest;
use crate::auth::token::JwtCodec;
use crate::config::JwtSettings;

#[derive(Debug, Clone, Copy)]
pub struct BearerOptions {
    /// Tokens with less remaining lifetime than this get reissued.
    pub refresh_threshold: chrono::Duration,
}

impl BearerOptions {
    /// Options for settings already accepted by
    /// [`AuthSettings::validate`](crate::config::AuthSettings::validate).
    pub fn from_settings(settings: &JwtSettings) -> Self {
        Self {
            refresh_threshold: settings.refresh_threshold(),
        }
    }

    /// Whether claims are close enough to expiry to be reissued.
    pub fn refresh_due(&self, claims: &PrincipalClaims, now: chrono::DateTime<Utc>) -> bool {
        claims.remaining_at(now) < self.refresh_threshold
    }
}

pub struct BearerVerifier {
    codec: Arc<JwtCodec>,
    options: BearerOptions,
}

impl BearerVerifier {
    pub fn new(codec: Arc<JwtCodec>, options: BearerOptions) -> Self {
        Self { codec, options }
    }
}

#[async_trait]
impl Verifier for BearerVerifier {
    fn scheme(&self) -> Scheme {
        Scheme::Bearer
    }

    async fn verify(
        &self,
        credential: &Credential,
        _request: &AuthRequest,
    ) -> AuthResult<Verified> {
        if credential.value.is_empty() {
            return Err(AuthError::VerificationFailed);
        }
        let claims = self.codec.decode(&credential.value)?;

        let now = Utc::now();
        if claims.is_expired_at(now) {
            debug!("Bearer token for {} has expired", claims.principal_id);
            return Err(AuthError::VerificationFailed);
        }

        let refresh_due = self.options.refresh_due(&claims, now);
        Ok(Verified {
            claims,
            refresh_due,
        })
    }
}
