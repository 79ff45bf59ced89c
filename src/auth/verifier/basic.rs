//! HTTP Basic credentials checked against the identity store.

use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::Utc;
use tracing::{debug, warn};

use super::{Verified, Verifier};
use crate::auth::context::PrincipalClaims;
use crate::auth::credential::{Credential, Scheme};
use crate::auth::error::{AuthError, AuthResult};
use crate::auth::principal_store::IdentityStore;
use crate::auth::request::AuthRequest;

pub struct BasicVerifier {
    identities: Arc<dyn IdentityStore>,
}

impl BasicVerifier {
    pub fn new(identities: Arc<dyn IdentityStore>) -> Self {
        Self { identities }
    }
}

/// Split a base64 `user:password` pair.
fn decode_pair(value: &str) -> Option<(String, String)> {
    let decoded = STANDARD.decode(value.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, password) = decoded.split_once(':')?;
    if user.is_empty() {
        return None;
    }
    Some((user.to_string(), password.to_string()))
}

#[async_trait]
impl Verifier for BasicVerifier {
    fn scheme(&self) -> Scheme {
        Scheme::Basic
    }

    async fn verify(
        &self,
        credential: &Credential,
        _request: &AuthRequest,
    ) -> AuthResult<Verified> {
        let (user, password) = decode_pair(&credential.value).ok_or(AuthError::VerificationFailed)?;

        let principal_id = match self.identities.verify_password(&user, &password).await {
            Ok(Some(id)) => id,
            Ok(None) => {
                debug!("Basic credentials rejected for {}", user);
                return Err(AuthError::VerificationFailed);
            }
            Err(e) => {
                warn!("Password check failed: {:#}", e);
                return Err(AuthError::from(e));
            }
        };

        // Valid for this request only.
        let now = Utc::now();
        Ok(Verified::new(PrincipalClaims::new(principal_id, now, now)))
    }
}
