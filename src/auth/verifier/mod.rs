//! One verifier per credential scheme.
//!
//! Verifiers are independent: each one looks only at the credential (and the
//! request, for schemes that sign it) and either yields claims or fails with
//! [`AuthError::VerificationFailed`]. The service decides what a failure means.

mod api_key;
mod basic;
mod bearer;
mod hmac;
mod nonce;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::auth::context::PrincipalClaims;
use crate::auth::credential::{Credential, Scheme};
use crate::auth::error::AuthResult;
use crate::auth::request::AuthRequest;

pub use api_key::{ApiKeyResolver, ApiKeyVerifier, ResolvedApiKey, StaticApiKeys};
pub use basic::BasicVerifier;
pub use bearer::{BearerOptions, BearerVerifier};
pub use hmac::{HmacOptions, HmacVerifier, canonical_message, sign_request};
pub use nonce::{NonceOptions, NonceVerifier, SessionVerifier};

#[cfg(test)]
pub(crate) use nonce::tests as nonce_tests;

/// Order in which schemes are tried. Fixed, not configurable.
pub const VERIFICATION_ORDER: [Scheme; 5] = [
    Scheme::Bearer,
    Scheme::Hmac,
    Scheme::ApiKey,
    Scheme::Nonce,
    Scheme::Basic,
];

/// Successful verification.
#[derive(Debug, Clone, PartialEq)]
pub struct Verified {
    pub claims: PrincipalClaims,
    /// The credential is close to expiry and should be reissued.
    pub refresh_due: bool,
}

impl Verified {
    pub fn new(claims: PrincipalClaims) -> Self {
        Self {
            claims,
            refresh_due: false,
        }
    }
}

#[async_trait]
pub trait Verifier: Send + Sync {
    /// The scheme this verifier accepts.
    fn scheme(&self) -> Scheme;

    async fn verify(&self, credential: &Credential, request: &AuthRequest) -> AuthResult<Verified>;
}

/// Lookup table from scheme to verifier.
#[derive(Clone, Default)]
pub struct VerifierSet {
    verifiers: HashMap<Scheme, Arc<dyn Verifier>>,
}

impl VerifierSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a verifier, replacing any previous one for the same scheme.
    pub fn insert(&mut self, verifier: Arc<dyn Verifier>) {
        self.verifiers.insert(verifier.scheme(), verifier);
    }

    pub fn get(&self, scheme: Scheme) -> Option<&Arc<dyn Verifier>> {
        self.verifiers.get(&scheme)
    }

    pub fn contains(&self, scheme: Scheme) -> bool {
        self.verifiers.contains_key(&scheme)
    }

    /// Registered verifiers in [`VERIFICATION_ORDER`].
    pub fn ordered(&self) -> impl Iterator<Item = &Arc<dyn Verifier>> {
        VERIFICATION_ORDER
            .iter()
            .filter_map(|scheme| self.verifiers.get(scheme))
    }
}
