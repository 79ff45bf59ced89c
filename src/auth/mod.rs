//! Authentication and token lifecycle.
//!
//! This module turns an inbound request into a [`Principal`]. It accepts
//! several credential schemes:
//!
//! - **Bearer**: HS256 JWT in `Authorization`, `X-Authorization` or `X-Auth-Token`
//! - **HMAC**: request signature over method, path, timestamp, identity and body
//! - **API Key**: static key in `X-API-Key`
//! - **Nonce**: host-session nonce in `X-Auth-Nonce` or the `_auth_nonce` parameter
//! - **Basic**: username and password checked against the identity store
//!
//! ## Security Model
//!
//! - Exactly one credential is taken from a request, by header priority
//! - Any verification failure means "unauthenticated"; no error reaches the caller
//! - Verified bearer tokens are cached under their SHA-256 hash, never raw
//! - Cached verifications never outlive the token they describe
//! - Tokens close to expiry are reissued and returned out-of-band
//!
//! ## Usage
//!
//! ```ignore
//! let service = AuthService::builder(settings, identities, cache).build()?;
//!
//! let request = AuthRequest::new(Method::GET, "/orders")
//!     .with_header("Authorization", &format!("Bearer {}", token));
//!
//! if let Some(principal) = service.authenticate(&request).await {
//!     assert!(principal.has_capability("read_orders"));
//! }
//! if let Some(fresh) = request.refreshed_token() {
//!     // hand the replacement token back to the client
//! }
//! ```

mod context;
mod credential;
mod error;
mod principal_store;
mod request;
mod service;
mod token;
pub mod verifier;


pub use context::{AuthMethod, Principal, PrincipalClaims, Profile};
pub use credential::{
    AUTHORIZATION, Credential, CredentialExtractor, Scheme, X_API_KEY, X_AUTH_IDENTITY,
    X_AUTH_NONCE, X_AUTH_SIGNATURE, X_AUTH_TIMESTAMP, X_AUTH_TOKEN, X_AUTHORIZATION,
    header_value,
};
pub use error::{AuthError, AuthResult};
pub use principal_store::{
    IdentityDocument, IdentityRecord, IdentitySeed, IdentityStore, MemoryIdentityStore,
    ProfileStore,
};
pub use request::AuthRequest;
pub use service::{AuthService, AuthServiceBuilder};
pub use token::{CachedToken, IssuedToken, JwtCodec, TokenClaims, TokenIssuer, peek_principal_id};
