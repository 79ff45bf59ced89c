// Core modules
pub mod api;
pub mod auth;
pub mod cache;
pub mod config;
pub mod crypto;
pub mod rate_limit;
pub mod types;

// Re-export key types and functions
pub use auth::{
    AuthError, AuthMethod, AuthRequest, AuthResult, AuthService, IdentityStore,
    MemoryIdentityStore, Principal, PrincipalClaims, Profile,
};
pub use cache::{CacheBackend, MemoryCache};
pub use config::{AuthSettings, load_settings};
pub use crypto::{generate_api_key, hash_api_key};
pub use rate_limit::{RateDecision, RateLimiter, Tier};
pub use types::PrincipalId;

use std::sync::Arc;

/// Convenience function to create an auth service over the in-process cache.
///
/// The cache is sized from `settings.cache.max_capacity`; hosts with a shared
/// cache build the service through [`AuthService::builder`] instead.
pub fn create_service(
    settings: AuthSettings,
    identities: Arc<dyn IdentityStore>,
) -> anyhow::Result<Arc<AuthService>> {
    let cache = Arc::new(MemoryCache::new(settings.cache.max_capacity));
    let service = AuthService::builder(settings, identities, cache).build()?;
    Ok(Arc::new(service))
}
