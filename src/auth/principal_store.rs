//! Identity store boundary and the cached profile projection.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::auth::context::Profile;
use crate::auth::error::AuthResult;
use crate::cache::{self, CacheBackend};
use crate::crypto::constant_time_eq;
use crate::types::PrincipalId;

/// One identity as the host's user store knows it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityRecord {
    pub id: PrincipalId,
    pub username: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    /// Capabilities granted directly, on top of role-implied ones
    #[serde(default)]
    pub granted_capabilities: Vec<String>,
    #[serde(default)]
    pub subscription: Option<String>,
    #[serde(default)]
    pub attributes: Map<String, Value>,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

/// Persistent user/role storage owned by the host application.
#[async_trait]
pub trait IdentityStore: Send + Sync {
    async fn find_identity(&self, id: PrincipalId) -> anyhow::Result<Option<IdentityRecord>>;

    /// Capabilities implied by a role name. Unknown roles imply nothing.
    async fn role_capabilities(&self, role: &str) -> anyhow::Result<Vec<String>>;

    /// Check a username/password pair, returning the identity on success.
    async fn verify_password(
        &self,
        username: &str,
        password: &str,
    ) -> anyhow::Result<Option<PrincipalId>>;
}

/// Seed entry for [`MemoryIdentityStore`], as read from a JSON file.
#[derive(Debug, Clone, Deserialize)]
pub struct IdentitySeed {
    #[serde(flatten)]
    pub record: IdentityRecord,
    pub password: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct IdentityDocument {
    #[serde(default)]
    pub roles: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub identities: Vec<IdentitySeed>,
}

#[derive(Debug, Clone)]
struct StoredIdentity {
    record: IdentityRecord,
    password_hash: String,
}

/// In-memory identity store for local deployments and tests.
#[derive(Default)]
pub struct MemoryIdentityStore {
    identities: RwLock<HashMap<PrincipalId, StoredIdentity>>,
    roles: RwLock<HashMap<String, Vec<String>>>,
}

impl MemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from an identity document (`{"roles": {...}, "identities": [...]}`).
    pub async fn from_document(doc: IdentityDocument) -> Self {
        let store = Self::new();
        for (role, caps) in doc.roles {
            store.define_role(&role, caps).await;
        }
        for seed in doc.identities {
            store.upsert_identity(seed.record, &seed.password).await;
        }
        store
    }

    /// Load an identity document from a JSON file.
    pub async fn from_file(path: &std::path::Path) -> anyhow::Result<Self> {
        use anyhow::Context;

        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading identities from {}", path.display()))?;
        let doc: IdentityDocument = serde_json::from_str(&raw)
            .with_context(|| format!("parsing identities in {}", path.display()))?;
        debug!(
            "Loaded {} identities and {} roles from {}",
            doc.identities.len(),
            doc.roles.len(),
            path.display()
        );
        Ok(Self::from_document(doc).await)
    }

    pub async fn define_role(&self, role: &str, capabilities: Vec<String>) {
        self.roles.write().await.insert(role.to_string(), capabilities);
    }

    /// Insert or replace an identity. Callers must invalidate the cached profile.
    pub async fn upsert_identity(&self, record: IdentityRecord, password: &str) {
        let stored = StoredIdentity {
            password_hash: hash_password(record.id, password),
            record,
        };
        self.identities.write().await.insert(stored.record.id, stored);
    }

    pub async fn set_active(&self, id: PrincipalId, is_active: bool) -> bool {
        match self.identities.write().await.get_mut(&id) {
            Some(stored) => {
                stored.record.is_active = is_active;
                true
            }
            None => false,
        }
    }
}

fn hash_password(id: PrincipalId, password: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(id.get().to_be_bytes());
    hasher.update(password.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[async_trait]
impl IdentityStore for MemoryIdentityStore {
    async fn find_identity(&self, id: PrincipalId) -> anyhow::Result<Option<IdentityRecord>> {
        Ok(self
            .identities
            .read()
            .await
            .get(&id)
            .map(|s| s.record.clone()))
    }

    async fn role_capabilities(&self, role: &str) -> anyhow::Result<Vec<String>> {
        Ok(self.roles.read().await.get(role).cloned().unwrap_or_default())
    }

    async fn verify_password(
        &self,
        username: &str,
        password: &str,
    ) -> anyhow::Result<Option<PrincipalId>> {
        let identities = self.identities.read().await;
        let Some(stored) = identities
            .values()
            .find(|s| s.record.username == username && s.record.is_active)
        else {
            return Ok(None);
        };
        let presented = hash_password(stored.record.id, password);
        if constant_time_eq(presented.as_bytes(), stored.password_hash.as_bytes()) {
            Ok(Some(stored.record.id))
        } else {
            Ok(None)
        }
    }
}

fn profile_key(id: PrincipalId) -> String {
    format!("auth:profile:{}", id)
}

/// Lazily materialized, TTL-cached profiles.
///
/// Concurrent misses for the same identity may each load and write; the
/// load is idempotent so the last write wins.
pub struct ProfileStore {
    identities: Arc<dyn IdentityStore>,
    cache: Arc<dyn CacheBackend>,
    ttl: Duration,
}

impl ProfileStore {
    pub fn new(
        identities: Arc<dyn IdentityStore>,
        cache: Arc<dyn CacheBackend>,
        ttl: Duration,
    ) -> Self {
        Self {
            identities,
            cache,
            ttl,
        }
    }

    /// Get the profile of an identity.
    ///
    /// `Ok(None)` means the identity does not exist or is deactivated. Cache
    /// failures fall back to the identity store; identity store failures are
    /// returned as [`crate::auth::AuthError::BackendUnavailable`].
    pub async fn get(&self, id: PrincipalId) -> AuthResult<Option<Arc<Profile>>> {
        let key = profile_key(id);
        match cache::get_json::<Profile>(self.cache.as_ref(), &key).await {
            Ok(Some(profile)) => return Ok(Some(Arc::new(profile))),
            Ok(None) => {}
            Err(e) => warn!("Profile cache read failed for {}, loading from store: {}", id, e),
        }

        let Some(profile) = self.load(id).await? else {
            return Ok(None);
        };

        if let Err(e) = cache::set_json(self.cache.as_ref(), &key, &profile, self.ttl).await {
            warn!("Profile cache write failed for {}: {}", id, e);
        }
        Ok(Some(Arc::new(profile)))
    }

    /// Drop the cached profile so the next `get` reloads it.
    pub async fn invalidate(&self, id: PrincipalId) -> AuthResult<()> {
        debug!("Invalidating cached profile for {}", id);
        self.cache.delete(&profile_key(id)).await
    }

    async fn load(&self, id: PrincipalId) -> AuthResult<Option<Profile>> {
        let Some(record) = self.identities.find_identity(id).await? else {
            return Ok(None);
        };
        if !record.is_active {
            debug!("Identity {} is deactivated", id);
            return Ok(None);
        }

        let mut capabilities: BTreeSet<String> =
            record.granted_capabilities.iter().cloned().collect();
        for role in &record.roles {
            capabilities.extend(self.identities.role_capabilities(role).await?);
        }

        Ok(Some(Profile {
            id: record.id,
            email: record.email,
            display_name: record.display_name,
            roles: record.roles,
            capabilities: capabilities.into_iter().collect(),
            subscription: record.subscription,
            attributes: record.attributes,
        }))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::cache::tests::UnreachableCache;
    use std::sync::atomic::{AtomicUsize, Ordering};

    pub(crate) fn record(id: u64, username: &str, roles: &[&str]) -> IdentityRecord {
        IdentityRecord {
            id: PrincipalId::new(id),
            username: username.to_string(),
            email: Some(format!("{}@example.com", username)),
            display_name: None,
            roles: roles.iter().map(|r| r.to_string()).collect(),
            granted_capabilities: Vec::new(),
            subscription: None,
            attributes: Map::new(),
            is_active: true,
        }
    }

    /// Store wrapper counting identity loads.
    pub(crate) struct CountingStore {
        pub(crate) inner: MemoryIdentityStore,
        pub(crate) loads: AtomicUsize,
    }

    #[async_trait]
    impl IdentityStore for CountingStore {
        async fn find_identity(&self, id: PrincipalId) -> anyhow::Result<Option<IdentityRecord>> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            self.inner.find_identity(id).await
        }

        async fn role_capabilities(&self, role: &str) -> anyhow::Result<Vec<String>> {
            self.inner.role_capabilities(role).await
        }

        async fn verify_password(
            &self,
            username: &str,
            password: &str,
        ) -> anyhow::Result<Option<PrincipalId>> {
            self.inner.verify_password(username, password).await
        }
    }

    struct BrokenStore;

    #[async_trait]
    impl IdentityStore for BrokenStore {
        async fn find_identity(&self, _id: PrincipalId) -> anyhow::Result<Option<IdentityRecord>> {
            Err(anyhow::anyhow!("identity store offline"))
        }

        async fn role_capabilities(&self, _role: &str) -> anyhow::Result<Vec<String>> {
            Err(anyhow::anyhow!("identity store offline"))
        }

        async fn verify_password(&self, _u: &str, _p: &str) -> anyhow::Result<Option<PrincipalId>> {
            Err(anyhow::anyhow!("identity store offline"))
        }
    }

    async fn counting_store() -> Arc<CountingStore> {
        let inner = MemoryIdentityStore::new();
        inner
            .define_role("editor", vec!["edit_posts".to_string(), "read".to_string()])
            .await;
        inner
            .define_role("subscriber", vec!["read".to_string()])
            .await;
        let mut rec = record(1, "ana", &["editor", "subscriber"]);
        rec.granted_capabilities = vec!["export_data".to_string()];
        inner.upsert_identity(rec, "hunter2").await;
        Arc::new(CountingStore {
            inner,
            loads: AtomicUsize::new(0),
        })
    }

    #[tokio::test]
    async fn test_capabilities_union_of_roles_and_grants() {
        let store = counting_store().await;
        let profiles = ProfileStore::new(
            store,
            Arc::new(MemoryCache::default()),
            Duration::from_secs(3600),
        );

        let profile = profiles.get(PrincipalId::new(1)).await.unwrap().unwrap();
        assert_eq!(profile.roles, vec!["editor".to_string(), "subscriber".to_string()]);
        assert_eq!(
            profile.capabilities,
            vec![
                "edit_posts".to_string(),
                "export_data".to_string(),
                "read".to_string()
            ]
        );
        assert_eq!(profile.email.as_deref(), Some("ana@example.com"));
    }

    #[tokio::test]
    async fn test_profile_is_cached_until_invalidated() {
        let store = counting_store().await;
        let profiles = ProfileStore::new(
            store.clone(),
            Arc::new(MemoryCache::default()),
            Duration::from_secs(3600),
        );
        let id = PrincipalId::new(1);

        profiles.get(id).await.unwrap();
        profiles.get(id).await.unwrap();
        assert_eq!(store.loads.load(Ordering::SeqCst), 1);

        let mut updated = record(1, "ana", &["subscriber"]);
        updated.display_name = Some("Ana B.".to_string());
        store.inner.upsert_identity(updated, "hunter2").await;

        // Still the cached snapshot.
        let stale = profiles.get(id).await.unwrap().unwrap();
        assert!(stale.display_name.is_none());

        profiles.invalidate(id).await.unwrap();
        let fresh = profiles.get(id).await.unwrap().unwrap();
        assert_eq!(fresh.display_name.as_deref(), Some("Ana B."));
        assert_eq!(fresh.capabilities, vec!["read".to_string()]);
        assert_eq!(store.loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_profile_ttl_expiry_reloads() {
        let store = counting_store().await;
        let profiles = ProfileStore::new(
            store.clone(),
            Arc::new(MemoryCache::default()),
            Duration::from_millis(50),
        );
        let id = PrincipalId::new(1);

        profiles.get(id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        profiles.get(id).await.unwrap();
        assert_eq!(store.loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unknown_and_inactive_identities() {
        let store = counting_store().await;
        let profiles = ProfileStore::new(
            store.clone(),
            Arc::new(MemoryCache::default()),
            Duration::from_secs(3600),
        );

        assert!(profiles.get(PrincipalId::new(99)).await.unwrap().is_none());

        store.inner.set_active(PrincipalId::new(1), false).await;
        assert!(profiles.get(PrincipalId::new(1)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cache_failure_falls_back_to_store() {
        let store = counting_store().await;
        let profiles = ProfileStore::new(
            store.clone(),
            Arc::new(UnreachableCache),
            Duration::from_secs(3600),
        );

        let profile = profiles.get(PrincipalId::new(1)).await.unwrap();
        assert!(profile.is_some());
        profiles.get(PrincipalId::new(1)).await.unwrap();
        assert_eq!(store.loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_store_failure_is_backend_unavailable() {
        let profiles = ProfileStore::new(
            Arc::new(BrokenStore),
            Arc::new(MemoryCache::default()),
            Duration::from_secs(3600),
        );
        let err = profiles.get(PrincipalId::new(1)).await.unwrap_err();
        assert!(matches!(err, crate::auth::AuthError::BackendUnavailable(_)));
    }

    #[tokio::test]
    async fn test_verify_password() {
        let store = MemoryIdentityStore::new();
        store.upsert_identity(record(4, "bo", &[]), "s3cret").await;

        assert_eq!(
            store.verify_password("bo", "s3cret").await.unwrap(),
            Some(PrincipalId::new(4))
        );
        assert_eq!(store.verify_password("bo", "wrong").await.unwrap(), None);
        assert_eq!(store.verify_password("nobody", "s3cret").await.unwrap(), None);

        store.set_active(PrincipalId::new(4), false).await;
        assert_eq!(store.verify_password("bo", "s3cret").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_from_document() {
        let raw = r#"{
            "roles": { "administrator": ["manage_users", "read"] },
            "identities": [
                { "id": 1, "username": "root", "roles": ["administrator"], "password": "pw" }
            ]
        }"#;
        let doc: IdentityDocument = serde_json::from_str(raw).unwrap();
        let store = MemoryIdentityStore::from_document(doc).await;

        let rec = store.find_identity(PrincipalId::new(1)).await.unwrap().unwrap();
        assert!(rec.is_active);
        assert_eq!(
            store.role_capabilities("administrator").await.unwrap(),
            vec!["manage_users".to_string(), "read".to_string()]
        );
        assert!(store.verify_password("root", "pw").await.unwrap().is_some());
    }
}
