//! Settings for the auth subsystem, loaded from a JSON file.
//!
//! Secrets and API-key entries may reference environment variables with
//! `${NAME}`; references are expanded once at load time.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use std::{env, fs, path::PathBuf};

use crate::crypto::HmacKey;

/// Longest lifetime or window accepted for any duration setting (one year).
pub const MAX_DURATION_SECS: u64 = 365 * 24 * 60 * 60;

/// Seconds as a chrono duration, saturating at [`MAX_DURATION_SECS`].
fn bounded_seconds(secs: u64) -> chrono::Duration {
    chrono::Duration::seconds(secs.min(MAX_DURATION_SECS) as i64)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JwtSettings {
    /// HS256 signing secret
    pub secret: String,
    /// Value of the `iss` claim on minted tokens
    pub issuer: String,
    pub token_ttl_secs: u64,
    /// Tokens with less remaining lifetime than this are reissued
    pub refresh_threshold_secs: u64,
}

impl JwtSettings {
    pub fn token_ttl(&self) -> chrono::Duration {
        bounded_seconds(self.token_ttl_secs)
    }

    pub fn refresh_threshold(&self) -> chrono::Duration {
        bounded_seconds(self.refresh_threshold_secs)
    }
}

impl Default for JwtSettings {
    fn default() -> Self {
        Self {
            secret: String::new(),
            issuer: "authgate".to_string(),
            token_ttl_secs: 3600,
            refresh_threshold_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HmacSettings {
    /// Shared secret; HMAC verification is disabled when empty
    pub secret: String,
    /// Maximum accepted distance between request timestamp and server time
    pub replay_window_secs: u64,
}

impl HmacSettings {
    pub fn replay_window(&self) -> chrono::Duration {
        bounded_seconds(self.replay_window_secs)
    }
}

impl Default for HmacSettings {
    fn default() -> Self {
        Self {
            secret: String::new(),
            replay_window_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NonceSettings {
    /// Action name the host session nonce must be bound to
    pub action: String,
    /// Query/body parameter consulted when no auth header is present
    pub param_name: String,
}

impl Default for NonceSettings {
    fn default() -> Self {
        Self {
            action: "api_request".to_string(),
            param_name: "_auth_nonce".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub profile_ttl_secs: u64,
    /// Upper bound for verified-token entries; remaining token lifetime always wins
    pub token_cache_ttl_secs: u64,
    pub max_capacity: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            profile_ttl_secs: 3600,
            token_cache_ttl_secs: 3600,
            max_capacity: crate::cache::DEFAULT_MAX_CAPACITY,
        }
    }
}

/// Request quota for one tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierLimit {
    pub requests: u32,
    pub window_secs: u64,
}

impl TierLimit {
    pub const fn new(requests: u32, window_secs: u64) -> Self {
        Self {
            requests,
            window_secs,
        }
    }

    /// Window length in milliseconds.
    pub fn window_millis(&self) -> i64 {
        bounded_seconds(self.window_secs).num_milliseconds()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    pub anonymous: TierLimit,
    pub authenticated: TierLimit,
    pub premium: TierLimit,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            anonymous: TierLimit::new(60, 60),
            authenticated: TierLimit::new(120, 60),
            premium: TierLimit::new(300, 60),
        }
    }
}

/// Top-level settings document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthSettings {
    pub jwt: JwtSettings,
    pub hmac: HmacSettings,
    /// Raw API key -> principal id
    pub api_keys: BTreeMap<String, u64>,
    pub nonce: NonceSettings,
    pub cache: CacheSettings,
    pub rate_limit: RateLimitSettings,
    /// Let the host session resolve requests that carry no credential at all
    pub session_fallback: bool,
}

impl AuthSettings {
    /// Settings with the given JWT secret and defaults everywhere else.
    pub fn with_jwt_secret(secret: impl Into<String>) -> Self {
        Self {
            jwt: JwtSettings {
                secret: secret.into(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Reject settings that would make verification unsafe or meaningless.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.jwt.secret.len() < HmacKey::MIN_KEY_LENGTH {
            anyhow::bail!(
                "jwt.secret must be at least {} bytes",
                HmacKey::MIN_KEY_LENGTH
            );
        }
        if self.jwt.token_ttl_secs == 0 {
            anyhow::bail!("jwt.token_ttl_secs must be positive");
        }
        if self.jwt.refresh_threshold_secs >= self.jwt.token_ttl_secs {
            anyhow::bail!(
                "jwt.refresh_threshold_secs ({}) must be below jwt.token_ttl_secs ({})",
                self.jwt.refresh_threshold_secs,
                self.jwt.token_ttl_secs
            );
        }
        if !self.hmac.secret.is_empty() && self.hmac.secret.len() < HmacKey::MIN_KEY_LENGTH {
            anyhow::bail!(
                "hmac.secret must be empty or at least {} bytes",
                HmacKey::MIN_KEY_LENGTH
            );
        }
        if self.hmac.replay_window_secs == 0 {
            anyhow::bail!("hmac.replay_window_secs must be positive");
        }
        for (name, secs) in [
            ("jwt.token_ttl_secs", self.jwt.token_ttl_secs),
            ("jwt.refresh_threshold_secs", self.jwt.refresh_threshold_secs),
            ("hmac.replay_window_secs", self.hmac.replay_window_secs),
            ("cache.profile_ttl_secs", self.cache.profile_ttl_secs),
            ("cache.token_cache_ttl_secs", self.cache.token_cache_ttl_secs),
        ] {
            if secs > MAX_DURATION_SECS {
                anyhow::bail!("{} must be at most {}", name, MAX_DURATION_SECS);
            }
        }
        if self.nonce.param_name.is_empty() {
            anyhow::bail!("nonce.param_name must not be empty");
        }
        for (name, limit) in [
            ("anonymous", self.rate_limit.anonymous),
            ("authenticated", self.rate_limit.authenticated),
            ("premium", self.rate_limit.premium),
        ] {
            if limit.requests == 0 || limit.window_secs == 0 {
                anyhow::bail!("rate_limit.{} needs non-zero requests and window", name);
            }
            if limit.window_secs > MAX_DURATION_SECS {
                anyhow::bail!(
                    "rate_limit.{}.window_secs must be at most {}",
                    name,
                    MAX_DURATION_SECS
                );
            }
        }
        Ok(())
    }

    pub fn profile_ttl(&self) -> Duration {
        Duration::from_secs(self.cache.profile_ttl_secs.min(MAX_DURATION_SECS))
    }

    pub fn token_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache.token_cache_ttl_secs.min(MAX_DURATION_SECS))
    }
}

pub fn resolve_config_path() -> anyhow::Result<PathBuf> {
    if let Ok(p) = env::var("AUTHGATE_CONFIG") {
        return Ok(PathBuf::from(p));
    }

    if let Ok(xdg) = env::var("XDG_CONFIG_HOME") {
        let candidate = PathBuf::from(xdg).join("authgate").join("auth.json");
        if candidate.exists() {
            return Ok(candidate);
        }
    }

    let candidate = PathBuf::from("auth.json");
    if candidate.exists() {
        return Ok(candidate);
    }

    Err(anyhow::anyhow!(
        "Could not find auth.json (set AUTHGATE_CONFIG or create ./auth.json)"
    ))
}

/// Replace `${NAME}` with the value of the environment variable, leaving
/// unknown references untouched.
fn expand_env_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                name.push(c);
            }
            match env::var(&name) {
                Ok(val) => out.push_str(&val),
                Err(_) => {
                    out.push_str("${");
                    out.push_str(&name);
                    out.push('}');
                }
            }
        } else {
            out.push(ch);
        }
    }

    out
}

fn expand_settings(mut settings: AuthSettings) -> AuthSettings {
    settings.jwt.secret = expand_env_vars(&settings.jwt.secret);
    settings.hmac.secret = expand_env_vars(&settings.hmac.secret);
    settings.api_keys = settings
        .api_keys
        .into_iter()
        .map(|(key, id)| (expand_env_vars(&key), id))
        .collect();
    settings
}

/// Parse a settings document and expand `${NAME}` references.
///
/// Not validated here: callers apply overrides first, then call
/// [`AuthSettings::validate`].
pub fn parse_settings(raw: &str) -> anyhow::Result<AuthSettings> {
    let settings: AuthSettings = serde_json::from_str(raw)?;
    Ok(expand_settings(settings))
}

pub fn load_settings(path: Option<PathBuf>) -> anyhow::Result<AuthSettings> {
    let path = match path {
        Some(p) => p,
        None => resolve_config_path()?,
    };
    let raw = fs::read_to_string(&path)
        .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", path.display(), e))?;
    parse_settings(&raw)
}
