//! Fixed-window request quotas per caller tier.
//!
//! Counters live in the shared cache under `rl:{tier}:{identifier}:{resource}`
//! and expire with their window. A counter read and its increment are separate
//! cache operations, so concurrent requests may overshoot the limit slightly.
//! An unreachable cache never blocks traffic.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::auth::{AuthError, AuthResult, Principal};
use crate::cache::{self, CacheBackend};
use crate::config::{RateLimitSettings, TierLimit};

/// Caller class selecting a quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Anonymous,
    Authenticated,
    Premium,
}

impl Tier {
    pub fn for_principal(principal: Option<&Principal>) -> Self {
        match principal {
            None => Self::Anonymous,
            Some(p) if p.is_premium() => Self::Premium,
            Some(_) => Self::Authenticated,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Anonymous => "anonymous",
            Self::Authenticated => "authenticated",
            Self::Premium => "premium",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a quota check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateDecision {
    pub allowed: bool,
    pub tier: Tier,
    pub limit: u32,
    pub remaining: u32,
    /// Time until the window resets; zero when allowed.
    #[serde(with = "secs")]
    pub retry_after: Duration,
}

mod secs {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }
}

impl RateDecision {
    fn open(tier: Tier, limit: u32) -> Self {
        Self {
            allowed: true,
            tier,
            limit,
            remaining: limit,
            retry_after: Duration::ZERO,
        }
    }

    /// Turn a denial into [`AuthError::RateLimited`].
    pub fn into_result(self) -> AuthResult<Self> {
        if self.allowed {
            Ok(self)
        } else {
            Err(AuthError::rate_limited(self.retry_after.as_secs()))
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct WindowCounter {
    count: u32,
    /// Window start, unix milliseconds.
    started_at: i64,
}

impl WindowCounter {
    fn window_end(&self, limit: &TierLimit) -> i64 {
        self.started_at.saturating_add(limit.window_millis())
    }

    fn is_current(&self, limit: &TierLimit, now: DateTime<Utc>) -> bool {
        now.timestamp_millis() < self.window_end(limit)
    }
}

pub struct RateLimiter {
    cache: Arc<dyn CacheBackend>,
    settings: RateLimitSettings,
}

impl RateLimiter {
    pub fn new(cache: Arc<dyn CacheBackend>, settings: RateLimitSettings) -> Self {
        Self { cache, settings }
    }

    pub fn limit_for(&self, tier: Tier) -> TierLimit {
        match tier {
            Tier::Anonymous => self.settings.anonymous,
            Tier::Authenticated => self.settings.authenticated,
            Tier::Premium => self.settings.premium,
        }
    }

    /// Whether one more request fits in the current window. Does not count it.
    pub async fn check(&self, identifier: &str, resource: &str, tier: Tier) -> RateDecision {
        self.check_at(identifier, resource, tier, Utc::now()).await
    }

    /// Count one request against the current window.
    pub async fn record(&self, identifier: &str, resource: &str, tier: Tier) {
        self.record_at(identifier, resource, tier, Utc::now()).await
    }

    /// Check and, when allowed, record in one call.
    pub async fn allow(&self, identifier: &str, resource: &str, tier: Tier) -> RateDecision {
        self.allow_at(identifier, resource, tier, Utc::now()).await
    }

    pub async fn check_at(
        &self,
        identifier: &str,
        resource: &str,
        tier: Tier,
        now: DateTime<Utc>,
    ) -> RateDecision {
        let limit = self.limit_for(tier);
        let key = counter_key(tier, identifier, resource);

        let counter = match self.current(&key, &limit, now).await {
            Ok(counter) => counter,
            Err(e) => {
                warn!("Rate limit check skipped for {}: {}", key, e);
                return RateDecision::open(tier, limit.requests);
            }
        };
        let Some(counter) = counter else {
            return RateDecision::open(tier, limit.requests);
        };

        if counter.count < limit.requests {
            return RateDecision {
                allowed: true,
                tier,
                limit: limit.requests,
                remaining: limit.requests - counter.count,
                retry_after: Duration::ZERO,
            };
        }

        let until_reset_ms = counter
            .window_end(&limit)
            .saturating_sub(now.timestamp_millis())
            .max(0) as u64;
        let retry_secs = until_reset_ms.div_ceil(1000).clamp(1, limit.window_secs);
        debug!("Rate limit exceeded for {} ({} requests)", key, counter.count);
        RateDecision {
            allowed: false,
            tier,
            limit: limit.requests,
            remaining: 0,
            retry_after: Duration::from_secs(retry_secs),
        }
    }

    pub async fn record_at(
        &self,
        identifier: &str,
        resource: &str,
        tier: Tier,
        now: DateTime<Utc>,
    ) {
        let limit = self.limit_for(tier);
        let key = counter_key(tier, identifier, resource);

        let counter = match self.current(&key, &limit, now).await {
            Ok(Some(mut counter)) => {
                counter.count = counter.count.saturating_add(1);
                counter
            }
            Ok(None) => WindowCounter {
                count: 1,
                started_at: now.timestamp_millis(),
            },
            Err(e) => {
                warn!("Rate limit record skipped for {}: {}", key, e);
                return;
            }
        };

        let remaining_ms = counter
            .window_end(&limit)
            .saturating_sub(now.timestamp_millis())
            .max(1000) as u64;
        let ttl = Duration::from_millis(remaining_ms);
        if let Err(e) = cache::set_json(self.cache.as_ref(), &key, &counter, ttl).await {
            warn!("Rate limit record failed for {}: {}", key, e);
        }
    }

    pub async fn allow_at(
        &self,
        identifier: &str,
        resource: &str,
        tier: Tier,
        now: DateTime<Utc>,
    ) -> RateDecision {
        let mut decision = self.check_at(identifier, resource, tier, now).await;
        if decision.allowed {
            self.record_at(identifier, resource, tier, now).await;
            decision.remaining = decision.remaining.saturating_sub(1);
        }
        decision
    }

    /// Counter of the window containing `now`, if any.
    async fn current(
        &self,
        key: &str,
        limit: &TierLimit,
        now: DateTime<Utc>,
    ) -> AuthResult<Option<WindowCounter>> {
        let counter: Option<WindowCounter> = cache::get_json(self.cache.as_ref(), key).await?;
        Ok(counter.filter(|c| c.is_current(limit, now)))
    }
}

fn counter_key(tier: Tier, identifier: &str, resource: &str) -> String {
    format!("rl:{}:{}:{}", tier, identifier, resource)
}
