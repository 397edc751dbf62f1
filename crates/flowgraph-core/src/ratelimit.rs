// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Token-bucket rate limiting per `{scope, key}`.
//!
//! Buckets refill continuously at the configured per-minute rate and are
//! snapshotted to a [`SnapshotStore`] so limits survive restarts;
//! transient snapshot loss is acceptable.

use crate::error::{EngineError, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use flowgraph_state::traits::SnapshotStore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::warn;

/// Key under which the limiter snapshots its buckets.
const SNAPSHOT_KEY: &str = "rate_limiter_buckets";

/// What a token is charged against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateScope {
    /// Whole tenant.
    Tenant,
    /// Single project.
    Project,
    /// Single webhook key.
    Webhook,
}

impl RateScope {
    /// Stable name used in keys, headers, and error payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tenant => "tenant",
            Self::Project => "project",
            Self::Webhook => "webhook",
        }
    }
}

/// Per-scope limit: capacity and refill, both per minute by default.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ScopeLimit {
    /// Bucket capacity.
    pub capacity: u32,
    /// Tokens restored per minute.
    pub refill_per_minute: u32,
}

impl ScopeLimit {
    /// Capacity-per-minute limit (the default shape).
    pub fn per_minute(n: u32) -> Self {
        Self {
            capacity: n,
            refill_per_minute: n,
        }
    }
}

/// Limiter settings across the three scopes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimiterSettings {
    /// Master switch; a disabled limiter always admits.
    pub enabled: bool,
    /// Tenant-scope limit.
    pub tenant: ScopeLimit,
    /// Project-scope limit.
    pub project: ScopeLimit,
    /// Webhook-key-scope limit.
    pub webhook: ScopeLimit,
}

impl Default for RateLimiterSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            tenant: ScopeLimit::per_minute(600),
            project: ScopeLimit::per_minute(300),
            webhook: ScopeLimit::per_minute(60),
        }
    }
}

/// Admission outcome, carried into `X-RateLimit-*` headers.
#[derive(Debug, Clone, Copy)]
pub struct RateDecision {
    /// Configured capacity for the scope.
    pub limit: u32,
    /// Whole tokens left after this acquisition.
    pub remaining: u32,
    /// Seconds until the bucket is full again.
    pub reset_after_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BucketState {
    tokens: f64,
    updated_at: DateTime<Utc>,
}

/// Token-bucket rate limiter.
pub struct RateLimiter {
    settings: RateLimiterSettings,
    buckets: DashMap<String, BucketState>,
}

impl RateLimiter {
    /// Creates a limiter with the given settings.
    pub fn new(settings: RateLimiterSettings) -> Self {
        Self {
            settings,
            buckets: DashMap::new(),
        }
    }

    fn limit_for(&self, scope: RateScope) -> ScopeLimit {
        match scope {
            RateScope::Tenant => self.settings.tenant,
            RateScope::Project => self.settings.project,
            RateScope::Webhook => self.settings.webhook,
        }
    }

    /// Takes one token for `{scope, key}`.
    ///
    /// Returns [`EngineError::RateLimit`] with a retry hint when the
    /// bucket is empty.
    pub fn try_acquire(&self, scope: RateScope, key: &str) -> Result<RateDecision> {
        if !self.settings.enabled {
            return Ok(RateDecision {
                limit: u32::MAX,
                remaining: u32::MAX,
                reset_after_secs: 0,
            });
        }

        let limit = self.limit_for(scope);
        let refill_per_sec = f64::from(limit.refill_per_minute) / 60.0;
        let now = Utc::now();
        let bucket_key = format!("{}:{}", scope.as_str(), key);

        let mut entry = self.buckets.entry(bucket_key).or_insert(BucketState {
            tokens: f64::from(limit.capacity),
            updated_at: now,
        });

        let elapsed = (now - entry.updated_at)
            .to_std()
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        entry.tokens = (entry.tokens + elapsed * refill_per_sec).min(f64::from(limit.capacity));
        entry.updated_at = now;

        if entry.tokens < 1.0 {
            let deficit = 1.0 - entry.tokens;
            let retry_after_secs = (deficit / refill_per_sec).ceil() as u64;
            return Err(EngineError::RateLimit {
                scope: scope.as_str().to_string(),
                key: key.to_string(),
                retry_after_secs: retry_after_secs.max(1),
            });
        }

        entry.tokens -= 1.0;
        let deficit = f64::from(limit.capacity) - entry.tokens;
        Ok(RateDecision {
            limit: limit.capacity,
            remaining: entry.tokens.floor() as u32,
            reset_after_secs: (deficit / refill_per_sec).ceil() as u64,
        })
    }

    /// Persists current bucket state.
    pub async fn snapshot_to(&self, store: &dyn SnapshotStore) -> Result<()> {
        let map: HashMap<String, BucketState> = self
            .buckets
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        let value = serde_json::to_value(map)?;
        store
            .save(SNAPSHOT_KEY, value)
            .await
            .map_err(EngineError::from)
    }

    /// Restores bucket state saved by [`Self::snapshot_to`]. Unknown or
    /// malformed snapshots are ignored.
    pub async fn restore_from(&self, store: &dyn SnapshotStore) -> Result<()> {
        let Some(value) = store.load(SNAPSHOT_KEY).await? else {
            return Ok(());
        };
        match serde_json::from_value::<HashMap<String, BucketState>>(value) {
            Ok(map) => {
                for (key, state) in map {
                    self.buckets.insert(key, state);
                }
            }
            Err(err) => {
                warn!(error = %err, "discarding malformed rate-limiter snapshot");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowgraph_state::MemorySnapshotStore;

    fn tight_settings() -> RateLimiterSettings {
        RateLimiterSettings {
            enabled: true,
            tenant: ScopeLimit::per_minute(2),
            project: ScopeLimit::per_minute(2),
            webhook: ScopeLimit::per_minute(2),
        }
    }

    #[test]
    fn test_acquire_until_empty() {
        let limiter = RateLimiter::new(tight_settings());
        assert!(limiter.try_acquire(RateScope::Webhook, "k").is_ok());
        assert!(limiter.try_acquire(RateScope::Webhook, "k").is_ok());
        let err = limiter.try_acquire(RateScope::Webhook, "k").unwrap_err();
        match err {
            EngineError::RateLimit {
                scope,
                retry_after_secs,
                ..
            } => {
                assert_eq!(scope, "webhook");
                assert!(retry_after_secs >= 1);
            }
            other => panic!("expected rate limit error, got {:?}", other),
        }
    }

    #[test]
    fn test_keys_are_independent() {
        let limiter = RateLimiter::new(tight_settings());
        assert!(limiter.try_acquire(RateScope::Webhook, "a").is_ok());
        assert!(limiter.try_acquire(RateScope::Webhook, "a").is_ok());
        assert!(limiter.try_acquire(RateScope::Webhook, "b").is_ok());
    }

    #[test]
    fn test_disabled_limiter_admits() {
        let mut settings = tight_settings();
        settings.enabled = false;
        let limiter = RateLimiter::new(settings);
        for _ in 0..10 {
            assert!(limiter.try_acquire(RateScope::Tenant, "t").is_ok());
        }
    }

    #[test]
    fn test_decision_counts_down() {
        let limiter = RateLimiter::new(RateLimiterSettings {
            enabled: true,
            webhook: ScopeLimit::per_minute(5),
            ..RateLimiterSettings::default()
        });
        let first = limiter.try_acquire(RateScope::Webhook, "k").unwrap();
        let second = limiter.try_acquire(RateScope::Webhook, "k").unwrap();
        assert_eq!(first.limit, 5);
        assert!(second.remaining < first.remaining);
    }

    #[tokio::test]
    async fn test_snapshot_round_trip() {
        let store = MemorySnapshotStore::new();
        let limiter = RateLimiter::new(tight_settings());
        limiter.try_acquire(RateScope::Webhook, "k").unwrap();
        limiter.try_acquire(RateScope::Webhook, "k").unwrap();
        limiter.snapshot_to(&store).await.unwrap();

        let restored = RateLimiter::new(tight_settings());
        restored.restore_from(&store).await.unwrap();
        // The restored bucket is still empty.
        assert!(restored.try_acquire(RateScope::Webhook, "k").is_err());
    }
}
