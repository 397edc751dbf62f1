// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Engine configuration.
//!
//! Every knob is overridable in code; [`EngineConfig::from_env`] reads
//! the recognized environment options and falls back to the documented
//! defaults.

use crate::ratelimit::{RateLimiterSettings, ScopeLimit};
use std::time::Duration;

/// Engine-wide configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Whether the API layer enforces bearer auth (dev mode accepts a
    /// tenant header instead). The engine only carries the flag.
    pub auth_enabled: bool,
    /// Durable store URL, when configured.
    pub database_url: Option<String>,
    /// Queue backend URL, when configured.
    pub redis_url: Option<String>,
    /// Rate limiter settings.
    pub rate_limits: RateLimiterSettings,
    /// Sandbox execution deadline per snippet.
    pub sandbox_timeout: Duration,
    /// Worker pool size.
    pub worker_concurrency: usize,
    /// Scheduler tick interval.
    pub scheduler_tick: Duration,
    /// Accepted webhook timestamp skew in either direction.
    pub webhook_clock_skew: Duration,
    /// Webhook idempotency window.
    pub idempotency_ttl: Duration,
    /// Block inheritance depth cap.
    pub inheritance_max_depth: usize,
    /// Concurrent ready steps per run.
    pub run_step_concurrency: usize,
    /// Default `ctx.http` per-call timeout.
    pub http_timeout: Duration,
    /// Job lease duration.
    pub job_lease: Duration,
    /// Lease heartbeat interval.
    pub lease_heartbeat: Duration,
    /// Wait steps at or below this duration sleep in-process; longer
    /// waits persist a delayed re-enqueue.
    pub wait_inline_threshold: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            auth_enabled: true,
            database_url: None,
            redis_url: None,
            rate_limits: RateLimiterSettings::default(),
            sandbox_timeout: Duration::from_millis(30_000),
            worker_concurrency: 4,
            scheduler_tick: Duration::from_millis(1_000),
            webhook_clock_skew: Duration::from_secs(300),
            idempotency_ttl: Duration::from_secs(24 * 3600),
            inheritance_max_depth: 50,
            run_step_concurrency: 8,
            http_timeout: Duration::from_secs(30),
            job_lease: Duration::from_secs(300),
            lease_heartbeat: Duration::from_secs(60),
            wait_inline_threshold: Duration::from_secs(30),
        }
    }
}

impl EngineConfig {
    /// Loads configuration from the environment.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let rate_limits = RateLimiterSettings {
            enabled: env_bool("RATE_LIMIT_ENABLED", defaults.rate_limits.enabled),
            tenant: ScopeLimit::per_minute(env_u32(
                "RATE_LIMIT_TENANT",
                defaults.rate_limits.tenant.capacity,
            )),
            project: ScopeLimit::per_minute(env_u32(
                "RATE_LIMIT_PROJECT",
                defaults.rate_limits.project.capacity,
            )),
            webhook: ScopeLimit::per_minute(env_u32(
                "RATE_LIMIT_WEBHOOK",
                defaults.rate_limits.webhook.capacity,
            )),
        };

        Self {
            auth_enabled: env_bool("AUTH_ENABLED", defaults.auth_enabled),
            database_url: std::env::var("DATABASE_URL").ok(),
            redis_url: std::env::var("REDIS_URL").ok(),
            rate_limits,
            sandbox_timeout: Duration::from_millis(env_u64(
                "SANDBOX_TIMEOUT_MS",
                defaults.sandbox_timeout.as_millis() as u64,
            )),
            worker_concurrency: env_u64(
                "WORKER_CONCURRENCY",
                defaults.worker_concurrency as u64,
            ) as usize,
            scheduler_tick: Duration::from_millis(env_u64(
                "SCHEDULER_TICK_MS",
                defaults.scheduler_tick.as_millis() as u64,
            )),
            webhook_clock_skew: Duration::from_secs(env_u64(
                "WEBHOOK_CLOCK_SKEW_SECONDS",
                defaults.webhook_clock_skew.as_secs(),
            )),
            idempotency_ttl: Duration::from_secs(
                env_u64(
                    "IDEMPOTENCY_TTL_HOURS",
                    defaults.idempotency_ttl.as_secs() / 3600,
                ) * 3600,
            ),
            inheritance_max_depth: env_u64(
                "INHERITANCE_MAX_DEPTH",
                defaults.inheritance_max_depth as u64,
            ) as usize,
            run_step_concurrency: defaults.run_step_concurrency,
            http_timeout: defaults.http_timeout,
            job_lease: defaults.job_lease,
            lease_heartbeat: defaults.lease_heartbeat,
            wait_inline_threshold: defaults.wait_inline_threshold,
        }
    }
}

fn env_bool(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(default)
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u32(name: &str, default: u32) -> u32 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
