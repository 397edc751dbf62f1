// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Secret resolution for `ctx.secrets`.
//!
//! Secrets are resolved per step execution and never cached across
//! tenants. The environment resolver serves single-tenant deployments;
//! multi-tenant installations inject a store-backed implementation.

use flowgraph_core::ports::SecretResolver;
use parking_lot::RwLock;
use std::collections::HashMap;
use uuid::Uuid;

/// Resolves secrets from environment variables with a fixed prefix.
///
/// `FLOWGRAPH_SECRET_GITHUB_TOKEN=...` becomes `GITHUB_TOKEN` in
/// `ctx.secrets`, for every tenant.
pub struct EnvSecretResolver {
    prefix: String,
}

impl EnvSecretResolver {
    /// Creates a resolver with the default `FLOWGRAPH_SECRET_` prefix.
    pub fn new() -> Self {
        Self::with_prefix("FLOWGRAPH_SECRET_")
    }

    /// Creates a resolver with a custom prefix.
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl Default for EnvSecretResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl SecretResolver for EnvSecretResolver {
    fn resolve(&self, _tenant_id: Uuid) -> HashMap<String, String> {
        std::env::vars()
            .filter_map(|(name, value)| {
                name.strip_prefix(&self.prefix)
                    .map(|stripped| (stripped.to_string(), value))
            })
            .collect()
    }
}

/// Static per-tenant secret map for tests and embedded use.
#[derive(Default)]
pub struct StaticSecrets {
    by_tenant: RwLock<HashMap<Uuid, HashMap<String, String>>>,
}

impl StaticSecrets {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets one secret for a tenant.
    pub fn set(&self, tenant_id: Uuid, name: impl Into<String>, value: impl Into<String>) {
        self.by_tenant
            .write()
            .entry(tenant_id)
            .or_default()
            .insert(name.into(), value.into());
    }
}

impl SecretResolver for StaticSecrets {
    fn resolve(&self, tenant_id: Uuid) -> HashMap<String, String> {
        self.by_tenant
            .read()
            .get(&tenant_id)
            .cloned()
            .unwrap_or_default()
    }
}
