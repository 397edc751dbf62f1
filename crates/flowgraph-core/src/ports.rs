// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Provider port definitions.
//!
//! The engine depends on these traits; concrete implementations live in
//! `flowgraph-providers` and are injected at startup.

use async_trait::async_trait;
use flowgraph_sandbox::{CapabilityError, HttpRequest, HttpResponse};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// One chat message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// `user`, `assistant`, or `system`.
    pub role: String,
    /// Message text.
    pub content: String,
}

/// LLM call request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmRequest {
    /// Model name. Filled from the call site when the payload omits it.
    #[serde(default)]
    pub model: String,

    /// Conversation messages.
    #[serde(default)]
    pub messages: Vec<ChatMessage>,

    /// System prompt (optional).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,

    /// Temperature (0.0 - 2.0).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    /// Maximum tokens to generate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Additional provider-specific parameters.
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

/// Token usage reported by a provider.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct LlmUsage {
    /// Prompt-side tokens.
    pub input_tokens: u64,
    /// Completion-side tokens.
    pub output_tokens: u64,
}

/// LLM call response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmResponse {
    /// Generated text.
    pub content: String,

    /// Model that produced it.
    pub model: String,

    /// Token usage.
    pub usage: LlmUsage,

    /// Additional metadata (stop reason, provider ids, …).
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

/// LLM provider port.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Runs a chat-style request.
    async fn chat(&self, request: LlmRequest) -> Result<LlmResponse, CapabilityError>;

    /// Runs a completion-style request. Providers without a dedicated
    /// completion surface answer through chat.
    async fn complete(&self, request: LlmRequest) -> Result<LlmResponse, CapabilityError> {
        self.chat(request).await
    }

    /// Provider name (`anthropic`, `openai`, …).
    fn name(&self) -> &str;

    /// Cheap liveness probe.
    async fn health_check(&self) -> Result<(), CapabilityError> {
        Ok(())
    }
}

/// Egress-filtered HTTP port backing `ctx.http`.
#[async_trait]
pub trait HttpPort: Send + Sync {
    /// Performs one HTTP exchange. Any completed exchange is `Ok`; the
    /// status travels in the response so block code can classify it.
    async fn request(&self, request: HttpRequest) -> Result<HttpResponse, CapabilityError>;
}

/// Embedding provider port backing `ctx.embedding`.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embeds a batch of texts.
    async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, CapabilityError>;

    /// Provider name.
    fn name(&self) -> &str;
}

/// One stored vector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorRecord {
    /// Record identity within the collection.
    pub id: String,
    /// Embedding vector.
    pub vector: Vec<f32>,
    /// Attached metadata.
    #[serde(default)]
    pub metadata: Value,
}

/// A nearest-neighbor match.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorMatch {
    /// Matched record id.
    pub id: String,
    /// Similarity score (higher is closer).
    pub score: f32,
    /// Matched record metadata.
    #[serde(default)]
    pub metadata: Value,
}

/// Vector store port backing `ctx.vector`.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Inserts or replaces records in a collection.
    async fn upsert(
        &self,
        collection: &str,
        records: Vec<VectorRecord>,
    ) -> Result<usize, CapabilityError>;

    /// Nearest-neighbor query.
    async fn query(
        &self,
        collection: &str,
        vector: Vec<f32>,
        top_k: usize,
    ) -> Result<Vec<VectorMatch>, CapabilityError>;

    /// Deletes records by id.
    async fn delete(&self, collection: &str, ids: Vec<String>) -> Result<usize, CapabilityError>;

    /// Lists known collections.
    async fn list_collections(&self) -> Result<Vec<String>, CapabilityError>;
}

/// Native adapter port backing `ctx.adapter`.
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Adapter name used by `ctx.adapter.call`.
    fn name(&self) -> &str;

    /// Invokes a named method with an opaque payload.
    async fn call(&self, method: &str, payload: Value) -> Result<Value, CapabilityError>;
}

/// Per-tenant secret resolution backing `ctx.secrets`.
///
/// Resolved once per step execution; implementations must not cache
/// across tenants.
pub trait SecretResolver: Send + Sync {
    /// The full secret map visible to a tenant.
    fn resolve(&self, tenant_id: uuid::Uuid) -> HashMap<String, String>;
}

/// Static empty resolver for tests and minimal deployments.
pub struct NoSecrets;

impl SecretResolver for NoSecrets {
    fn resolve(&self, _tenant_id: uuid::Uuid) -> HashMap<String, String> {
        HashMap::new()
    }
}
