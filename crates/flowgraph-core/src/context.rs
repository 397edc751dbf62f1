// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Engine services and per-run context.

use crate::blocks::SharedRegistry;
use crate::config::EngineConfig;
use crate::dag::ProjectGraph;
use crate::error::{EngineError, Result};
use crate::model::{ProjectDefinition, Run};
use crate::ports::{
    Adapter, EmbeddingProvider, HttpPort, LlmProvider, NoSecrets, SecretResolver, VectorStore,
};
use crate::ratelimit::{RateLimiter, RateLimiterSettings};
use async_trait::async_trait;
use flowgraph_sandbox::CancelFlag;
use flowgraph_state::traits::{
    ApprovalStore, IdempotencyStore, JobQueue, RunStore, ScheduleStore, UsageSink,
};
use flowgraph_state::{
    MemoryApprovalStore, MemoryIdempotencyStore, MemoryJobQueue, MemoryRunStore,
    MemoryScheduleStore, MemoryUsageSink,
};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Supplies resolved project definitions to the orchestrator.
///
/// Published runs read an immutable snapshot; `triggered_by = test` runs
/// read the draft. Version 0 selects the draft.
#[async_trait]
pub trait DefinitionSource: Send + Sync {
    /// Loads the definition for a project at a version.
    async fn definition(
        &self,
        project_id: Uuid,
        version: u32,
    ) -> Result<Arc<ProjectDefinition>>;
}

/// In-memory definition source for tests and single-node deployments.
#[derive(Default)]
pub struct MemoryDefinitionSource {
    definitions: RwLock<HashMap<(Uuid, u32), Arc<ProjectDefinition>>>,
}

impl MemoryDefinitionSource {
    /// Creates an empty source.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a definition under its project id and version, and as
    /// the draft (version 0).
    pub fn insert(&self, definition: ProjectDefinition) {
        let project_id = definition.project.id;
        let version = definition.project.version;
        let definition = Arc::new(definition);
        let mut map = self.definitions.write();
        map.insert((project_id, version), definition.clone());
        map.insert((project_id, 0), definition);
    }
}

#[async_trait]
impl DefinitionSource for MemoryDefinitionSource {
    async fn definition(
        &self,
        project_id: Uuid,
        version: u32,
    ) -> Result<Arc<ProjectDefinition>> {
        self.definitions
            .read()
            .get(&(project_id, version))
            .cloned()
            .ok_or(EngineError::NotFound {
                entity: "project",
                id: project_id.to_string(),
            })
    }
}

/// Everything the engine depends on, injected once at startup.
pub struct EngineServices {
    /// Engine configuration.
    pub config: EngineConfig,
    /// Resolved block registry (copy-on-write).
    pub registry: SharedRegistry,
    /// Project definition source.
    pub definitions: Arc<dyn DefinitionSource>,
    /// Run and step-run persistence.
    pub run_store: Arc<dyn RunStore>,
    /// Job queue.
    pub job_queue: Arc<dyn JobQueue>,
    /// Human-in-loop decisions.
    pub approvals: Arc<dyn ApprovalStore>,
    /// Webhook idempotency window.
    pub idempotency: Arc<dyn IdempotencyStore>,
    /// Cron schedules.
    pub schedules: Arc<dyn ScheduleStore>,
    /// Usage accounting sink.
    pub usage: Arc<dyn UsageSink>,
    /// Rate limiter shared with the trigger layer.
    pub rate_limiter: Arc<RateLimiter>,
    /// `ctx.http` backend, when wired.
    pub http: Option<Arc<dyn HttpPort>>,
    /// LLM providers by name.
    pub llm_providers: HashMap<String, Arc<dyn LlmProvider>>,
    /// Embedding provider, when wired.
    pub embeddings: Option<Arc<dyn EmbeddingProvider>>,
    /// Vector store, when wired.
    pub vectors: Option<Arc<dyn VectorStore>>,
    /// Native adapters by name.
    pub adapters: HashMap<String, Arc<dyn Adapter>>,
    /// Per-tenant secret resolution.
    pub secrets: Arc<dyn SecretResolver>,
    /// Engine-approved environment exposed as `ctx.env`.
    pub env: HashMap<String, String>,
}

impl EngineServices {
    /// Builder with in-memory stores and no external capabilities; the
    /// baseline for tests and embedded use.
    pub fn in_memory(registry: SharedRegistry, definitions: Arc<dyn DefinitionSource>) -> Self {
        let config = EngineConfig::default();
        Self {
            rate_limiter: Arc::new(RateLimiter::new(RateLimiterSettings::default())),
            config,
            registry,
            definitions,
            run_store: Arc::new(MemoryRunStore::new()),
            job_queue: Arc::new(MemoryJobQueue::new()),
            approvals: Arc::new(MemoryApprovalStore::new()),
            idempotency: Arc::new(MemoryIdempotencyStore::new()),
            schedules: Arc::new(MemoryScheduleStore::new()),
            usage: Arc::new(MemoryUsageSink::new()),
            http: None,
            llm_providers: HashMap::new(),
            embeddings: None,
            vectors: None,
            adapters: HashMap::new(),
            secrets: Arc::new(NoSecrets),
            env: HashMap::new(),
        }
    }
}

/// Per-run execution context handed through the orchestrator, the group
/// executor, and the step executor.
#[derive(Clone)]
pub struct RunContext {
    /// The run being driven.
    pub run: Arc<Run>,
    /// Resolved definition snapshot.
    pub definition: Arc<ProjectDefinition>,
    /// Validated graph over the definition.
    pub graph: Arc<ProjectGraph>,
    /// Cooperative cancellation flag.
    pub cancel: CancelFlag,
    /// Shared services.
    pub services: Arc<EngineServices>,
}

impl RunContext {
    /// Checks the in-process flag and the persisted flag; flips the
    /// in-process flag when the store saw a cancel first.
    pub async fn is_cancelled(&self) -> bool {
        if self.cancel.is_cancelled() {
            return true;
        }
        match self.services.run_store.is_cancel_requested(self.run.id).await {
            Ok(true) => {
                self.cancel.cancel();
                true
            }
            _ => false,
        }
    }
}
