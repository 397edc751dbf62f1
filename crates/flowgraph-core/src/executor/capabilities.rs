// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The capability surface bound to one step execution.
//!
//! [`StepCapabilities`] adapts the injected ports to the sandbox
//! [`Capabilities`] trait, keying usage records and approval lookups to
//! the executing step run. Secrets are resolved per execution and never
//! cached.

use crate::context::EngineServices;
use crate::ports::{
    Adapter, EmbeddingProvider, HttpPort, LlmProvider, SecretResolver, VectorStore,
};
use async_trait::async_trait;
use chrono::Utc;
use flowgraph_sandbox::{Capabilities, CapabilityError, HttpRequest, HttpResponse, LogEntry};
use flowgraph_state::model::{UsageKind, UsageRecord};
use flowgraph_state::traits::{ApprovalStore, UsageSink};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;
use uuid::Uuid;

/// Runs a sub-workflow on behalf of `ctx.workflow.run`.
///
/// Implemented by the engine; broken out as a trait so the capability
/// layer does not depend on the orchestrator.
#[async_trait]
pub trait SubflowRunner: Send + Sync {
    /// Executes the target project to completion and returns its output.
    async fn run_subflow(
        &self,
        tenant_id: Uuid,
        project_id: Uuid,
        start_step_id: Option<Uuid>,
        input: Value,
    ) -> crate::error::Result<Value>;
}

/// Identity of the executing step run, used for accounting and approval
/// keys.
#[derive(Debug, Clone, Copy)]
pub struct StepScope {
    /// Owning tenant.
    pub tenant_id: Uuid,
    /// Owning project.
    pub project_id: Uuid,
    /// Owning run.
    pub run_id: Uuid,
    /// The step being executed.
    pub step_id: Uuid,
    /// The step-run attempt.
    pub step_run_id: Uuid,
}

impl StepScope {
    /// Approval key for this step: stable across attempts so a resumed
    /// run finds the decision recorded for the suspended gate.
    pub fn approval_key(&self) -> String {
        format!("{}/{}", self.run_id, self.step_id)
    }
}

/// Capability implementation handed to the sandbox for one execution.
pub struct StepCapabilities {
    services: Arc<EngineServices>,
    scope: StepScope,
    variables: Value,
    subflow: Option<Arc<dyn SubflowRunner>>,
}

impl StepCapabilities {
    /// Binds the services to a step scope.
    pub fn new(
        services: Arc<EngineServices>,
        scope: StepScope,
        variables: Value,
        subflow: Option<Arc<dyn SubflowRunner>>,
    ) -> Self {
        Self {
            services,
            scope,
            variables,
            subflow,
        }
    }

    async fn record_usage(
        &self,
        kind: UsageKind,
        provider: Option<String>,
        model: Option<String>,
        tokens_in: Option<u64>,
        tokens_out: Option<u64>,
        duration_ms: u64,
    ) {
        let record = UsageRecord {
            id: Uuid::new_v4(),
            tenant_id: self.scope.tenant_id,
            project_id: self.scope.project_id,
            run_id: self.scope.run_id,
            step_run_id: self.scope.step_run_id,
            kind,
            provider,
            model,
            tokens_in,
            tokens_out,
            duration_ms,
            at: Utc::now(),
        };
        // Accounting must never fail the step.
        if let Err(err) = self.services.usage.record(record).await {
            debug!(error = %err, "failed to record usage");
        }
    }
}

#[async_trait]
impl Capabilities for StepCapabilities {
    async fn http(&self, request: HttpRequest) -> Result<HttpResponse, CapabilityError> {
        let port = self
            .services
            .http
            .as_ref()
            .ok_or(CapabilityError::Unavailable {
                name: "http".into(),
            })?;
        let started = Instant::now();
        let result = port.request(request).await;
        self.record_usage(
            UsageKind::Http,
            None,
            None,
            None,
            None,
            started.elapsed().as_millis() as u64,
        )
        .await;
        result
    }

    async fn llm(
        &self,
        method: &str,
        provider: &str,
        model: &str,
        request: Value,
    ) -> Result<Value, CapabilityError> {
        let llm = self
            .services
            .llm_providers
            .get(provider)
            .ok_or_else(|| CapabilityError::Provider {
                code: "PROVIDER_UNKNOWN".into(),
                message: format!("provider '{}' is not registered", provider),
            })?;

        let mut typed: crate::ports::LlmRequest = serde_json::from_value(request)
            .map_err(|e| CapabilityError::Invalid {
                message: format!("llm request: {}", e),
            })?;
        typed.model = model.to_string();

        let started = Instant::now();
        let response = if method == "complete" {
            llm.complete(typed).await?
        } else {
            llm.chat(typed).await?
        };
        self.record_usage(
            UsageKind::Llm,
            Some(provider.to_string()),
            Some(response.model.clone()),
            Some(response.usage.input_tokens),
            Some(response.usage.output_tokens),
            started.elapsed().as_millis() as u64,
        )
        .await;

        Ok(json!({
            "content": response.content,
            "usage": {
                "input_tokens": response.usage.input_tokens,
                "output_tokens": response.usage.output_tokens,
            },
        }))
    }

    async fn workflow_run(
        &self,
        project_id: &str,
        start_step_id: Option<&str>,
        input: Value,
    ) -> Result<Value, CapabilityError> {
        let runner = self
            .subflow
            .as_ref()
            .ok_or(CapabilityError::Unavailable {
                name: "workflow".into(),
            })?;
        let project_id = Uuid::parse_str(project_id).map_err(|_| CapabilityError::Invalid {
            message: format!("'{}' is not a project id", project_id),
        })?;
        let start_step_id = start_step_id
            .map(Uuid::parse_str)
            .transpose()
            .map_err(|_| CapabilityError::Invalid {
                message: "start_step_id is not a uuid".into(),
            })?;
        runner
            .run_subflow(self.scope.tenant_id, project_id, start_step_id, input)
            .await
            .map_err(|err| CapabilityError::Provider {
                code: err.code().to_string(),
                message: err.to_string(),
            })
    }

    async fn approval(&self, request: Value) -> Result<Value, CapabilityError> {
        let key = self.scope.approval_key();
        let existing = self
            .services
            .approvals
            .decision(&key)
            .await
            .map_err(|e| CapabilityError::Internal(e.to_string()))?;
        match existing {
            Some(decision) => serde_json::to_value(decision)
                .map_err(|e| CapabilityError::Internal(e.to_string())),
            None => {
                self.services
                    .approvals
                    .record_request(&key, request)
                    .await
                    .map_err(|e| CapabilityError::Internal(e.to_string()))?;
                Err(CapabilityError::Suspended { key })
            }
        }
    }

    async fn adapter(
        &self,
        name: &str,
        method: &str,
        payload: Value,
    ) -> Result<Value, CapabilityError> {
        let adapter = self
            .services
            .adapters
            .get(name)
            .ok_or_else(|| CapabilityError::Unavailable {
                name: format!("adapter '{}'", name),
            })?;
        adapter.call(method, payload).await
    }

    async fn adapter_list(&self) -> Result<Value, CapabilityError> {
        let names: Vec<&str> = self.services.adapters.keys().map(String::as_str).collect();
        Ok(json!(names))
    }

    async fn embed(&self, request: Value) -> Result<Value, CapabilityError> {
        let provider = self
            .services
            .embeddings
            .as_ref()
            .ok_or(CapabilityError::Unavailable {
                name: "embedding".into(),
            })?;
        let texts: Vec<String> = match &request {
            Value::Array(_) => serde_json::from_value(request.clone()),
            _ => serde_json::from_value(request.get("texts").cloned().unwrap_or(Value::Null)),
        }
        .map_err(|e| CapabilityError::Invalid {
            message: format!("embed request: {}", e),
        })?;

        let started = Instant::now();
        let vectors = provider.embed(texts).await?;
        self.record_usage(
            UsageKind::Embedding,
            Some(provider.name().to_string()),
            None,
            None,
            None,
            started.elapsed().as_millis() as u64,
        )
        .await;
        serde_json::to_value(vectors).map_err(|e| CapabilityError::Internal(e.to_string()))
    }

    async fn vector(&self, method: &str, payload: Value) -> Result<Value, CapabilityError> {
        let store = self
            .services
            .vectors
            .as_ref()
            .ok_or(CapabilityError::Unavailable {
                name: "vector".into(),
            })?;

        let collection = payload
            .get("collection")
            .and_then(Value::as_str)
            .unwrap_or("default")
            .to_string();

        match method {
            "upsert" => {
                let records = serde_json::from_value(
                    payload.get("records").cloned().unwrap_or(json!([])),
                )
                .map_err(|e| CapabilityError::Invalid {
                    message: format!("vector.upsert records: {}", e),
                })?;
                let count = store.upsert(&collection, records).await?;
                Ok(json!({ "upserted": count }))
            }
            "query" => {
                let vector: Vec<f32> = serde_json::from_value(
                    payload.get("vector").cloned().unwrap_or(json!([])),
                )
                .map_err(|e| CapabilityError::Invalid {
                    message: format!("vector.query vector: {}", e),
                })?;
                let top_k = payload
                    .get("top_k")
                    .and_then(Value::as_u64)
                    .unwrap_or(10) as usize;
                let matches = store.query(&collection, vector, top_k).await?;
                serde_json::to_value(matches)
                    .map_err(|e| CapabilityError::Internal(e.to_string()))
            }
            "delete" => {
                let ids: Vec<String> = serde_json::from_value(
                    payload.get("ids").cloned().unwrap_or(json!([])),
                )
                .map_err(|e| CapabilityError::Invalid {
                    message: format!("vector.delete ids: {}", e),
                })?;
                let count = store.delete(&collection, ids).await?;
                Ok(json!({ "deleted": count }))
            }
            "listCollections" => {
                let collections = store.list_collections().await?;
                Ok(json!(collections))
            }
            other => Err(CapabilityError::Unavailable {
                name: format!("vector.{}", other),
            }),
        }
    }

    fn secrets(&self) -> HashMap<String, String> {
        self.services.secrets.resolve(self.scope.tenant_id)
    }

    fn env(&self) -> HashMap<String, String> {
        self.services.env.clone()
    }

    fn variables(&self) -> Value {
        self.variables.clone()
    }

    fn log(&self, entry: LogEntry) {
        debug!(
            run_id = %self.scope.run_id,
            step_id = %self.scope.step_id,
            level = %entry.level,
            "{}",
            entry.message
        );
    }
}
