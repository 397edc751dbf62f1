// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Host capabilities exposed to block code.
//!
//! The sandbox never reaches the network or filesystem directly; every
//! side effect routes through a [`Capabilities`] implementation installed
//! for the duration of one step execution. Methods are async on the host
//! side but appear synchronous to JS (the interpreter thread blocks on
//! them).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Request shape accepted by `ctx.http.request`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpRequest {
    /// HTTP method (`GET`, `POST`, …).
    #[serde(default = "default_method")]
    pub method: String,
    /// Absolute URL.
    pub url: String,
    /// Request headers.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// JSON body, when present.
    #[serde(default)]
    pub body: Option<Value>,
    /// Per-call timeout override in milliseconds.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

fn default_method() -> String {
    "GET".to_string()
}

/// Response shape returned to JS from `ctx.http.*`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpResponse {
    /// Status code.
    pub status: u16,
    /// Status text (`OK`, `Not Found`, …).
    #[serde(rename = "statusText")]
    pub status_text: String,
    /// Response headers.
    pub headers: HashMap<String, String>,
    /// Parsed JSON body when the payload is JSON, raw string otherwise.
    pub body: Value,
}

/// A structured log line captured from `ctx.log`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    /// Log level (`debug`, `info`, `warn`, `error`).
    pub level: String,
    /// Message text.
    pub message: String,
    /// Optional structured payload.
    pub data: Option<Value>,
    /// Capture time.
    pub at: DateTime<Utc>,
}

/// Errors raised by capability implementations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CapabilityError {
    /// The HTTP call completed with a non-success status.
    #[error("HTTP {status}: {message}")]
    HttpStatus {
        /// Response status code.
        status: u16,
        /// Response body or status text.
        message: String,
    },

    /// The call exceeded its own timeout.
    #[error("capability call timed out")]
    Timeout,

    /// Egress policy refused the request (SSRF filter, scheme, …).
    #[error("request denied: {message}")]
    Denied {
        /// Why the request was refused.
        message: String,
    },

    /// A human-in-loop gate has no decision yet; the run must suspend.
    #[error("suspended on approval '{key}'")]
    Suspended {
        /// Approval key the resume event must resolve.
        key: String,
    },

    /// Provider-side failure with a classifiable code.
    #[error("[{code}] {message}")]
    Provider {
        /// Stable provider code (e.g. `GITHUB_002` style slugs).
        code: String,
        /// Human-readable description.
        message: String,
    },

    /// The payload did not match what the capability expects.
    #[error("invalid capability payload: {message}")]
    Invalid {
        /// First violation found.
        message: String,
    },

    /// The capability is not wired in this context.
    #[error("capability not available: {name}")]
    Unavailable {
        /// Capability namespace (`llm`, `vector`, …).
        name: String,
    },

    /// Anything unexpected.
    #[error("capability error: {0}")]
    Internal(String),
}

/// Host surface bound to one step execution.
///
/// Implementations carry the run/step identity they need for usage
/// accounting and approval keying; the sandbox only dispatches.
#[async_trait]
pub trait Capabilities: Send + Sync {
    /// `ctx.http.*` — egress-filtered HTTP.
    async fn http(&self, request: HttpRequest) -> Result<HttpResponse, CapabilityError>;

    /// `ctx.llm.chat` / `ctx.llm.complete`.
    async fn llm(
        &self,
        method: &str,
        provider: &str,
        model: &str,
        request: Value,
    ) -> Result<Value, CapabilityError>;

    /// `ctx.workflow.run` — sub-workflow invocation.
    async fn workflow_run(
        &self,
        project_id: &str,
        start_step_id: Option<&str>,
        input: Value,
    ) -> Result<Value, CapabilityError>;

    /// `ctx.human.requestApproval` — returns the decision, or
    /// [`CapabilityError::Suspended`] when none exists yet.
    async fn approval(&self, request: Value) -> Result<Value, CapabilityError>;

    /// `ctx.adapter.call`.
    async fn adapter(
        &self,
        name: &str,
        method: &str,
        payload: Value,
    ) -> Result<Value, CapabilityError>;

    /// `ctx.adapter.list`.
    async fn adapter_list(&self) -> Result<Value, CapabilityError>;

    /// `ctx.embedding.embed`.
    async fn embed(&self, request: Value) -> Result<Value, CapabilityError>;

    /// `ctx.vector.{upsert,query,delete,listCollections}`.
    async fn vector(&self, method: &str, payload: Value) -> Result<Value, CapabilityError>;

    /// Read-only secret map for `ctx.secrets`. Resolved per execution.
    fn secrets(&self) -> HashMap<String, String>;

    /// Read-only environment map for `ctx.env`.
    fn env(&self) -> HashMap<String, String>;

    /// Project variables for `ctx.variables`.
    fn variables(&self) -> Value {
        Value::Object(serde_json::Map::new())
    }

    /// `ctx.log` — appended to the step run.
    fn log(&self, entry: LogEntry);
}

/// Capabilities implementation with nothing wired.
///
/// Every call fails with [`CapabilityError::Unavailable`]; logs are
/// retained for inspection. Used by pure-transform snippets and tests.
#[derive(Default)]
pub struct NullCapabilities {
    logs: parking_lot::Mutex<Vec<LogEntry>>,
}

impl NullCapabilities {
    /// Creates an empty instance.
    pub fn new() -> Self {
        Self::default()
    }

    /// Log lines captured so far.
    pub fn logs(&self) -> Vec<LogEntry> {
        self.logs.lock().clone()
    }
}

#[async_trait]
impl Capabilities for NullCapabilities {
    async fn http(&self, _request: HttpRequest) -> Result<HttpResponse, CapabilityError> {
        Err(CapabilityError::Unavailable { name: "http".into() })
    }

    async fn llm(
        &self,
        _method: &str,
        _provider: &str,
        _model: &str,
        _request: Value,
    ) -> Result<Value, CapabilityError> {
        Err(CapabilityError::Unavailable { name: "llm".into() })
    }

    async fn workflow_run(
        &self,
        _project_id: &str,
        _start_step_id: Option<&str>,
        _input: Value,
    ) -> Result<Value, CapabilityError> {
        Err(CapabilityError::Unavailable {
            name: "workflow".into(),
        })
    }

    async fn approval(&self, _request: Value) -> Result<Value, CapabilityError> {
        Err(CapabilityError::Unavailable {
            name: "human".into(),
        })
    }

    async fn adapter(
        &self,
        _name: &str,
        _method: &str,
        _payload: Value,
    ) -> Result<Value, CapabilityError> {
        Err(CapabilityError::Unavailable {
            name: "adapter".into(),
        })
    }

    async fn adapter_list(&self) -> Result<Value, CapabilityError> {
        Err(CapabilityError::Unavailable {
            name: "adapter".into(),
        })
    }

    async fn embed(&self, _request: Value) -> Result<Value, CapabilityError> {
        Err(CapabilityError::Unavailable {
            name: "embedding".into(),
        })
    }

    async fn vector(&self, _method: &str, _payload: Value) -> Result<Value, CapabilityError> {
        Err(CapabilityError::Unavailable {
            name: "vector".into(),
        })
    }

    fn secrets(&self) -> HashMap<String, String> {
        HashMap::new()
    }

    fn env(&self) -> HashMap<String, String> {
        HashMap::new()
    }

    fn log(&self, entry: LogEntry) {
        self.logs.lock().push(entry);
    }
}
