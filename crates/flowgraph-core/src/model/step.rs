// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Steps and edges.

use crate::retry::RetryConfig;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Built-in step types, extensible through block slugs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum StepType {
    /// Run entry point; carries the trigger binding.
    Start,
    /// LLM call through `ctx.llm`.
    Llm,
    /// External tool / HTTP call.
    Tool,
    /// Boolean branch with `then` / `else` ports.
    Condition,
    /// Multi-way branch with `case_*` ports.
    Switch,
    /// Path-mapping transform.
    Map,
    /// Sub-workflow invocation.
    Subflow,
    /// Delay; short waits sleep in-process, long waits re-enqueue.
    Wait,
    /// Human approval gate.
    HumanInLoop,
    /// Free-form user JS.
    Code,
    /// Rule-table branch.
    Router,
    /// Any tenant-defined block slug.
    Custom(String),
}

impl StepType {
    /// The block slug this step type resolves to by default.
    pub fn slug(&self) -> &str {
        match self {
            Self::Start => "start",
            Self::Llm => "llm",
            Self::Tool => "http",
            Self::Condition => "condition",
            Self::Switch => "switch",
            Self::Map => "map",
            Self::Subflow => "subflow",
            Self::Wait => "wait",
            Self::HumanInLoop => "human_in_loop",
            Self::Code => "code",
            Self::Router => "router",
            Self::Custom(slug) => slug,
        }
    }

    /// Whether this type selects outgoing edges by port label.
    pub fn is_branching(&self) -> bool {
        matches!(self, Self::Condition | Self::Switch | Self::Router)
    }
}

impl From<String> for StepType {
    fn from(raw: String) -> Self {
        match raw.as_str() {
            "start" => Self::Start,
            "llm" => Self::Llm,
            "tool" | "http" => Self::Tool,
            "condition" => Self::Condition,
            "switch" => Self::Switch,
            "map" => Self::Map,
            "subflow" => Self::Subflow,
            "wait" => Self::Wait,
            "human_in_loop" => Self::HumanInLoop,
            "code" => Self::Code,
            "router" => Self::Router,
            _ => Self::Custom(raw),
        }
    }
}

impl From<StepType> for String {
    fn from(value: StepType) -> Self {
        match value {
            StepType::Tool => "tool".to_string(),
            other => other.slug().to_string(),
        }
    }
}

/// How runs originate at a start step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    /// Operator- or API-initiated.
    Manual,
    /// Cron schedule.
    Schedule,
    /// Signed webhook.
    Webhook,
}

/// Editor canvas position.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Horizontal coordinate.
    pub x: f64,
    /// Vertical coordinate.
    pub y: f64,
}

/// A node in the project DAG.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// Step identity.
    pub id: Uuid,
    /// Owning project.
    pub project_id: Uuid,
    /// Unique-per-project display name.
    pub name: String,
    /// Step type; drives block resolution and branch semantics.
    #[serde(rename = "type")]
    pub step_type: StepType,
    /// Block configuration; shape is the block's `config_schema`.
    #[serde(default)]
    pub config: Value,
    /// Trigger binding; present iff `type = start`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_type: Option<TriggerType>,
    /// Trigger-specific settings (webhook secret, input mapping, …).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_config: Option<Value>,
    /// Enclosing block group, when the step is a group body member.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_group_id: Option<Uuid>,
    /// Editor canvas position.
    #[serde(default)]
    pub position: Position,
    /// Explicit block binding; `type` resolves a system slug otherwise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_definition_id: Option<Uuid>,
    /// Step-level retry policy layered under the block's error codes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryConfig>,
    /// Per-step execution deadline override in milliseconds; the engine
    /// default applies when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// A directed connection between two steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    /// Edge identity.
    pub id: Uuid,
    /// Owning project.
    pub project_id: Uuid,
    /// Source step.
    pub source_step_id: Uuid,
    /// Target step.
    pub target_step_id: Uuid,
    /// Port label on the source (`then`, `else`, `case_k`, `out`,
    /// `error`). Unlabeled edges are always active.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_port: Option<String>,
    /// Optional guard expression evaluated against the source output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_type_round_trip() {
        for raw in [
            "start",
            "llm",
            "tool",
            "condition",
            "switch",
            "map",
            "subflow",
            "wait",
            "human_in_loop",
            "code",
            "router",
        ] {
            let t: StepType = serde_json::from_str(&format!("\"{}\"", raw)).unwrap();
            let back = serde_json::to_string(&t).unwrap();
            assert_eq!(back, format!("\"{}\"", raw));
        }
    }

    #[test]
    fn test_unknown_type_is_custom_slug() {
        let t: StepType = serde_json::from_str("\"github_create_issue\"").unwrap();
        assert_eq!(t, StepType::Custom("github_create_issue".into()));
        assert_eq!(t.slug(), "github_create_issue");
    }

    #[test]
    fn test_branching_types() {
        assert!(StepType::Condition.is_branching());
        assert!(StepType::Switch.is_branching());
        assert!(StepType::Router.is_branching());
        assert!(!StepType::Llm.is_branching());
    }
}
