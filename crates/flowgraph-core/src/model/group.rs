// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Block groups: structural containers for control flow.
//!
//! Group config is stored as opaque JSON on the definition and parsed
//! into the typed per-variant structs by the group executor, with serde
//! defaults supplying the documented fallbacks.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Control-flow construct implemented by a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupType {
    /// Independent components fan out concurrently.
    Parallel,
    /// Body re-executes on failure; final failure exits `error`.
    TryCatch,
    /// Body runs once per element of an input array.
    Foreach,
    /// Body repeats while a condition holds.
    While,
}

/// A structural container for a control-flow construct.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockGroup {
    /// Group identity.
    pub id: Uuid,
    /// Owning project.
    pub project_id: Uuid,
    /// Display name; used as the group's key in run output.
    pub name: String,
    /// Control-flow variant.
    #[serde(rename = "type")]
    pub group_type: GroupType,
    /// Variant-specific config (see the typed structs below).
    #[serde(default)]
    pub config: Value,
    /// Enclosing group for nested control flow.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_group_id: Option<Uuid>,
    /// Snippet run against the group input before the body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_process: Option<String>,
    /// Snippet run against the body output before the group exits.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_process: Option<String>,
}

/// `parallel` group config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParallelConfig {
    /// Concurrency bound across components; 0 means unbounded.
    #[serde(default)]
    pub max_concurrent: usize,
    /// Cancel outstanding components on the first failure.
    #[serde(default)]
    pub fail_fast: bool,
}

/// `try_catch` group config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TryCatchConfig {
    /// Additional body executions after the first failure.
    #[serde(default)]
    pub retry_count: u32,
    /// Delay between body executions.
    #[serde(default)]
    pub retry_delay_ms: u64,
}

/// `foreach` group config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForeachConfig {
    /// Path of the array to iterate inside the group input.
    #[serde(default = "default_input_path")]
    pub input_path: String,
    /// Run iterations concurrently.
    #[serde(default)]
    pub parallel: bool,
    /// Concurrency bound when `parallel` is set.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
}

fn default_input_path() -> String {
    "$.items".to_string()
}

fn default_max_workers() -> usize {
    4
}

/// `while` group config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhileConfig {
    /// Condition evaluated against the current iteration input.
    #[serde(default)]
    pub condition: String,
    /// Hard iteration cap; hitting it routes to the `error` port.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Run the body once before the first condition check.
    #[serde(default)]
    pub do_while: bool,
}

fn default_max_iterations() -> u32 {
    100
}
