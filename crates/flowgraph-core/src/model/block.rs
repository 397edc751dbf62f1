// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Block definitions: reusable execution templates with inheritance.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

/// Classification entry for a provider-style error code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorCodeSpec {
    /// Whether the step executor may retry after this code.
    pub retryable: bool,
    /// Operator-facing description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A reusable unit of execution: JS code plus schemas, optionally
/// inheriting from a parent block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockDefinition {
    /// Block identity.
    pub id: Uuid,
    /// Owning tenant; `None` for system blocks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<Uuid>,
    /// Stable slug steps resolve by.
    pub slug: String,
    /// Root snippet. May be empty only when inherited from an ancestor.
    #[serde(default)]
    pub code: String,
    /// Input transform prepended to the execution chain.
    #[serde(default)]
    pub pre_process: String,
    /// Output transform appended to the execution chain.
    #[serde(default)]
    pub post_process: String,
    /// JSON Schema for step config.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_schema: Option<Value>,
    /// JSON Schema for step input.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
    /// JSON Schema for step output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
    /// Editor presentation hints; opaque to the engine.
    #[serde(default)]
    pub ui_config: Value,
    /// Whether the block ships with the platform.
    #[serde(default)]
    pub is_system: bool,
    /// Definition version.
    #[serde(default)]
    pub version: u32,
    /// Parent in the inheritance graph.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_block_id: Option<Uuid>,
    /// Config defaults merged along the inheritance chain.
    #[serde(default)]
    pub config_defaults: Value,
    /// Error-code classification table.
    #[serde(default)]
    pub error_codes: HashMap<String, ErrorCodeSpec>,
    /// Composite sub-steps; opaque to the resolver.
    #[serde(default)]
    pub internal_steps: Vec<Value>,
}

impl BlockDefinition {
    /// Minimal block with a slug and code; used by tests and the system
    /// library builder.
    pub fn with_code(slug: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id: None,
            slug: slug.into(),
            code: code.into(),
            pre_process: String::new(),
            post_process: String::new(),
            config_schema: None,
            input_schema: None,
            output_schema: None,
            ui_config: Value::Null,
            is_system: false,
            version: 1,
            parent_block_id: None,
            config_defaults: Value::Object(serde_json::Map::new()),
            error_codes: HashMap::new(),
            internal_steps: Vec::new(),
        }
    }
}

/// A block with its inheritance chain folded in. Derived by the
/// resolver; never user-edited, never re-walked at execution time.
#[derive(Debug, Clone)]
pub struct ResolvedBlock {
    /// The leaf definition this resolution is for.
    pub definition: BlockDefinition,
    /// Code of the nearest ancestor (inclusive) with non-empty code.
    pub resolved_code: String,
    /// Config defaults deep-merged root→child, children overriding.
    pub resolved_config_defaults: Value,
    /// Pre-process snippets, child first, ending at the root.
    pub pre_process_chain: Vec<String>,
    /// Post-process snippets, root first, ending at the child.
    pub post_process_chain: Vec<String>,
    /// Error-code table merged root→child, children overriding.
    pub error_codes: HashMap<String, ErrorCodeSpec>,
    /// Distance from the root (root = 1).
    pub depth: usize,
}

impl ResolvedBlock {
    /// Whether the raised `code` is declared retryable by this block.
    pub fn is_retryable_code(&self, code: &str) -> bool {
        self.error_codes
            .get(code)
            .map(|spec| spec.retryable)
            .unwrap_or(false)
    }
}
