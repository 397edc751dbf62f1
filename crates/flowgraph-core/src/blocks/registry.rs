// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Block registry and inheritance resolver.
//!
//! Loads block definitions, orders the inheritance graph with Kahn's
//! algorithm (parents before children), and precomputes each block's
//! resolved code, merged config defaults, and pre/post chains. Resolution
//! happens once at load; execution never re-walks the graph.

use crate::error::{EngineError, Result};
use crate::expr::deep_merge;
use crate::model::{BlockDefinition, ResolvedBlock, Step};
use flowgraph_sandbox::validate_snippet;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Resolved, immutable view over a set of block definitions.
#[derive(Debug)]
pub struct BlockRegistry {
    blocks: HashMap<Uuid, ResolvedBlock>,
    by_slug: HashMap<String, Uuid>,
    config_validators: HashMap<Uuid, jsonschema::Validator>,
    input_validators: HashMap<Uuid, jsonschema::Validator>,
}

impl BlockRegistry {
    /// Loads and resolves definitions.
    ///
    /// Rejects cycles (`CIRCULAR_INHERITANCE`), chains deeper than
    /// `max_depth` (`DEPTH_EXCEEDED`), snippets containing `await` /
    /// `async`, rootless chains, and invalid JSON Schemas.
    pub fn load(definitions: Vec<BlockDefinition>, max_depth: usize) -> Result<Self> {
        let mut by_id: HashMap<Uuid, BlockDefinition> = HashMap::new();
        for def in definitions {
            validate_definition(&def)?;
            by_id.insert(def.id, def);
        }

        // Kahn over parent→child edges: a block resolves only after its
        // parent's resolved fields are known.
        let mut children: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
        let mut queue: VecDeque<Uuid> = VecDeque::new();
        for def in by_id.values() {
            match def.parent_block_id {
                Some(parent) => {
                    if !by_id.contains_key(&parent) {
                        return Err(EngineError::NotFound {
                            entity: "block",
                            id: parent.to_string(),
                        });
                    }
                    children.entry(parent).or_default().push(def.id);
                }
                None => queue.push_back(def.id),
            }
        }

        let mut blocks: HashMap<Uuid, ResolvedBlock> = HashMap::new();
        let mut by_slug: HashMap<String, Uuid> = HashMap::new();

        while let Some(id) = queue.pop_front() {
            let def = by_id.get(&id).cloned().ok_or(EngineError::NotFound {
                entity: "block",
                id: id.to_string(),
            })?;
            let parent = def
                .parent_block_id
                .and_then(|pid| blocks.get(&pid));

            let resolved = resolve_one(&def, parent)?;
            if resolved.depth > max_depth {
                return Err(EngineError::DepthExceeded {
                    slug: def.slug.clone(),
                    depth: resolved.depth,
                    max: max_depth,
                });
            }

            by_slug.insert(def.slug.clone(), def.id);
            blocks.insert(def.id, resolved);
            for child in children.get(&id).into_iter().flatten() {
                queue.push_back(*child);
            }
        }

        if blocks.len() != by_id.len() {
            // Whatever never drained sits on a cycle.
            let on_cycle = by_id
                .values()
                .find(|d| !blocks.contains_key(&d.id))
                .map(|d| d.slug.clone())
                .unwrap_or_default();
            return Err(EngineError::CircularInheritance { slug: on_cycle });
        }

        let mut config_validators = HashMap::new();
        let mut input_validators = HashMap::new();
        for (id, resolved) in &blocks {
            if let Some(schema) = &resolved.definition.config_schema {
                config_validators.insert(*id, compile_schema(&resolved.definition.slug, schema)?);
            }
            if let Some(schema) = &resolved.definition.input_schema {
                input_validators.insert(*id, compile_schema(&resolved.definition.slug, schema)?);
            }
        }

        info!(blocks = blocks.len(), "block registry resolved");
        Ok(Self {
            blocks,
            by_slug,
            config_validators,
            input_validators,
        })
    }

    /// Resolved block by id.
    pub fn get(&self, id: Uuid) -> Result<&ResolvedBlock> {
        self.blocks.get(&id).ok_or(EngineError::NotFound {
            entity: "block",
            id: id.to_string(),
        })
    }

    /// Resolved block by slug.
    pub fn get_by_slug(&self, slug: &str) -> Result<&ResolvedBlock> {
        let id = self.by_slug.get(slug).ok_or(EngineError::NotFound {
            entity: "block",
            id: slug.to_string(),
        })?;
        self.get(*id)
    }

    /// Resolves the block a step executes: explicit binding first, then
    /// the step type's system slug.
    pub fn resolve_for_step(&self, step: &Step) -> Result<&ResolvedBlock> {
        match step.block_definition_id {
            Some(id) => self.get(id),
            None => self.get_by_slug(step.step_type.slug()),
        }
    }

    /// Validates an effective config against the block's `config_schema`.
    pub fn validate_config(&self, block_id: Uuid, config: &Value) -> Result<()> {
        if let Some(validator) = self.config_validators.get(&block_id) {
            validator
                .validate(config)
                .map_err(|err| EngineError::SchemaValidation {
                    message: format!("config: {}", err),
                })?;
        }
        Ok(())
    }

    /// Validates a payload against the block's `input_schema`.
    pub fn validate_input(&self, block_id: Uuid, input: &Value) -> Result<()> {
        if let Some(validator) = self.input_validators.get(&block_id) {
            validator
                .validate(input)
                .map_err(|err| EngineError::SchemaValidation {
                    message: format!("input: {}", err),
                })?;
        }
        Ok(())
    }

    /// Number of resolved blocks.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

fn validate_definition(def: &BlockDefinition) -> Result<()> {
    for (label, snippet) in [
        ("code", &def.code),
        ("pre_process", &def.pre_process),
        ("post_process", &def.post_process),
    ] {
        if !snippet.is_empty() {
            validate_snippet(snippet).map_err(|err| {
                EngineError::validation(format!("block '{}' {}: {}", def.slug, label, err))
            })?;
        }
    }
    Ok(())
}

fn resolve_one(def: &BlockDefinition, parent: Option<&ResolvedBlock>) -> Result<ResolvedBlock> {
    let (resolved_code, base_defaults, parent_pre, parent_post, parent_codes, depth) = match parent
    {
        Some(p) => (
            if def.code.is_empty() {
                p.resolved_code.clone()
            } else {
                def.code.clone()
            },
            p.resolved_config_defaults.clone(),
            p.pre_process_chain.clone(),
            p.post_process_chain.clone(),
            p.error_codes.clone(),
            p.depth + 1,
        ),
        None => {
            if def.code.is_empty() {
                return Err(EngineError::validation(format!(
                    "root block '{}' has no code",
                    def.slug
                )));
            }
            (
                def.code.clone(),
                Value::Object(serde_json::Map::new()),
                Vec::new(),
                Vec::new(),
                HashMap::new(),
                1,
            )
        }
    };

    // Child defaults override ancestors'.
    let resolved_config_defaults = deep_merge(&base_defaults, &def.config_defaults);

    // Pre chain runs child→root, post chain root→child.
    let mut pre_process_chain = Vec::with_capacity(parent_pre.len() + 1);
    if !def.pre_process.is_empty() {
        pre_process_chain.push(def.pre_process.clone());
    }
    pre_process_chain.extend(parent_pre);

    let mut post_process_chain = parent_post;
    if !def.post_process.is_empty() {
        post_process_chain.push(def.post_process.clone());
    }

    let mut error_codes = parent_codes;
    for (code, spec) in &def.error_codes {
        error_codes.insert(code.clone(), spec.clone());
    }

    debug!(slug = %def.slug, depth, "resolved block");
    Ok(ResolvedBlock {
        definition: def.clone(),
        resolved_code,
        resolved_config_defaults,
        pre_process_chain,
        post_process_chain,
        error_codes,
        depth,
    })
}

fn compile_schema(slug: &str, schema: &Value) -> Result<jsonschema::Validator> {
    jsonschema::validator_for(schema).map_err(|err| {
        EngineError::validation(format!("block '{}' has an invalid schema: {}", slug, err))
    })
}

/// Copy-on-write handle: readers clone the current `Arc`, definition
/// changes swap in a freshly resolved registry.
#[derive(Clone)]
pub struct SharedRegistry {
    inner: Arc<RwLock<Arc<BlockRegistry>>>,
}

impl SharedRegistry {
    /// Wraps a resolved registry.
    pub fn new(registry: BlockRegistry) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(registry))),
        }
    }

    /// Current registry snapshot.
    pub fn current(&self) -> Arc<BlockRegistry> {
        self.inner.read().clone()
    }

    /// Replaces the registry after a definition change.
    pub fn swap(&self, registry: BlockRegistry) {
        *self.inner.write() = Arc::new(registry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ErrorCodeSpec;
    use serde_json::json;

    fn chain() -> Vec<BlockDefinition> {
        let mut http = BlockDefinition::with_code("http", "return ctx.http.request(config);");
        http.config_defaults = json!({"timeout_ms": 30000});

        let mut rest = BlockDefinition::with_code("rest-api", "");
        rest.parent_block_id = Some(http.id);
        rest.pre_process = "input.headers = input.headers || {}; return input;".into();
        rest.config_defaults = json!({"headers": {"Accept": "application/json"}});

        let mut github = BlockDefinition::with_code("github-api", "");
        github.parent_block_id = Some(rest.id);
        github.config_defaults = json!({"base_url": "https://api.github.com", "timeout_ms": 10000});
        github.post_process = "return output;".into();

        vec![http, rest, github]
    }

    #[test]
    fn test_code_inherited_from_root() {
        let defs = chain();
        let registry = BlockRegistry::load(defs, 50).unwrap();
        let github = registry.get_by_slug("github-api").unwrap();
        assert_eq!(github.resolved_code, "return ctx.http.request(config);");
        assert_eq!(github.depth, 3);
    }

    #[test]
    fn test_defaults_merge_child_overrides() {
        let registry = BlockRegistry::load(chain(), 50).unwrap();
        let github = registry.get_by_slug("github-api").unwrap();
        let defaults = &github.resolved_config_defaults;
        assert_eq!(defaults["base_url"], "https://api.github.com");
        assert_eq!(defaults["timeout_ms"], 10000);
        assert_eq!(defaults["headers"]["Accept"], "application/json");
    }

    #[test]
    fn test_chain_orientation() {
        let mut root = BlockDefinition::with_code("root", "return input;");
        root.pre_process = "/* root pre */ return input;".into();
        root.post_process = "/* root post */ return output;".into();
        let mut child = BlockDefinition::with_code("child", "");
        child.parent_block_id = Some(root.id);
        child.pre_process = "/* child pre */ return input;".into();
        child.post_process = "/* child post */ return output;".into();

        let registry = BlockRegistry::load(vec![root, child], 50).unwrap();
        let resolved = registry.get_by_slug("child").unwrap();
        // Pre chain is child→root, post chain root→child.
        assert!(resolved.pre_process_chain[0].contains("child pre"));
        assert!(resolved.pre_process_chain[1].contains("root pre"));
        assert!(resolved.post_process_chain[0].contains("root post"));
        assert!(resolved.post_process_chain[1].contains("child post"));
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let defs = chain();
        let first = BlockRegistry::load(defs.clone(), 50).unwrap();
        let second = BlockRegistry::load(defs, 50).unwrap();
        let a = first.get_by_slug("github-api").unwrap();
        let b = second.get_by_slug("github-api").unwrap();
        assert_eq!(a.resolved_code, b.resolved_code);
        assert_eq!(a.resolved_config_defaults, b.resolved_config_defaults);
        assert_eq!(a.pre_process_chain, b.pre_process_chain);
        assert_eq!(a.post_process_chain, b.post_process_chain);
    }

    #[test]
    fn test_cycle_detected() {
        let mut a = BlockDefinition::with_code("a", "return input;");
        let mut b = BlockDefinition::with_code("b", "");
        a.parent_block_id = Some(b.id);
        b.parent_block_id = Some(a.id);
        let err = BlockRegistry::load(vec![a, b], 50).unwrap_err();
        assert_eq!(err.code(), "CIRCULAR_INHERITANCE");
    }

    #[test]
    fn test_depth_cap() {
        let mut defs = vec![BlockDefinition::with_code("b0", "return input;")];
        for i in 1..5 {
            let mut block = BlockDefinition::with_code(format!("b{}", i), "");
            block.parent_block_id = Some(defs[i - 1].id);
            defs.push(block);
        }
        assert!(BlockRegistry::load(defs.clone(), 5).is_ok());
        let err = BlockRegistry::load(defs, 4).unwrap_err();
        assert_eq!(err.code(), "DEPTH_EXCEEDED");
    }

    #[test]
    fn test_rootless_chain_rejected() {
        let root = BlockDefinition::with_code("empty-root", "");
        let err = BlockRegistry::load(vec![root], 50).unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[test]
    fn test_await_in_snippet_rejected() {
        let block =
            BlockDefinition::with_code("bad", "var r = await ctx.http.get('x'); return r;");
        assert!(BlockRegistry::load(vec![block], 50).is_err());
    }

    #[test]
    fn test_error_codes_merge() {
        let mut root = BlockDefinition::with_code("net", "return input;");
        root.error_codes.insert(
            "HTTP_429".into(),
            ErrorCodeSpec {
                retryable: true,
                description: None,
            },
        );
        let mut child = BlockDefinition::with_code("svc", "");
        child.parent_block_id = Some(root.id);
        child.error_codes.insert(
            "SVC_001".into(),
            ErrorCodeSpec {
                retryable: false,
                description: None,
            },
        );
        let registry = BlockRegistry::load(vec![root, child], 50).unwrap();
        let resolved = registry.get_by_slug("svc").unwrap();
        assert!(resolved.is_retryable_code("HTTP_429"));
        assert!(!resolved.is_retryable_code("SVC_001"));
        assert!(!resolved.is_retryable_code("UNKNOWN"));
    }

    #[test]
    fn test_config_schema_validation() {
        let mut block = BlockDefinition::with_code("typed", "return input;");
        block.config_schema = Some(json!({
            "type": "object",
            "required": ["url"],
            "properties": {"url": {"type": "string"}}
        }));
        let id = block.id;
        let registry = BlockRegistry::load(vec![block], 50).unwrap();
        assert!(registry.validate_config(id, &json!({"url": "https://x"})).is_ok());
        let err = registry.validate_config(id, &json!({})).unwrap_err();
        assert_eq!(err.code(), "SCHEMA_VALIDATION_ERROR");
    }
}
