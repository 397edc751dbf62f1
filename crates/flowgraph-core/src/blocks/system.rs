// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The system block library.
//!
//! One block definition per built-in step type, registered at startup.
//! Snippets are written against the sandbox `ctx` surface and the helper
//! preamble (`getPath`, `evaluate`). The `wait` block is resolved like
//! any other but its execution is serviced natively by the step executor
//! so long waits can suspend instead of holding a worker.

use crate::model::{BlockDefinition, ErrorCodeSpec};
use serde_json::json;
use std::collections::HashMap;

const START_CODE: &str = "return input;";

const CODE_CODE: &str = "return input;";

const LLM_CODE: &str = r#"
var request = {
    messages: config.messages || [{ role: "user", content: config.prompt || "" }],
    system: config.system,
    temperature: config.temperature,
    max_tokens: config.max_tokens
};
var method = config.method === "complete" ? "complete" : "chat";
var response = method === "complete"
    ? ctx.llm.complete(config.provider, config.model, request)
    : ctx.llm.chat(config.provider, config.model, request);
return { content: response.content, usage: response.usage };
"#;

// Request fields assembled by an inheriting block's pre-process chain
// arrive on `input` and take precedence over step config.
const HTTP_CODE: &str = r#"
var fromInput = (typeof input === "object" && input !== null && !Array.isArray(input))
    ? input
    : {};
var request = {
    method: fromInput.method || config.method || "GET",
    url: fromInput.url || config.url,
    headers: Object.assign({}, config.headers || {}, fromInput.headers || {}),
    body: fromInput.body !== undefined ? fromInput.body : config.body,
    timeout_ms: fromInput.timeout_ms || config.timeout_ms
};
var response = ctx.http.request(request);
if (response.status >= 400) {
    throw new Error("[HTTP_" + response.status + "] request to " + request.url +
        " failed: " + response.statusText);
}
return response;
"#;

const CONDITION_CODE: &str = r#"
var passed = evaluate(config.expression || "", input);
var base = (typeof input === "object" && input !== null && !Array.isArray(input))
    ? input
    : { value: input };
return Object.assign({}, base, { __branch: passed ? "then" : "else" });
"#;

const SWITCH_CODE: &str = r#"
var base = (typeof input === "object" && input !== null && !Array.isArray(input))
    ? input
    : { value: input };
var actual = getPath(input, config.path || "$");
var cases = config.cases || [];
for (var i = 0; i < cases.length; i++) {
    var entry = cases[i];
    var matched = entry.expression !== undefined
        ? evaluate(entry.expression, input)
        : actual === entry.value;
    if (matched) {
        return Object.assign({}, base, { __branch: entry.port || ("case_" + i) });
    }
}
return Object.assign({}, base, { __branch: config.default_port || "default" });
"#;

const ROUTER_CODE: &str = r#"
var base = (typeof input === "object" && input !== null && !Array.isArray(input))
    ? input
    : { value: input };
var rules = config.rules || [];
for (var i = 0; i < rules.length; i++) {
    if (evaluate(rules[i].when || "", input)) {
        return Object.assign({}, base, { __branch: rules[i].port });
    }
}
return Object.assign({}, base, { __branch: config.default_port || "default" });
"#;

const MAP_CODE: &str = r#"
var mappings = config.mappings || {};
var out = {};
for (var key in mappings) {
    out[key] = getPath(input, mappings[key]);
}
return out;
"#;

const SUBFLOW_CODE: &str = r#"
var payload = config.input !== undefined ? config.input : input;
return ctx.workflow.run(config.project_id, payload, config.start_step_id);
"#;

const WAIT_CODE: &str = "return input;";

const HUMAN_IN_LOOP_CODE: &str = r#"
var decision = ctx.human.requestApproval({
    prompt: config.prompt || "Approval required",
    data: input
});
return {
    approved: decision.approved,
    comment: decision.comment,
    data: decision.data,
    input: input
};
"#;

fn retryable(description: &str) -> ErrorCodeSpec {
    ErrorCodeSpec {
        retryable: true,
        description: Some(description.to_string()),
    }
}

fn http_error_codes() -> HashMap<String, ErrorCodeSpec> {
    let mut codes = HashMap::new();
    codes.insert("HTTP_408".into(), retryable("request timeout"));
    codes.insert("HTTP_429".into(), retryable("rate limited"));
    codes.insert("HTTP_500".into(), retryable("server error"));
    codes.insert("HTTP_502".into(), retryable("bad gateway"));
    codes.insert("HTTP_503".into(), retryable("service unavailable"));
    codes.insert("HTTP_504".into(), retryable("gateway timeout"));
    codes.insert("TIMEOUT".into(), retryable("call timed out"));
    codes.insert("NETWORK_ERROR".into(), retryable("transport failure"));
    codes
}

/// Builds the system block set registered at startup.
pub fn system_blocks() -> Vec<BlockDefinition> {
    let mut blocks = Vec::new();

    let mut start = BlockDefinition::with_code("start", START_CODE);
    start.is_system = true;
    blocks.push(start);

    let mut code = BlockDefinition::with_code("code", CODE_CODE);
    code.is_system = true;
    code.config_schema = Some(json!({
        "type": "object",
        "properties": {
            "source": { "type": "string" }
        }
    }));
    blocks.push(code);

    let mut llm = BlockDefinition::with_code("llm", LLM_CODE);
    llm.is_system = true;
    llm.config_schema = Some(json!({
        "type": "object",
        "required": ["provider", "model"],
        "properties": {
            "provider": { "type": "string" },
            "model": { "type": "string" },
            "prompt": { "type": "string" },
            "system": { "type": "string" },
            "messages": { "type": "array" },
            "method": { "enum": ["chat", "complete"] },
            "temperature": { "type": "number" },
            "max_tokens": { "type": "integer" }
        }
    }));
    llm.error_codes = {
        let mut codes = HashMap::new();
        codes.insert("HTTP_429".into(), retryable("provider rate limited"));
        codes.insert("TIMEOUT".into(), retryable("provider timed out"));
        codes
    };
    blocks.push(llm);

    let mut http = BlockDefinition::with_code("http", HTTP_CODE);
    http.is_system = true;
    http.config_schema = Some(json!({
        "type": "object",
        "required": ["url"],
        "properties": {
            "url": { "type": "string" },
            "method": { "enum": ["GET", "POST", "PUT", "DELETE", "PATCH", "HEAD"] },
            "headers": { "type": "object" },
            "timeout_ms": { "type": "integer", "minimum": 1 }
        }
    }));
    http.config_defaults = json!({ "method": "GET" });
    http.error_codes = http_error_codes();
    blocks.push(http);

    let mut condition = BlockDefinition::with_code("condition", CONDITION_CODE);
    condition.is_system = true;
    condition.config_schema = Some(json!({
        "type": "object",
        "required": ["expression"],
        "properties": { "expression": { "type": "string" } }
    }));
    blocks.push(condition);

    let mut switch_block = BlockDefinition::with_code("switch", SWITCH_CODE);
    switch_block.is_system = true;
    switch_block.config_schema = Some(json!({
        "type": "object",
        "properties": {
            "path": { "type": "string" },
            "cases": { "type": "array" },
            "default_port": { "type": "string" }
        }
    }));
    blocks.push(switch_block);

    let mut router = BlockDefinition::with_code("router", ROUTER_CODE);
    router.is_system = true;
    router.config_schema = Some(json!({
        "type": "object",
        "properties": {
            "rules": { "type": "array" },
            "default_port": { "type": "string" }
        }
    }));
    blocks.push(router);

    let mut map = BlockDefinition::with_code("map", MAP_CODE);
    map.is_system = true;
    map.config_schema = Some(json!({
        "type": "object",
        "properties": { "mappings": { "type": "object" } }
    }));
    blocks.push(map);

    let mut subflow = BlockDefinition::with_code("subflow", SUBFLOW_CODE);
    subflow.is_system = true;
    subflow.config_schema = Some(json!({
        "type": "object",
        "required": ["project_id"],
        "properties": {
            "project_id": { "type": "string" },
            "start_step_id": { "type": "string" },
            "input": {}
        }
    }));
    blocks.push(subflow);

    let mut wait = BlockDefinition::with_code("wait", WAIT_CODE);
    wait.is_system = true;
    wait.config_schema = Some(json!({
        "type": "object",
        "required": ["duration_ms"],
        "properties": { "duration_ms": { "type": "integer", "minimum": 0 } }
    }));
    blocks.push(wait);

    let mut human = BlockDefinition::with_code("human_in_loop", HUMAN_IN_LOOP_CODE);
    human.is_system = true;
    human.config_schema = Some(json!({
        "type": "object",
        "properties": { "prompt": { "type": "string" } }
    }));
    blocks.push(human);

    blocks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocks::BlockRegistry;

    #[test]
    fn test_system_library_resolves() {
        let registry = BlockRegistry::load(system_blocks(), 50).unwrap();
        for slug in [
            "start",
            "code",
            "llm",
            "http",
            "condition",
            "switch",
            "router",
            "map",
            "subflow",
            "wait",
            "human_in_loop",
        ] {
            let block = registry.get_by_slug(slug).unwrap();
            assert!(block.definition.is_system, "{} must be a system block", slug);
            assert!(!block.resolved_code.is_empty(), "{} must resolve code", slug);
        }
    }

    #[test]
    fn test_http_retryable_codes() {
        let registry = BlockRegistry::load(system_blocks(), 50).unwrap();
        let http = registry.get_by_slug("http").unwrap();
        assert!(http.is_retryable_code("HTTP_429"));
        assert!(http.is_retryable_code("HTTP_503"));
        assert!(!http.is_retryable_code("HTTP_404"));
    }

    #[test]
    fn test_no_loop_or_join_blocks() {
        let registry = BlockRegistry::load(system_blocks(), 50).unwrap();
        assert!(registry.get_by_slug("loop").is_err());
        assert!(registry.get_by_slug("join").is_err());
    }
}
