// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! JavaScript preamble injected ahead of every snippet.
//!
//! Builds the `ctx` capability object over the `__host_call` bridge,
//! installs the pure helpers (`getPath`, `renderTemplate`, `evaluate`),
//! and neuters `eval` / `Function` before user code runs. The helper
//! grammar mirrors the host-side evaluator exactly.

/// Preamble source. Expects the runtime to have defined `__host_call`,
/// `__host_log`, and the `__*_json` globals before evaluation.
pub const PREAMBLE: &str = r#"
"use strict";

var __input = JSON.parse(__input_json);
var __config = JSON.parse(__config_json);
var __output = JSON.parse(__output_json);
var __secrets = JSON.parse(__secrets_json);
var __env = JSON.parse(__env_json);
var __variables = JSON.parse(__variables_json);

function __invoke(ns, method, payload) {
    var raw = __host_call(ns, method, JSON.stringify(payload === undefined ? null : payload));
    var envl = JSON.parse(raw);
    if (!envl.ok) {
        var msg = envl.code ? "[" + envl.code + "] " + envl.message : envl.message;
        throw new Error(msg);
    }
    return envl.value;
}

function getPath(obj, path) {
    if (path === undefined || path === null) return undefined;
    var p = String(path).trim();
    if (p === "") return undefined;
    if (p === "$") return obj;
    if (p.charAt(0) === "$") {
        p = p.slice(1);
    } else {
        p = "." + p;
    }
    var cur = obj;
    var re = /\.([A-Za-z_][A-Za-z0-9_]*)|\[(\d+)\]/g;
    var m, consumed = 0;
    while ((m = re.exec(p)) !== null) {
        if (m.index !== consumed) return undefined;
        consumed = re.lastIndex;
        if (cur === undefined || cur === null) return undefined;
        cur = m[1] !== undefined ? cur[m[1]] : cur[Number(m[2])];
    }
    if (consumed !== p.length) return undefined;
    return cur;
}

function renderTemplate(str, data) {
    return String(str).replace(/\{\{\s*([^}]*?)\s*\}\}/g, function (_, expr) {
        var v = getPath(data, expr);
        if (v === undefined || v === null) return "";
        return typeof v === "object" ? JSON.stringify(v) : String(v);
    });
}

function __literal(raw) {
    if (raw === "true") return true;
    if (raw === "false") return false;
    if (raw === "null") return null;
    if (raw.length >= 2 && (raw.charAt(0) === '"' || raw.charAt(0) === "'")) {
        return raw.slice(1, -1);
    }
    var n = Number(raw);
    return isNaN(n) ? raw : n;
}

function evaluate(expr, data) {
    var e = String(expr === undefined || expr === null ? "" : expr).trim();
    if (e === "") return false;
    var ops = [">=", "<=", "==", "!=", ">", "<"];
    for (var i = 0; i < ops.length; i++) {
        var idx = e.indexOf(ops[i]);
        if (idx !== -1) {
            var left = getPath(data, e.slice(0, idx).trim());
            var right = __literal(e.slice(idx + ops[i].length).trim());
            switch (ops[i]) {
                case "==": return left === right;
                case "!=": return left !== right;
                case ">": return left > right;
                case "<": return left < right;
                case ">=": return left >= right;
                case "<=": return left <= right;
            }
        }
    }
    return !!getPath(data, e);
}

var ctx = {
    http: {
        get: function (url, options) {
            return __invoke("http", "request", Object.assign({ method: "GET", url: url }, options || {}));
        },
        post: function (url, body, options) {
            return __invoke("http", "request", Object.assign({ method: "POST", url: url, body: body }, options || {}));
        },
        put: function (url, body, options) {
            return __invoke("http", "request", Object.assign({ method: "PUT", url: url, body: body }, options || {}));
        },
        delete: function (url, options) {
            return __invoke("http", "request", Object.assign({ method: "DELETE", url: url }, options || {}));
        },
        request: function (options) {
            return __invoke("http", "request", options || {});
        }
    },
    llm: {
        chat: function (provider, model, request) {
            return __invoke("llm", "chat", { provider: provider, model: model, request: request });
        },
        complete: function (provider, model, request) {
            return __invoke("llm", "complete", { provider: provider, model: model, request: request });
        }
    },
    workflow: {
        run: function (projectId, input, startStepId) {
            return __invoke("workflow", "run", {
                project_id: projectId,
                input: input === undefined ? null : input,
                start_step_id: startStepId === undefined ? null : startStepId
            });
        }
    },
    human: {
        requestApproval: function (request) {
            return __invoke("human", "requestApproval", request || {});
        }
    },
    adapter: {
        call: function (name, method, payload) {
            return __invoke("adapter", "call", { name: name, method: method, payload: payload === undefined ? null : payload });
        },
        list: function () {
            return __invoke("adapter", "list", null);
        }
    },
    embedding: {
        embed: function (request) {
            return __invoke("embedding", "embed", request);
        }
    },
    vector: {
        upsert: function (payload) { return __invoke("vector", "upsert", payload); },
        query: function (payload) { return __invoke("vector", "query", payload); },
        delete: function (payload) { return __invoke("vector", "delete", payload); },
        listCollections: function () { return __invoke("vector", "listCollections", null); }
    },
    secrets: __secrets,
    env: __env,
    variables: __variables,
    log: function (level, message, data) {
        __host_log(String(level), String(message), data === undefined ? "null" : JSON.stringify(data));
    }
};

Object.freeze(ctx.secrets);
Object.freeze(ctx.env);
Object.freeze(ctx.http);
Object.freeze(ctx.llm);
Object.freeze(ctx.workflow);
Object.freeze(ctx.human);
Object.freeze(ctx.adapter);
Object.freeze(ctx.embedding);
Object.freeze(ctx.vector);
Object.freeze(ctx);

(function () {
    var proto = Object.getPrototypeOf(function () {});
    try {
        Object.defineProperty(proto, "constructor", { value: undefined });
    } catch (e) {}
})();
globalThis.eval = undefined;
globalThis.Function = undefined;
"#;

/// Wraps a user snippet so `input`, `config`, `ctx`, and `output` (the
/// prior stage's result, for post-process chains) are in scope and the
/// return value comes back as a JSON string.
pub fn harness(code: &str) -> String {
    format!(
        "(function () {{\n\
         var __r = (function (input, config, ctx, output) {{\n{}\n}})(__input, __config, ctx, __output);\n\
         if (__r === undefined) __r = null;\n\
         return JSON.stringify(__r);\n\
         }})()",
        code
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_harness_wraps_return() {
        let js = harness("return input;");
        assert!(js.contains("return input;"));
        assert!(js.contains("JSON.stringify"));
    }
}
