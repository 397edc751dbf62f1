// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Expression and template evaluator.
//!
//! The closed grammar used by branch, switch, and while conditions and by
//! `{{…}}` config templates:
//!
//! ```text
//! path  := '$' ('.' IDENT | '[' INT ']')*
//! expr  := path (OP value)?        OP ∈ {==, !=, >, <, >=, <=}
//! value := string | number | true | false | null
//! ```
//!
//! A bare path evaluates to JS truthiness of the referenced value.
//! Template expansion replaces each `{{ expr }}` with the stringified
//! path result; missing keys render as the empty string. The evaluator is
//! pure and host-implemented so branch semantics stay auditable; the
//! sandbox preamble carries a JS mirror of the same grammar.

use crate::error::{EngineError, Result};
use serde_json::Value;
use std::cmp::Ordering;

/// Resolves a path against `data`.
///
/// Accepts the canonical `$`-rooted form (`$.a.b[0]`) and the bare form
/// used inside config templates (`input.x`, `ctx.variables.region`).
/// Returns `None` for malformed paths and missing keys alike.
pub fn get_path<'a>(data: &'a Value, path: &str) -> Option<&'a Value> {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed == "$" {
        return Some(data);
    }

    let rest = trimmed.strip_prefix('$').map(str::to_string).unwrap_or_else(|| {
        // Bare paths start mid-segment; normalize to the dotted form.
        format!(".{}", trimmed)
    });

    let mut current = data;
    let mut chars = rest.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '.' => {
                let mut ident = String::new();
                while let Some(&n) = chars.peek() {
                    if n.is_ascii_alphanumeric() || n == '_' {
                        ident.push(n);
                        chars.next();
                    } else {
                        break;
                    }
                }
                if ident.is_empty() || ident.chars().next().is_some_and(|f| f.is_ascii_digit()) {
                    return None;
                }
                current = current.get(ident.as_str())?;
            }
            '[' => {
                let mut digits = String::new();
                for n in chars.by_ref() {
                    if n == ']' {
                        break;
                    }
                    digits.push(n);
                }
                let index: usize = digits.parse().ok()?;
                current = current.get(index)?;
            }
            _ => return None,
        }
    }
    Some(current)
}

/// JS truthiness of a JSON value.
pub fn is_truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(_)) | Some(Value::Object(_)) => true,
    }
}

/// Right-hand-side literal of a comparison.
#[derive(Debug, Clone, PartialEq)]
enum Literal {
    Null,
    Bool(bool),
    Number(f64),
    Str(String),
}

fn parse_literal(raw: &str) -> Result<Literal> {
    let raw = raw.trim();
    match raw {
        "true" => return Ok(Literal::Bool(true)),
        "false" => return Ok(Literal::Bool(false)),
        "null" => return Ok(Literal::Null),
        _ => {}
    }
    if raw.len() >= 2 {
        let first = raw.chars().next().unwrap_or_default();
        let last = raw.chars().last().unwrap_or_default();
        if (first == '"' && last == '"') || (first == '\'' && last == '\'') {
            return Ok(Literal::Str(raw[1..raw.len() - 1].to_string()));
        }
    }
    raw.parse::<f64>()
        .map(Literal::Number)
        .map_err(|_| EngineError::validation(format!("invalid literal in expression: '{}'", raw)))
}

fn literal_eq(value: Option<&Value>, literal: &Literal) -> bool {
    match (value, literal) {
        (None, Literal::Null) | (Some(Value::Null), Literal::Null) => true,
        (Some(Value::Bool(a)), Literal::Bool(b)) => a == b,
        (Some(Value::Number(a)), Literal::Number(b)) => {
            a.as_f64().map(|f| f == *b).unwrap_or(false)
        }
        (Some(Value::String(a)), Literal::Str(b)) => a == b,
        _ => false,
    }
}

fn literal_cmp(value: Option<&Value>, literal: &Literal) -> Option<Ordering> {
    match (value, literal) {
        (Some(Value::Number(a)), Literal::Number(b)) => a.as_f64()?.partial_cmp(b),
        (Some(Value::String(a)), Literal::Str(b)) => Some(a.as_str().cmp(b.as_str())),
        _ => None,
    }
}

/// Evaluates a condition expression against `data`.
///
/// Returns `false` for missing paths; returns an error only for
/// syntactically invalid expressions.
pub fn evaluate(expr: &str, data: &Value) -> Result<bool> {
    let expr = expr.trim();
    if expr.is_empty() {
        return Ok(false);
    }

    // Two-character operators are checked first so `>=` never parses as
    // `>` with a leading `=` on the literal.
    for op in [">=", "<=", "==", "!=", ">", "<"] {
        if let Some(idx) = expr.find(op) {
            let left = get_path(data, expr[..idx].trim());
            let literal = parse_literal(&expr[idx + op.len()..])?;
            let outcome = match op {
                "==" => literal_eq(left, &literal),
                "!=" => !literal_eq(left, &literal),
                ">" => literal_cmp(left, &literal) == Some(Ordering::Greater),
                "<" => literal_cmp(left, &literal) == Some(Ordering::Less),
                ">=" => matches!(
                    literal_cmp(left, &literal),
                    Some(Ordering::Greater) | Some(Ordering::Equal)
                ),
                "<=" => matches!(
                    literal_cmp(left, &literal),
                    Some(Ordering::Less) | Some(Ordering::Equal)
                ),
                _ => unreachable!(),
            };
            return Ok(outcome);
        }
    }

    Ok(is_truthy(get_path(data, expr)))
}

fn stringify(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

/// Expands every `{{ expr }}` in `template` against `data`.
///
/// Missing keys render as the empty string. Unterminated `{{` is a
/// template error.
pub fn render_template(template: &str, data: &Value) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after.find("}}").ok_or_else(|| EngineError::TemplateRender {
            message: format!("unterminated '{{{{' in template: '{}'", template),
        })?;
        let expr = after[..end].trim();
        if let Some(value) = get_path(data, expr) {
            out.push_str(&stringify(value));
        }
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Recursively expands templates inside a JSON value.
///
/// A string that is exactly one `{{ expr }}` is replaced by the *typed*
/// path result, so config values can inject objects and numbers; any
/// other string is interpolated textually.
pub fn expand_value(value: &Value, data: &Value) -> Result<Value> {
    match value {
        Value::String(s) => {
            let trimmed = s.trim();
            if let Some(inner) = trimmed
                .strip_prefix("{{")
                .and_then(|rest| rest.strip_suffix("}}"))
            {
                if !inner.contains("{{") && !inner.contains("}}") {
                    return Ok(get_path(data, inner.trim()).cloned().unwrap_or(Value::Null));
                }
            }
            Ok(Value::String(render_template(s, data)?))
        }
        Value::Array(items) => items
            .iter()
            .map(|item| expand_value(item, data))
            .collect::<Result<Vec<_>>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), expand_value(v, data)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

/// Deep-merges `overlay` onto `base`; objects merge key-wise, everything
/// else is replaced by the overlay.
pub fn deep_merge(base: &Value, overlay: &Value) -> Value {
    match (base, overlay) {
        (Value::Object(b), Value::Object(o)) => {
            let mut merged = b.clone();
            for (k, v) in o {
                let entry = match merged.get(k) {
                    Some(existing) => deep_merge(existing, v),
                    None => v.clone(),
                };
                merged.insert(k.clone(), entry);
            }
            Value::Object(merged)
        }
        (_, overlay) => overlay.clone(),
    }
}
