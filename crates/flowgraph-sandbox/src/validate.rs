// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Static snippet validation.
//!
//! The sandbox blocks the interpreter thread for every capability call,
//! so `await` and `async function` can never be honored. Both are
//! rejected before a snippet is accepted into a block definition. The
//! scan is string- and comment-aware to avoid false positives on text
//! like `"await the result"` inside a literal.

use crate::error::SandboxError;

#[derive(PartialEq)]
enum ScanState {
    Code,
    SingleQuote,
    DoubleQuote,
    Template,
    LineComment,
    BlockComment,
}

/// Rejects snippets containing `await` or `async` keywords outside of
/// strings and comments.
pub fn validate_snippet(code: &str) -> Result<(), SandboxError> {
    let bytes = code.as_bytes();
    let mut state = ScanState::Code;
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i] as char;
        let next = if i + 1 < bytes.len() {
            Some(bytes[i + 1] as char)
        } else {
            None
        };

        match state {
            ScanState::Code => match c {
                '\'' => state = ScanState::SingleQuote,
                '"' => state = ScanState::DoubleQuote,
                '`' => state = ScanState::Template,
                '/' if next == Some('/') => state = ScanState::LineComment,
                '/' if next == Some('*') => {
                    state = ScanState::BlockComment;
                    i += 1;
                }
                _ => {
                    if let Some(word) = keyword_at(bytes, i) {
                        return Err(SandboxError::Validation(format!(
                            "'{}' is not supported in block code: capability calls \
                             are synchronous",
                            word
                        )));
                    }
                }
            },
            ScanState::SingleQuote => match c {
                '\\' => i += 1,
                '\'' => state = ScanState::Code,
                _ => {}
            },
            ScanState::DoubleQuote => match c {
                '\\' => i += 1,
                '"' => state = ScanState::Code,
                _ => {}
            },
            ScanState::Template => match c {
                '\\' => i += 1,
                '`' => state = ScanState::Code,
                _ => {}
            },
            ScanState::LineComment => {
                if c == '\n' {
                    state = ScanState::Code;
                }
            }
            ScanState::BlockComment => {
                if c == '*' && next == Some('/') {
                    state = ScanState::Code;
                    i += 1;
                }
            }
        }
        i += 1;
    }
    Ok(())
}

/// Returns the offending keyword when `await` or `async` starts at `i`
/// with identifier boundaries on both sides.
fn keyword_at(bytes: &[u8], i: usize) -> Option<&'static str> {
    for word in ["await", "async"] {
        let w = word.as_bytes();
        if bytes.len() >= i + w.len() && &bytes[i..i + w.len()] == w {
            let before_ok = i == 0 || !is_ident_char(bytes[i - 1]);
            let after_ok =
                i + w.len() >= bytes.len() || !is_ident_char(bytes[i + w.len()]);
            if before_ok && after_ok {
                return Some(word);
            }
        }
    }
    None
}

fn is_ident_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'$'
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_code_passes() {
        assert!(validate_snippet("var x = input.a + 1; return { x: x };").is_ok());
    }

    #[test]
    fn test_await_rejected() {
        let err = validate_snippet("var r = await ctx.http.get('https://x');").unwrap_err();
        assert!(err.to_string().contains("await"));
    }

    #[test]
    fn test_async_function_rejected() {
        assert!(validate_snippet("async function f() {}").is_err());
    }

    #[test]
    fn test_await_in_string_allowed() {
        assert!(validate_snippet("return 'please await the result';").is_ok());
        assert!(validate_snippet("return \"async\";").is_ok());
        assert!(validate_snippet("return `await`;").is_ok());
    }

    #[test]
    fn test_await_in_comment_allowed() {
        assert!(validate_snippet("// await here would be nice\nreturn 1;").is_ok());
        assert!(validate_snippet("/* async */ return 1;").is_ok());
    }

    #[test]
    fn test_identifier_containing_keyword_allowed() {
        assert!(validate_snippet("var awaited = 1; return awaited;").is_ok());
        assert!(validate_snippet("var my_await = 1; return my_await;").is_ok());
    }
}
