// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Sandbox error types.

use std::time::Duration;

/// Errors surfaced by a sandbox execution.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SandboxError {
    /// Failed to create the QuickJS runtime.
    #[error("failed to create JS runtime: {0}")]
    RuntimeCreation(String),

    /// Failed to create the QuickJS context.
    #[error("failed to create JS context: {0}")]
    ContextCreation(String),

    /// The snippet threw or failed to evaluate.
    #[error("JS evaluation failed: {message}")]
    Evaluation {
        /// Thrown message (capability errors keep their `[CODE]` prefix).
        message: String,
        /// JS stack trace, when the interpreter captured one.
        stack: Option<String>,
    },

    /// The execution deadline elapsed and the interrupt handler fired.
    #[error("execution timed out after {elapsed:?}")]
    Timeout {
        /// Wall-clock time spent before the interrupt.
        elapsed: Duration,
    },

    /// The run was cancelled while the snippet executed.
    #[error("execution cancelled")]
    Cancelled,

    /// A human-in-loop gate is waiting for a decision.
    #[error("execution suspended on approval '{key}'")]
    Suspended {
        /// Approval key the resume event must resolve.
        key: String,
    },

    /// The snippet result could not be converted to JSON.
    #[error("result serialization failed: {0}")]
    Serialization(String),

    /// Static validation rejected the snippet.
    #[error("snippet validation failed: {0}")]
    Validation(String),
}

impl SandboxError {
    /// Builds an evaluation error from a bare message.
    pub fn eval(message: impl Into<String>) -> Self {
        Self::Evaluation {
            message: message.into(),
            stack: None,
        }
    }

    /// Builds an evaluation error with a stack trace.
    pub fn eval_with_stack(message: impl Into<String>, stack: impl Into<String>) -> Self {
        Self::Evaluation {
            message: message.into(),
            stack: Some(stack.into()),
        }
    }
}
