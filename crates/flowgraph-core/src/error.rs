// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Engine error taxonomy.
//!
//! Every failure that crosses a component boundary is expressed as an
//! [`EngineError`] carrying a stable wire code and a retryability hint.
//! Panics never cross component boundaries.

use std::time::Duration;

/// Result alias used throughout the engine.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors raised by the workflow engine.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    /// Step config or input did not match the block's JSON Schema.
    #[error("schema validation failed: {message}")]
    SchemaValidation {
        /// Human-readable description of the first violation.
        message: String,
    },

    /// A `{{…}}` template in step config failed to expand.
    #[error("template render failed: {message}")]
    TemplateRender {
        /// What went wrong while expanding.
        message: String,
    },

    /// An execution deadline elapsed (sandbox, HTTP call, step, or run).
    #[error("execution timed out after {elapsed:?}")]
    Timeout {
        /// How long the work ran before the interrupt fired.
        elapsed: Duration,
    },

    /// `ctx.http` received a non-success status.
    #[error("HTTP request failed with status {status}: {message}")]
    HttpStatus {
        /// Response status code.
        status: u16,
        /// Response body or status text.
        message: String,
    },

    /// A token bucket was exhausted.
    #[error("rate limit exceeded for {scope} '{key}'")]
    RateLimit {
        /// Limited scope (`tenant`, `project`, or `webhook`).
        scope: String,
        /// Bucket key within the scope.
        key: String,
        /// Seconds until a token becomes available.
        retry_after_secs: u64,
    },

    /// The block inheritance graph contains a cycle.
    #[error("circular block inheritance involving '{slug}'")]
    CircularInheritance {
        /// Slug of a block on the cycle.
        slug: String,
    },

    /// A block inheritance chain exceeds the configured depth.
    #[error("block '{slug}' exceeds inheritance depth limit ({depth} > {max})")]
    DepthExceeded {
        /// Slug of the offending block.
        slug: String,
        /// Measured depth.
        depth: usize,
        /// Configured maximum.
        max: usize,
    },

    /// A `while` group hit its iteration safety cap.
    #[error("while group exceeded max_iterations ({limit})")]
    MaxIterations {
        /// The configured cap.
        limit: u32,
    },

    /// The run was cancelled cooperatively.
    #[error("run cancelled")]
    Cancelled,

    /// A human-in-loop gate is waiting for an approval decision.
    ///
    /// Not a failure: the orchestrator suspends the run and releases the
    /// worker when this surfaces from a step.
    #[error("waiting for approval '{approval_key}'")]
    WaitingApproval {
        /// Key the approval event must resolve.
        approval_key: String,
    },

    /// A `wait` step needs the run re-delivered after a delay.
    ///
    /// Not a failure: the worker persists a delayed job and releases the
    /// run until `resume_at`.
    #[error("run delayed until {resume_at}")]
    Delayed {
        /// Earliest time the run should be re-delivered.
        resume_at: chrono::DateTime<chrono::Utc>,
    },

    /// A referenced entity does not exist.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Entity kind (project, step, run, …).
        entity: &'static str,
        /// Identifier that failed to resolve.
        id: String,
    },

    /// The operation is not valid for the entity's current state.
    #[error("invalid state: {message}")]
    InvalidState {
        /// Why the transition was rejected.
        message: String,
    },

    /// A definition-level validation failed (graph shape, trigger rules, …).
    #[error("validation failed: {message}")]
    Validation {
        /// First violated rule.
        message: String,
    },

    /// Block code raised an error with a provider-style code prefix.
    ///
    /// Classified against the block's `error_codes` table to decide
    /// retryability.
    #[error("block error [{code}]: {message}")]
    Block {
        /// Code extracted from the thrown message (e.g. `GITHUB_002`).
        code: String,
        /// Message body without the code prefix.
        message: String,
        /// Whether the block declares this code retryable.
        retryable: bool,
    },

    /// Block code threw without a recognized code prefix.
    #[error("script error: {message}")]
    Script {
        /// The thrown message.
        message: String,
        /// JS stack trace, when the interpreter captured one.
        stack: Option<String>,
    },

    /// Anything unexpected. Retryable only at the job-lease boundary.
    #[error("internal error: {message}")]
    Internal {
        /// Diagnostic description.
        message: String,
    },
}

impl EngineError {
    /// Stable wire code for the error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            Self::SchemaValidation { .. } => "SCHEMA_VALIDATION_ERROR",
            Self::TemplateRender { .. } => "TEMPLATE_RENDER_ERROR",
            Self::Timeout { .. } => "TIMEOUT",
            Self::HttpStatus { .. } => "HTTP_STATUS",
            Self::RateLimit { .. } => "RATE_LIMIT_EXCEEDED",
            Self::CircularInheritance { .. } => "CIRCULAR_INHERITANCE",
            Self::DepthExceeded { .. } => "DEPTH_EXCEEDED",
            Self::MaxIterations { .. } => "MAX_ITERATIONS",
            Self::Cancelled => "CANCELLED",
            Self::WaitingApproval { .. } => "WAITING_APPROVAL",
            Self::Delayed { .. } => "DELAYED",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::InvalidState { .. } => "INVALID_STATE",
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::Block { .. } => "BLOCK_ERROR",
            Self::Script { .. } => "SCRIPT_ERROR",
            Self::Internal { .. } => "INTERNAL_ERROR",
        }
    }

    /// Whether a step-level retry policy may re-attempt after this error.
    pub fn retryable(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            // 429 and server-side failures are worth another attempt; other
            // 4xx statuses indicate a request that will not get better.
            Self::HttpStatus { status, .. } => *status == 429 || *status >= 500,
            Self::Block { retryable, .. } => *retryable,
            Self::Internal { .. } => true,
            _ => false,
        }
    }

    /// Shorthand for an [`EngineError::Internal`].
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Shorthand for an [`EngineError::Validation`].
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }
}

impl From<flowgraph_state::StoreError> for EngineError {
    fn from(err: flowgraph_state::StoreError) -> Self {
        match err {
            flowgraph_state::StoreError::NotFound { entity, id } => {
                Self::NotFound { entity, id }
            }
            flowgraph_state::StoreError::InvalidTransition { message } => {
                Self::InvalidState { message }
            }
            other => Self::Internal {
                message: other.to_string(),
            },
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal {
            message: format!("JSON error: {}", err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(
            EngineError::SchemaValidation {
                message: "x".into()
            }
            .code(),
            "SCHEMA_VALIDATION_ERROR"
        );
        assert_eq!(EngineError::Cancelled.code(), "CANCELLED");
        assert_eq!(
            EngineError::MaxIterations { limit: 100 }.code(),
            "MAX_ITERATIONS"
        );
    }

    #[test]
    fn test_http_retryability() {
        let too_many = EngineError::HttpStatus {
            status: 429,
            message: "slow down".into(),
        };
        let server = EngineError::HttpStatus {
            status: 503,
            message: "unavailable".into(),
        };
        let client = EngineError::HttpStatus {
            status: 404,
            message: "missing".into(),
        };
        assert!(too_many.retryable());
        assert!(server.retryable());
        assert!(!client.retryable());
    }

    #[test]
    fn test_block_error_carries_declared_retryability() {
        let err = EngineError::Block {
            code: "GITHUB_002".into(),
            message: "secondary rate limit".into(),
            retryable: true,
        };
        assert!(err.retryable());
        assert_eq!(err.code(), "BLOCK_ERROR");
    }
}
