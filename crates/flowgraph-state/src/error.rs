// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Storage error type shared by all backends.

/// Errors surfaced by storage backends.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// The requested row does not exist.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Entity kind (run, job, schedule, …).
        entity: &'static str,
        /// Identifier that failed to resolve.
        id: String,
    },

    /// A status transition violated the entity lifecycle.
    #[error("invalid transition: {message}")]
    InvalidTransition {
        /// Why the transition was rejected.
        message: String,
    },

    /// An optimistic or lease-based claim lost the race.
    #[error("conflict: {message}")]
    Conflict {
        /// What was contended.
        message: String,
    },

    /// Payload (de)serialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The underlying database reported an error.
    #[error("database error: {0}")]
    Database(String),

    /// Filesystem-level failure (snapshot stores).
    #[error("io error: {0}")]
    Io(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound {
                entity: "row",
                id: String::new(),
            },
            other => Self::Database(other.to_string()),
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
