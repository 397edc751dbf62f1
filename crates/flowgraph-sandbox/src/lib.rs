// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Capability-bound QuickJS sandbox for Flowgraph block code.
//!
//! Each snippet runs in a fresh interpreter with a preloaded `ctx` object
//! whose methods appear synchronous to JS: the interpreter thread blocks
//! while host-side async work proceeds, and a QuickJS interrupt handler
//! enforces the execution deadline and run cancellation.
//!
//! The entry point is [`SandboxRuntime::execute`], which must be called
//! from a blocking context inside a Tokio runtime (the step executor uses
//! `spawn_blocking`).

pub mod capabilities;
pub mod error;
pub mod preamble;
pub mod runtime;
pub mod validate;

pub use capabilities::{
    Capabilities, CapabilityError, HttpRequest, HttpResponse, LogEntry, NullCapabilities,
};
pub use error::SandboxError;
pub use runtime::{CancelFlag, Execution, ExecutionSpec, SandboxRuntime};
pub use validate::validate_snippet;
