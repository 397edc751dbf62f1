// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Core workflow execution engine for Flowgraph.
//!
//! A run walks a project DAG from a chosen start step: plain steps
//! execute their resolved block in the QuickJS sandbox, block groups
//! (`parallel`, `try_catch`, `foreach`, `while`) run as nested
//! orchestrations, and branch steps prune edges by port label. Blocks
//! inherit code, config defaults, and pre/post-process chains along an
//! acyclic inheritance graph resolved once at registry load.
//!
//! The crate depends only on storage traits (`flowgraph-state`) and
//! provider ports ([`ports`]); concrete backends are injected at
//! startup.

pub mod blocks;
pub mod config;
pub mod context;
pub mod dag;
pub mod error;
pub mod executor;
pub mod expr;
pub mod model;
pub mod ports;
pub mod ratelimit;
pub mod retry;

pub use blocks::{system_blocks, BlockRegistry, SharedRegistry};
pub use config::EngineConfig;
pub use context::{DefinitionSource, EngineServices, MemoryDefinitionSource, RunContext};
pub use dag::ProjectGraph;
pub use error::{EngineError, Result};
pub use executor::{Engine, RunOutcome, RunRequest, StepExecutor, SubflowRunner};
pub use ratelimit::{RateDecision, RateLimiter, RateLimiterSettings, RateScope, ScopeLimit};
pub use retry::{BackoffStrategy, RetryConfig, RetryExecutor, RetryPolicy};

pub use flowgraph_sandbox::CancelFlag;
