// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Execution: step executor, group executor, and the run orchestrator.

mod capabilities;
mod group;
mod run;
mod step;

pub use capabilities::{StepCapabilities, StepScope, SubflowRunner};
pub use group::{GroupExecutor, GroupOutcome};
pub use run::{Engine, Preseed, RunOutcome, RunRequest, ScopeOutcome};
pub use step::StepExecutor;
