// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Definition-side data model: projects, steps, edges, block groups, and
//! block definitions.
//!
//! Execution-side entities (runs, step runs, jobs, schedules) live in
//! `flowgraph-state` and are re-exported here so engine callers have one
//! import surface.

mod block;
mod group;
mod step;

pub use block::{BlockDefinition, ErrorCodeSpec, ResolvedBlock};
pub use group::{BlockGroup, ForeachConfig, GroupType, ParallelConfig, TryCatchConfig, WhileConfig};
pub use step::{Edge, Position, Step, StepType, TriggerType};

pub use flowgraph_state::model::{
    ApprovalDecision, Job, JobPriority, JobStatus, NewRun, Run, RunStatus, Schedule, StepLog,
    StepRun, StepRunStatus, TriggeredBy, UsageKind, UsageRecord,
};

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Project lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    /// Editable; runs execute the draft only when `triggered_by = test`.
    Draft,
    /// Snapshotted into an immutable version.
    Published,
}

/// Tenant-scoped DAG container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    /// Project identity.
    pub id: Uuid,
    /// Owning tenant.
    pub tenant_id: Uuid,
    /// Display name.
    pub name: String,
    /// Lifecycle status. Structural edits require `draft`.
    pub status: ProjectStatus,
    /// Monotonically increasing version, bumped on publish.
    pub version: u32,
    /// Shared variables visible to templates as `ctx.variables.*`.
    #[serde(default)]
    pub variables: Value,
    /// Whole-run deadline in milliseconds, when the project caps it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_timeout_ms: Option<u64>,
}

/// A resolved snapshot of a project: the unit the orchestrator executes.
///
/// Published runs execute an immutable snapshot of this structure; test
/// runs execute the live draft.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectDefinition {
    /// The project header.
    pub project: Project,
    /// All steps, group members included.
    pub steps: Vec<Step>,
    /// All edges.
    pub edges: Vec<Edge>,
    /// All block groups.
    #[serde(default)]
    pub groups: Vec<BlockGroup>,
}

impl ProjectDefinition {
    /// Finds a step by id.
    pub fn step(&self, id: Uuid) -> Result<&Step> {
        self.steps
            .iter()
            .find(|s| s.id == id)
            .ok_or(EngineError::NotFound {
                entity: "step",
                id: id.to_string(),
            })
    }

    /// Finds a group by id.
    pub fn group(&self, id: Uuid) -> Result<&BlockGroup> {
        self.groups
            .iter()
            .find(|g| g.id == id)
            .ok_or(EngineError::NotFound {
                entity: "block_group",
                id: id.to_string(),
            })
    }

    /// Steps whose `block_group_id` is exactly `group_id`.
    pub fn group_members(&self, group_id: Uuid) -> Vec<&Step> {
        self.steps
            .iter()
            .filter(|s| s.block_group_id == Some(group_id))
            .collect()
    }

    /// All start steps of the project.
    pub fn start_steps(&self) -> Vec<&Step> {
        self.steps
            .iter()
            .filter(|s| s.step_type == StepType::Start)
            .collect()
    }

    /// Validates the definition-level invariants that do not require the
    /// graph: trigger fields, group membership rules, and group nesting.
    ///
    /// Graph-shape invariants (acyclicity, edge endpoints) live in
    /// [`crate::dag::ProjectGraph`].
    pub fn validate_shape(&self) -> Result<()> {
        for step in &self.steps {
            let is_start = step.step_type == StepType::Start;
            if is_start && step.trigger_type.is_none() {
                return Err(EngineError::validation(format!(
                    "start step '{}' has no trigger_type",
                    step.name
                )));
            }
            if !is_start && step.trigger_type.is_some() {
                return Err(EngineError::validation(format!(
                    "step '{}' has trigger_type but is not a start step",
                    step.name
                )));
            }
            if is_start && step.block_group_id.is_some() {
                return Err(EngineError::validation(format!(
                    "start step '{}' may not be a group member",
                    step.name
                )));
            }
            if let Some(group_id) = step.block_group_id {
                self.group(group_id)?;
            }
        }

        // Group nesting must form a tree.
        for group in &self.groups {
            let mut seen = vec![group.id];
            let mut cursor = group.parent_group_id;
            while let Some(parent) = cursor {
                if seen.contains(&parent) {
                    return Err(EngineError::validation(format!(
                        "group nesting cycle involving group {}",
                        group.id
                    )));
                }
                seen.push(parent);
                cursor = self.group(parent)?.parent_group_id;
            }
        }
        Ok(())
    }
}
