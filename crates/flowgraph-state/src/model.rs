// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Persisted execution entities: runs, step runs, jobs, schedules, and
//! usage records.
//!
//! Definition-side entities (projects, steps, edges, blocks) live in
//! `flowgraph-core`; this module covers only what the engine reads and
//! writes while executing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// How a run originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggeredBy {
    /// Started by an operator through the API.
    Manual,
    /// Draft-mode test execution.
    Test,
    /// Webhook ingress.
    Webhook,
    /// Cron schedule.
    Schedule,
    /// Engine-internal (sub-workflow invocation).
    Internal,
}

impl TriggeredBy {
    /// Stable string form used for persistence and run-number scoping.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Test => "test",
            Self::Webhook => "webhook",
            Self::Schedule => "schedule",
            Self::Internal => "internal",
        }
    }
}

/// Run lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Created, waiting for a worker.
    Pending,
    /// Being driven by a worker.
    Running,
    /// Terminal: all reachable steps done or skipped.
    Completed,
    /// Terminal: an unhandled step failure.
    Failed,
    /// Terminal: cancellation observed.
    Cancelled,
    /// Suspended at a human-in-loop gate.
    WaitingApproval,
}

impl RunStatus {
    /// Whether the run can no longer change state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// One execution of a project from a chosen start step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    /// Run identity.
    pub id: Uuid,
    /// Owning tenant.
    pub tenant_id: Uuid,
    /// Project this run executes.
    pub project_id: Uuid,
    /// Snapshot version executed (0 = draft).
    pub project_version: u32,
    /// Start step the run entered through.
    pub start_step_id: Uuid,
    /// Monotonic per-(project, triggered_by) counter.
    pub run_number: u64,
    /// Trigger source.
    pub triggered_by: TriggeredBy,
    /// Current lifecycle status.
    pub status: RunStatus,
    /// Cooperative cancellation flag; observed at step boundaries.
    pub cancel_requested: bool,
    /// Input payload delivered to the start step.
    pub input: Value,
    /// Terminal output, once completed.
    pub output: Option<Value>,
    /// Top-level error message, once failed.
    pub error: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// When a worker picked the run up.
    pub started_at: Option<DateTime<Utc>>,
    /// When the run reached a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
}

/// Parameters for creating a run; the store allocates id and run number.
#[derive(Debug, Clone)]
pub struct NewRun {
    /// Owning tenant.
    pub tenant_id: Uuid,
    /// Project to execute.
    pub project_id: Uuid,
    /// Snapshot version to execute (0 = draft).
    pub project_version: u32,
    /// Start step to enter through.
    pub start_step_id: Uuid,
    /// Trigger source.
    pub triggered_by: TriggeredBy,
    /// Input payload.
    pub input: Value,
}

/// Step-run lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepRunStatus {
    /// Buffered, waiting for dispatch.
    Pending,
    /// Executing in the sandbox or a native handler.
    Running,
    /// Finished with an output.
    Completed,
    /// Finished with an error.
    Failed,
    /// Pruned by branch selection or cancellation.
    Skipped,
    /// Interrupted by run cancellation.
    Cancelled,
}

/// A structured log line captured from `ctx.log`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepLog {
    /// Log level (`debug`, `info`, `warn`, `error`).
    pub level: String,
    /// Message text.
    pub message: String,
    /// Optional structured payload.
    pub data: Option<Value>,
    /// Capture time.
    pub at: DateTime<Utc>,
}

/// One attempt at executing one step within a run.
///
/// History is preserved: a re-execute appends a new row with `attempt + 1`
/// rather than mutating the prior attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRun {
    /// Attempt identity.
    pub id: Uuid,
    /// Owning run.
    pub run_id: Uuid,
    /// Step being attempted.
    pub step_id: Uuid,
    /// Step name at execution time, for display.
    pub step_name: String,
    /// 1-based attempt number, contiguous per (run, step).
    pub attempt: u32,
    /// Attempt status.
    pub status: StepRunStatus,
    /// Input the attempt received.
    pub input: Value,
    /// Output, once completed.
    pub output: Option<Value>,
    /// Error message, once failed.
    pub error: Option<String>,
    /// Sandbox log lines.
    pub logs: Vec<StepLog>,
    /// Dispatch time.
    pub started_at: DateTime<Utc>,
    /// Completion time.
    pub completed_at: Option<DateTime<Utc>>,
}

/// Coarse job priority. Lower values dequeue first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    /// Interactive / webhook traffic.
    High,
    /// Default.
    Normal,
    /// Backfill and internal housekeeping.
    Low,
}

impl JobPriority {
    /// Numeric rank used by queue ordering.
    pub fn rank(&self) -> i64 {
        match self {
            Self::High => 0,
            Self::Normal => 1,
            Self::Low => 2,
        }
    }
}

/// Queue item status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for a worker.
    Queued,
    /// Leased to a worker.
    Claimed,
    /// Acknowledged by the worker that drove it.
    Done,
}

/// A queue item pointing a worker at a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Job identity.
    pub id: Uuid,
    /// Owning tenant.
    pub tenant_id: Uuid,
    /// Project to execute.
    pub project_id: Uuid,
    /// Start step of the run.
    pub start_step_id: Uuid,
    /// The run this job delivers.
    pub run_id: Uuid,
    /// Trigger source.
    pub triggered_by: TriggeredBy,
    /// Dequeue priority.
    pub priority: JobPriority,
    /// Queue status.
    pub status: JobStatus,
    /// Webhook idempotency key, when webhook-originated.
    pub idempotency_key: Option<String>,
    /// Earliest dispatch time (delayed re-enqueue for `wait` steps).
    pub not_before: Option<DateTime<Utc>>,
    /// Worker currently holding the lease.
    pub claimed_by: Option<String>,
    /// Lease deadline; past it the job may be reclaimed.
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// Delivery attempts so far.
    pub attempts: u32,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl Job {
    /// Builds a fresh queued job for a run.
    pub fn for_run(run: &Run, priority: JobPriority) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id: run.tenant_id,
            project_id: run.project_id,
            start_step_id: run.start_step_id,
            run_id: run.id,
            triggered_by: run.triggered_by,
            priority,
            status: JobStatus::Queued,
            idempotency_key: None,
            not_before: None,
            claimed_by: None,
            lease_expires_at: None,
            attempts: 0,
            created_at: Utc::now(),
        }
    }
}

/// A cron-triggered run source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    /// Schedule identity.
    pub id: Uuid,
    /// Owning tenant.
    pub tenant_id: Uuid,
    /// Project to run.
    pub project_id: Uuid,
    /// Start step runs enter through.
    pub start_step_id: Uuid,
    /// Cron expression (5- or 6-field).
    pub cron_expr: String,
    /// IANA timezone name the expression is evaluated in.
    pub timezone: String,
    /// Input payload for each fired run.
    pub input: Value,
    /// Whether the schedule fires at all.
    pub enabled: bool,
    /// Opaque retry policy forwarded to the run.
    pub retry_policy: Option<Value>,
    /// Next computed fire time (UTC).
    pub next_run_at: Option<DateTime<Utc>>,
}

/// Decision recorded for a human-in-loop gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalDecision {
    /// Whether the gate passed.
    pub approved: bool,
    /// Free-text reviewer comment.
    pub comment: Option<String>,
    /// Structured payload returned to the waiting snippet.
    pub data: Option<Value>,
    /// When the decision was made.
    pub decided_at: DateTime<Utc>,
}

/// What kind of metered call a usage record covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageKind {
    /// `ctx.llm` chat/complete call.
    Llm,
    /// `ctx.http` request.
    Http,
    /// `ctx.embedding` call.
    Embedding,
}

/// One metered capability call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    /// Record identity.
    pub id: Uuid,
    /// Owning tenant.
    pub tenant_id: Uuid,
    /// Project the call ran under.
    pub project_id: Uuid,
    /// Run the call ran under.
    pub run_id: Uuid,
    /// Step-run attempt that made the call.
    pub step_run_id: Uuid,
    /// Call kind.
    pub kind: UsageKind,
    /// Provider name (`anthropic`, `openai`, …) when applicable.
    pub provider: Option<String>,
    /// Model name when applicable.
    pub model: Option<String>,
    /// Prompt-side tokens.
    pub tokens_in: Option<u64>,
    /// Completion-side tokens.
    pub tokens_out: Option<u64>,
    /// Wall-clock duration of the call.
    pub duration_ms: u64,
    /// Capture time.
    pub at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_status_terminality() {
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
        assert!(!RunStatus::Pending.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(!RunStatus::WaitingApproval.is_terminal());
    }

    #[test]
    fn test_priority_ordering() {
        assert!(JobPriority::High.rank() < JobPriority::Normal.rank());
        assert!(JobPriority::Normal.rank() < JobPriority::Low.rank());
    }

    #[test]
    fn test_triggered_by_round_trip() {
        let json = serde_json::to_string(&TriggeredBy::Webhook).unwrap();
        assert_eq!(json, "\"webhook\"");
        let back: TriggeredBy = serde_json::from_str(&json).unwrap();
        assert_eq!(back, TriggeredBy::Webhook);
    }
}
