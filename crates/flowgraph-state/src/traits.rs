// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Storage contracts the engine core depends on.
//!
//! Backends must be safe under concurrent workers: claims are atomic,
//! run-number allocation is monotonic per scope, and status transitions
//! reject invalid lifecycle moves with [`StoreError::InvalidTransition`].

use crate::error::StoreError;
use crate::model::{
    ApprovalDecision, Job, NewRun, Run, RunStatus, Schedule, StepRun, UsageRecord,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

/// Persistence for runs and their step-run history.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Creates a pending run, atomically allocating the next
    /// `run_number` for `(project_id, triggered_by)`.
    async fn create_run(&self, new_run: NewRun) -> Result<Run, StoreError>;

    /// Fetches a run by id.
    async fn get_run(&self, id: Uuid) -> Result<Run, StoreError>;

    /// Moves a run to `status`, recording output/error and timestamps.
    ///
    /// Transitions out of a terminal status are rejected.
    async fn update_run_status(
        &self,
        id: Uuid,
        status: RunStatus,
        output: Option<Value>,
        error: Option<String>,
    ) -> Result<Run, StoreError>;

    /// Sets the cooperative cancellation flag.
    ///
    /// Returns [`StoreError::InvalidTransition`] when the run is already
    /// terminal, so the API layer can answer `409 INVALID_STATE`.
    async fn request_cancel(&self, id: Uuid) -> Result<Run, StoreError>;

    /// Reads the cancellation flag without fetching the whole run.
    async fn is_cancel_requested(&self, id: Uuid) -> Result<bool, StoreError>;

    /// Appends a step-run attempt.
    async fn insert_step_run(&self, step_run: &StepRun) -> Result<(), StoreError>;

    /// Rewrites a step-run row (status/output/logs on completion).
    async fn update_step_run(&self, step_run: &StepRun) -> Result<(), StoreError>;

    /// All step runs of a run, ordered by start time.
    async fn list_step_runs(&self, run_id: Uuid) -> Result<Vec<StepRun>, StoreError>;

    /// Next attempt number for `(run, step)`: one past the highest
    /// recorded attempt, starting at 1.
    async fn next_attempt(&self, run_id: Uuid, step_id: Uuid) -> Result<u32, StoreError>;
}

/// Durable at-least-once job delivery with atomic claiming.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Adds a job to the queue.
    async fn enqueue(&self, job: Job) -> Result<Job, StoreError>;

    /// Claims the highest-priority dispatchable job, moving it
    /// `queued → claimed` with a lease in a single atomic step.
    ///
    /// Returns `None` when nothing is dispatchable (empty, or all
    /// remaining jobs have a future `not_before`).
    async fn claim(&self, worker_id: &str, lease: Duration) -> Result<Option<Job>, StoreError>;

    /// Extends the lease of a claimed job. Fails with
    /// [`StoreError::Conflict`] when another worker holds it.
    async fn extend_lease(
        &self,
        job_id: Uuid,
        worker_id: &str,
        lease: Duration,
    ) -> Result<(), StoreError>;

    /// Acknowledges a claimed job as done.
    async fn ack(&self, job_id: Uuid, worker_id: &str) -> Result<(), StoreError>;

    /// Returns a claimed job to the queue after a worker-side failure.
    async fn release(&self, job_id: Uuid, worker_id: &str) -> Result<(), StoreError>;

    /// Re-queues claimed jobs whose lease expired before `now`.
    /// Returns how many were reclaimed.
    async fn reap_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;
}

/// Persistence for cron schedules.
#[async_trait]
pub trait ScheduleStore: Send + Sync {
    /// Inserts or replaces a schedule.
    async fn upsert(&self, schedule: Schedule) -> Result<(), StoreError>;

    /// Fetches a schedule by id.
    async fn get(&self, id: Uuid) -> Result<Schedule, StoreError>;

    /// Enabled schedules with `next_run_at <= now`.
    async fn due(&self, now: DateTime<Utc>) -> Result<Vec<Schedule>, StoreError>;

    /// Compare-and-swap advance of `next_run_at`.
    ///
    /// Succeeds only when the stored value still equals `expected`; this is
    /// the per-schedule lock that lets scheduler replicas coexist. Returns
    /// whether this caller won the advance.
    async fn advance(
        &self,
        id: Uuid,
        expected: Option<DateTime<Utc>>,
        next: Option<DateTime<Utc>>,
    ) -> Result<bool, StoreError>;
}

/// Webhook idempotency window.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Looks up a non-expired key, returning the original run id.
    async fn lookup(&self, key: &str) -> Result<Option<Uuid>, StoreError>;

    /// Records `key → run_id` with a TTL unless a live entry exists.
    ///
    /// Returns the run id now associated with the key: `run_id` when this
    /// call inserted, or the pre-existing id when it lost a race.
    async fn put_if_absent(
        &self,
        key: &str,
        run_id: Uuid,
        ttl: Duration,
    ) -> Result<Uuid, StoreError>;
}

/// Decisions for human-in-loop gates.
#[async_trait]
pub trait ApprovalStore: Send + Sync {
    /// Records that a gate is waiting, with the request payload shown to
    /// reviewers.
    async fn record_request(&self, key: &str, request: Value) -> Result<(), StoreError>;

    /// Reads the decision for a gate, if one was submitted.
    async fn decision(&self, key: &str) -> Result<Option<ApprovalDecision>, StoreError>;

    /// Submits a decision for a waiting gate.
    async fn submit(&self, key: &str, decision: ApprovalDecision) -> Result<(), StoreError>;
}

/// Sink for per-call usage accounting.
#[async_trait]
pub trait UsageSink: Send + Sync {
    /// Records one metered capability call.
    async fn record(&self, record: UsageRecord) -> Result<(), StoreError>;
}

/// Small key-value snapshots (rate-limiter buckets survive restarts
/// through this; transient loss is acceptable).
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Persists `data` under `key`, replacing any prior snapshot.
    async fn save(&self, key: &str, data: Value) -> Result<(), StoreError>;

    /// Loads the last snapshot stored under `key`.
    async fn load(&self, key: &str) -> Result<Option<Value>, StoreError>;
}
