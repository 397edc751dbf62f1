// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Storage contracts and persistence backends for the Flowgraph engine.
//!
//! The engine core depends only on the traits in [`traits`]; concrete
//! backends are injected at startup. Two families ship here:
//!
//! - [`memory`] — in-process implementations backed by `parking_lot` and
//!   `dashmap`, used by tests and single-node deployments.
//! - [`sqlite`] — a durable SQLite implementation (sqlx) of the subset the
//!   engine persists: runs, step runs, jobs, schedules, webhook idempotency
//!   keys, and usage records.

pub mod error;
pub mod memory;
pub mod model;
pub mod snapshot;
pub mod sqlite;
pub mod traits;

pub use error::StoreError;
pub use memory::{
    MemoryApprovalStore, MemoryIdempotencyStore, MemoryJobQueue, MemoryRunStore,
    MemoryScheduleStore, MemoryUsageSink,
};
pub use model::{
    ApprovalDecision, Job, JobPriority, JobStatus, NewRun, Run, RunStatus, Schedule, StepLog,
    StepRun, StepRunStatus, TriggeredBy, UsageKind, UsageRecord,
};
pub use snapshot::{FileSnapshotStore, MemorySnapshotStore};
pub use sqlite::SqliteStore;
pub use traits::{
    ApprovalStore, IdempotencyStore, JobQueue, RunStore, ScheduleStore, SnapshotStore, UsageSink,
};
