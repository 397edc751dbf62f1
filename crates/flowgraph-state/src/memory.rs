// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! In-memory storage backends.
//!
//! Lock-per-store implementations used by tests and single-node
//! deployments. Atomicity guarantees come from holding the store lock for
//! the whole operation, which mirrors the row-transaction semantics of the
//! durable backends.

use crate::error::StoreError;
use crate::model::{
    ApprovalDecision, Job, JobStatus, NewRun, Run, RunStatus, Schedule, StepRun, UsageRecord,
};
use crate::traits::{
    ApprovalStore, IdempotencyStore, JobQueue, RunStore, ScheduleStore, UsageSink,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

/// In-memory [`RunStore`].
#[derive(Default)]
pub struct MemoryRunStore {
    inner: Mutex<RunStoreInner>,
}

#[derive(Default)]
struct RunStoreInner {
    runs: HashMap<Uuid, Run>,
    step_runs: HashMap<Uuid, Vec<StepRun>>,
    run_numbers: HashMap<(Uuid, &'static str), u64>,
}

impl MemoryRunStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn create_run(&self, new_run: NewRun) -> Result<Run, StoreError> {
        let mut inner = self.inner.lock();
        let counter = inner
            .run_numbers
            .entry((new_run.project_id, new_run.triggered_by.as_str()))
            .or_insert(0);
        *counter += 1;
        let run = Run {
            id: Uuid::new_v4(),
            tenant_id: new_run.tenant_id,
            project_id: new_run.project_id,
            project_version: new_run.project_version,
            start_step_id: new_run.start_step_id,
            run_number: *counter,
            triggered_by: new_run.triggered_by,
            status: RunStatus::Pending,
            cancel_requested: false,
            input: new_run.input,
            output: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };
        inner.runs.insert(run.id, run.clone());
        Ok(run)
    }

    async fn get_run(&self, id: Uuid) -> Result<Run, StoreError> {
        self.inner
            .lock()
            .runs
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound {
                entity: "run",
                id: id.to_string(),
            })
    }

    async fn update_run_status(
        &self,
        id: Uuid,
        status: RunStatus,
        output: Option<Value>,
        error: Option<String>,
    ) -> Result<Run, StoreError> {
        let mut inner = self.inner.lock();
        let run = inner.runs.get_mut(&id).ok_or(StoreError::NotFound {
            entity: "run",
            id: id.to_string(),
        })?;
        if run.status.is_terminal() {
            return Err(StoreError::InvalidTransition {
                message: format!("run {} is already terminal ({:?})", id, run.status),
            });
        }
        run.status = status;
        if output.is_some() {
            run.output = output;
        }
        if error.is_some() {
            run.error = error;
        }
        let now = Utc::now();
        if status == RunStatus::Running && run.started_at.is_none() {
            run.started_at = Some(now);
        }
        if status.is_terminal() {
            run.completed_at = Some(now);
        }
        Ok(run.clone())
    }

    async fn request_cancel(&self, id: Uuid) -> Result<Run, StoreError> {
        let mut inner = self.inner.lock();
        let run = inner.runs.get_mut(&id).ok_or(StoreError::NotFound {
            entity: "run",
            id: id.to_string(),
        })?;
        if run.status.is_terminal() {
            return Err(StoreError::InvalidTransition {
                message: format!("run {} is already terminal ({:?})", id, run.status),
            });
        }
        run.cancel_requested = true;
        Ok(run.clone())
    }

    async fn is_cancel_requested(&self, id: Uuid) -> Result<bool, StoreError> {
        self.inner
            .lock()
            .runs
            .get(&id)
            .map(|r| r.cancel_requested)
            .ok_or(StoreError::NotFound {
                entity: "run",
                id: id.to_string(),
            })
    }

    async fn insert_step_run(&self, step_run: &StepRun) -> Result<(), StoreError> {
        self.inner
            .lock()
            .step_runs
            .entry(step_run.run_id)
            .or_default()
            .push(step_run.clone());
        Ok(())
    }

    async fn update_step_run(&self, step_run: &StepRun) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let rows = inner
            .step_runs
            .get_mut(&step_run.run_id)
            .ok_or(StoreError::NotFound {
                entity: "step_run",
                id: step_run.id.to_string(),
            })?;
        let row = rows
            .iter_mut()
            .find(|r| r.id == step_run.id)
            .ok_or(StoreError::NotFound {
                entity: "step_run",
                id: step_run.id.to_string(),
            })?;
        *row = step_run.clone();
        Ok(())
    }

    async fn list_step_runs(&self, run_id: Uuid) -> Result<Vec<StepRun>, StoreError> {
        let mut rows = self
            .inner
            .lock()
            .step_runs
            .get(&run_id)
            .cloned()
            .unwrap_or_default();
        rows.sort_by_key(|r| r.started_at);
        Ok(rows)
    }

    async fn next_attempt(&self, run_id: Uuid, step_id: Uuid) -> Result<u32, StoreError> {
        let inner = self.inner.lock();
        let highest = inner
            .step_runs
            .get(&run_id)
            .map(|rows| {
                rows.iter()
                    .filter(|r| r.step_id == step_id)
                    .map(|r| r.attempt)
                    .max()
                    .unwrap_or(0)
            })
            .unwrap_or(0);
        Ok(highest + 1)
    }
}

/// In-memory [`JobQueue`].
#[derive(Default)]
pub struct MemoryJobQueue {
    jobs: Mutex<HashMap<Uuid, Job>>,
}

impl MemoryJobQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of jobs currently queued (tests).
    pub fn queued_len(&self) -> usize {
        self.jobs
            .lock()
            .values()
            .filter(|j| j.status == JobStatus::Queued)
            .count()
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn enqueue(&self, job: Job) -> Result<Job, StoreError> {
        self.jobs.lock().insert(job.id, job.clone());
        Ok(job)
    }

    async fn claim(&self, worker_id: &str, lease: Duration) -> Result<Option<Job>, StoreError> {
        let now = Utc::now();
        let mut jobs = self.jobs.lock();
        let candidate = jobs
            .values()
            .filter(|j| {
                j.status == JobStatus::Queued && j.not_before.map(|t| t <= now).unwrap_or(true)
            })
            .min_by_key(|j| (j.priority.rank(), j.created_at, j.id))
            .map(|j| j.id);
        let Some(id) = candidate else {
            return Ok(None);
        };
        let job = jobs.get_mut(&id).ok_or(StoreError::NotFound {
            entity: "job",
            id: id.to_string(),
        })?;
        job.status = JobStatus::Claimed;
        job.claimed_by = Some(worker_id.to_string());
        job.lease_expires_at = Some(now + chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::zero()));
        job.attempts += 1;
        Ok(Some(job.clone()))
    }

    async fn extend_lease(
        &self,
        job_id: Uuid,
        worker_id: &str,
        lease: Duration,
    ) -> Result<(), StoreError> {
        let mut jobs = self.jobs.lock();
        let job = jobs.get_mut(&job_id).ok_or(StoreError::NotFound {
            entity: "job",
            id: job_id.to_string(),
        })?;
        if job.claimed_by.as_deref() != Some(worker_id) {
            return Err(StoreError::Conflict {
                message: format!("job {} is not leased to {}", job_id, worker_id),
            });
        }
        job.lease_expires_at =
            Some(Utc::now() + chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::zero()));
        Ok(())
    }

    async fn ack(&self, job_id: Uuid, worker_id: &str) -> Result<(), StoreError> {
        let mut jobs = self.jobs.lock();
        let job = jobs.get_mut(&job_id).ok_or(StoreError::NotFound {
            entity: "job",
            id: job_id.to_string(),
        })?;
        if job.claimed_by.as_deref() != Some(worker_id) {
            return Err(StoreError::Conflict {
                message: format!("job {} is not leased to {}", job_id, worker_id),
            });
        }
        job.status = JobStatus::Done;
        job.claimed_by = None;
        job.lease_expires_at = None;
        Ok(())
    }

    async fn release(&self, job_id: Uuid, worker_id: &str) -> Result<(), StoreError> {
        let mut jobs = self.jobs.lock();
        let job = jobs.get_mut(&job_id).ok_or(StoreError::NotFound {
            entity: "job",
            id: job_id.to_string(),
        })?;
        if job.claimed_by.as_deref() != Some(worker_id) {
            return Err(StoreError::Conflict {
                message: format!("job {} is not leased to {}", job_id, worker_id),
            });
        }
        job.status = JobStatus::Queued;
        job.claimed_by = None;
        job.lease_expires_at = None;
        Ok(())
    }

    async fn reap_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut jobs = self.jobs.lock();
        let mut reclaimed = 0;
        for job in jobs.values_mut() {
            if job.status == JobStatus::Claimed
                && job.lease_expires_at.map(|t| t < now).unwrap_or(false)
            {
                job.status = JobStatus::Queued;
                job.claimed_by = None;
                job.lease_expires_at = None;
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }
}

/// In-memory [`ScheduleStore`].
#[derive(Default)]
pub struct MemoryScheduleStore {
    schedules: Mutex<HashMap<Uuid, Schedule>>,
}

impl MemoryScheduleStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ScheduleStore for MemoryScheduleStore {
    async fn upsert(&self, schedule: Schedule) -> Result<(), StoreError> {
        self.schedules.lock().insert(schedule.id, schedule);
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Schedule, StoreError> {
        self.schedules
            .lock()
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound {
                entity: "schedule",
                id: id.to_string(),
            })
    }

    async fn due(&self, now: DateTime<Utc>) -> Result<Vec<Schedule>, StoreError> {
        Ok(self
            .schedules
            .lock()
            .values()
            .filter(|s| s.enabled && s.next_run_at.map(|t| t <= now).unwrap_or(false))
            .cloned()
            .collect())
    }

    async fn advance(
        &self,
        id: Uuid,
        expected: Option<DateTime<Utc>>,
        next: Option<DateTime<Utc>>,
    ) -> Result<bool, StoreError> {
        let mut schedules = self.schedules.lock();
        let schedule = schedules.get_mut(&id).ok_or(StoreError::NotFound {
            entity: "schedule",
            id: id.to_string(),
        })?;
        if schedule.next_run_at != expected {
            return Ok(false);
        }
        schedule.next_run_at = next;
        Ok(true)
    }
}

/// In-memory [`IdempotencyStore`].
#[derive(Default)]
pub struct MemoryIdempotencyStore {
    entries: Mutex<HashMap<String, (Uuid, DateTime<Utc>)>>,
}

impl MemoryIdempotencyStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl IdempotencyStore for MemoryIdempotencyStore {
    async fn lookup(&self, key: &str) -> Result<Option<Uuid>, StoreError> {
        let now = Utc::now();
        Ok(self
            .entries
            .lock()
            .get(key)
            .filter(|(_, expires)| *expires > now)
            .map(|(run_id, _)| *run_id))
    }

    async fn put_if_absent(
        &self,
        key: &str,
        run_id: Uuid,
        ttl: Duration,
    ) -> Result<Uuid, StoreError> {
        let now = Utc::now();
        let mut entries = self.entries.lock();
        if let Some((existing, expires)) = entries.get(key) {
            if *expires > now {
                return Ok(*existing);
            }
        }
        entries.insert(
            key.to_string(),
            (
                run_id,
                now + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero()),
            ),
        );
        Ok(run_id)
    }
}

/// In-memory [`ApprovalStore`].
#[derive(Default)]
pub struct MemoryApprovalStore {
    requests: Mutex<HashMap<String, Value>>,
    decisions: Mutex<HashMap<String, ApprovalDecision>>,
}

impl MemoryApprovalStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Pending request payloads (tests and review tooling).
    pub fn pending(&self) -> Vec<(String, Value)> {
        let decisions = self.decisions.lock();
        self.requests
            .lock()
            .iter()
            .filter(|(k, _)| !decisions.contains_key(*k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

#[async_trait]
impl ApprovalStore for MemoryApprovalStore {
    async fn record_request(&self, key: &str, request: Value) -> Result<(), StoreError> {
        self.requests.lock().insert(key.to_string(), request);
        Ok(())
    }

    async fn decision(&self, key: &str) -> Result<Option<ApprovalDecision>, StoreError> {
        Ok(self.decisions.lock().get(key).cloned())
    }

    async fn submit(&self, key: &str, decision: ApprovalDecision) -> Result<(), StoreError> {
        self.decisions.lock().insert(key.to_string(), decision);
        Ok(())
    }
}

/// In-memory [`UsageSink`] retaining records for inspection.
#[derive(Default)]
pub struct MemoryUsageSink {
    records: Mutex<Vec<UsageRecord>>,
}

impl MemoryUsageSink {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything recorded so far.
    pub fn records(&self) -> Vec<UsageRecord> {
        self.records.lock().clone()
    }
}

#[async_trait]
impl UsageSink for MemoryUsageSink {
    async fn record(&self, record: UsageRecord) -> Result<(), StoreError> {
        self.records.lock().push(record);
        Ok(())
    }
}
