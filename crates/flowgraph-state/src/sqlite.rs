// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! SQLite persistence backend.
//!
//! A single [`SqliteStore`] implements the durable subset of the storage
//! contracts: runs, step runs, jobs, schedules, webhook idempotency keys,
//! and usage records. The pool is capped at one connection so multi-row
//! operations and claim updates serialize at the store, matching the
//! row-transaction semantics the engine assumes.
//!
//! Timestamps are stored as unix milliseconds, identifiers as text, and
//! JSON payloads as text columns.

use crate::error::StoreError;
use crate::model::{
    ApprovalDecision, Job, JobPriority, NewRun, Run, RunStatus, Schedule, StepLog, StepRun,
    UsageRecord,
};
use crate::traits::{
    ApprovalStore, IdempotencyStore, JobQueue, RunStore, ScheduleStore, UsageSink,
};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::time::Duration;
use uuid::Uuid;

/// Schema bootstrap, applied on connect. Idempotent.
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS runs (
    id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL,
    project_id TEXT NOT NULL,
    project_version INTEGER NOT NULL,
    start_step_id TEXT NOT NULL,
    run_number INTEGER NOT NULL,
    triggered_by TEXT NOT NULL,
    status TEXT NOT NULL,
    cancel_requested INTEGER NOT NULL DEFAULT 0,
    input TEXT NOT NULL,
    output TEXT,
    error TEXT,
    created_at INTEGER NOT NULL,
    started_at INTEGER,
    completed_at INTEGER
);

CREATE TABLE IF NOT EXISTS run_numbers (
    project_id TEXT NOT NULL,
    scope TEXT NOT NULL,
    value INTEGER NOT NULL,
    PRIMARY KEY (project_id, scope)
);

CREATE TABLE IF NOT EXISTS step_runs (
    id TEXT PRIMARY KEY,
    run_id TEXT NOT NULL,
    step_id TEXT NOT NULL,
    step_name TEXT NOT NULL,
    attempt INTEGER NOT NULL,
    status TEXT NOT NULL,
    input TEXT NOT NULL,
    output TEXT,
    error TEXT,
    logs TEXT NOT NULL,
    started_at INTEGER NOT NULL,
    completed_at INTEGER
);
CREATE INDEX IF NOT EXISTS idx_step_runs_run ON step_runs(run_id, started_at);

CREATE TABLE IF NOT EXISTS jobs (
    id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL,
    project_id TEXT NOT NULL,
    start_step_id TEXT NOT NULL,
    run_id TEXT NOT NULL,
    triggered_by TEXT NOT NULL,
    priority INTEGER NOT NULL,
    status TEXT NOT NULL,
    idempotency_key TEXT,
    not_before INTEGER,
    claimed_by TEXT,
    lease_expires_at INTEGER,
    attempts INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_jobs_claim ON jobs(status, priority, created_at);

CREATE TABLE IF NOT EXISTS schedules (
    id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL,
    project_id TEXT NOT NULL,
    start_step_id TEXT NOT NULL,
    cron_expr TEXT NOT NULL,
    timezone TEXT NOT NULL,
    input TEXT NOT NULL,
    enabled INTEGER NOT NULL,
    retry_policy TEXT,
    next_run_at INTEGER
);

CREATE TABLE IF NOT EXISTS webhook_idempotency (
    key TEXT PRIMARY KEY,
    run_id TEXT NOT NULL,
    expires_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS approvals (
    key TEXT PRIMARY KEY,
    request TEXT,
    decision TEXT
);

CREATE TABLE IF NOT EXISTS usage_records (
    id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL,
    project_id TEXT NOT NULL,
    run_id TEXT NOT NULL,
    step_run_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    provider TEXT,
    model TEXT,
    tokens_in INTEGER,
    tokens_out INTEGER,
    duration_ms INTEGER NOT NULL,
    at INTEGER NOT NULL
);
"#;

/// SQLite-backed store.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Connects and bootstraps the schema.
    ///
    /// `url` is a sqlx SQLite URL, e.g. `sqlite:flowgraph.db?mode=rwc` or
    /// `sqlite::memory:`.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect(url)
            .await?;
        sqlx::raw_sql(SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }
}

fn millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_millis(v: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(v)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn opt_millis(ts: Option<DateTime<Utc>>) -> Option<i64> {
    ts.map(millis)
}

fn parse_uuid(s: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(s).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn parse_json(s: &str) -> Result<Value, StoreError> {
    serde_json::from_str(s).map_err(StoreError::from)
}

fn enum_to_str<T: serde::Serialize>(v: &T) -> Result<String, StoreError> {
    let raw = serde_json::to_string(v)?;
    Ok(raw.trim_matches('"').to_string())
}

fn enum_from_str<T: serde::de::DeserializeOwned>(s: &str) -> Result<T, StoreError> {
    serde_json::from_str(&format!("\"{}\"", s)).map_err(StoreError::from)
}

fn priority_from_rank(rank: i64) -> JobPriority {
    match rank {
        0 => JobPriority::High,
        2 => JobPriority::Low,
        _ => JobPriority::Normal,
    }
}

fn run_from_row(row: &SqliteRow) -> Result<Run, StoreError> {
    Ok(Run {
        id: parse_uuid(&row.try_get::<String, _>("id")?)?,
        tenant_id: parse_uuid(&row.try_get::<String, _>("tenant_id")?)?,
        project_id: parse_uuid(&row.try_get::<String, _>("project_id")?)?,
        project_version: row.try_get::<i64, _>("project_version")? as u32,
        start_step_id: parse_uuid(&row.try_get::<String, _>("start_step_id")?)?,
        run_number: row.try_get::<i64, _>("run_number")? as u64,
        triggered_by: enum_from_str(&row.try_get::<String, _>("triggered_by")?)?,
        status: enum_from_str(&row.try_get::<String, _>("status")?)?,
        cancel_requested: row.try_get::<i64, _>("cancel_requested")? != 0,
        input: parse_json(&row.try_get::<String, _>("input")?)?,
        output: row
            .try_get::<Option<String>, _>("output")?
            .map(|s| parse_json(&s))
            .transpose()?,
        error: row.try_get::<Option<String>, _>("error")?,
        created_at: from_millis(row.try_get::<i64, _>("created_at")?),
        started_at: row.try_get::<Option<i64>, _>("started_at")?.map(from_millis),
        completed_at: row
            .try_get::<Option<i64>, _>("completed_at")?
            .map(from_millis),
    })
}

fn step_run_from_row(row: &SqliteRow) -> Result<StepRun, StoreError> {
    let logs: Vec<StepLog> = serde_json::from_str(&row.try_get::<String, _>("logs")?)?;
    Ok(StepRun {
        id: parse_uuid(&row.try_get::<String, _>("id")?)?,
        run_id: parse_uuid(&row.try_get::<String, _>("run_id")?)?,
        step_id: parse_uuid(&row.try_get::<String, _>("step_id")?)?,
        step_name: row.try_get::<String, _>("step_name")?,
        attempt: row.try_get::<i64, _>("attempt")? as u32,
        status: enum_from_str(&row.try_get::<String, _>("status")?)?,
        input: parse_json(&row.try_get::<String, _>("input")?)?,
        output: row
            .try_get::<Option<String>, _>("output")?
            .map(|s| parse_json(&s))
            .transpose()?,
        error: row.try_get::<Option<String>, _>("error")?,
        logs,
        started_at: from_millis(row.try_get::<i64, _>("started_at")?),
        completed_at: row
            .try_get::<Option<i64>, _>("completed_at")?
            .map(from_millis),
    })
}

fn job_from_row(row: &SqliteRow) -> Result<Job, StoreError> {
    Ok(Job {
        id: parse_uuid(&row.try_get::<String, _>("id")?)?,
        tenant_id: parse_uuid(&row.try_get::<String, _>("tenant_id")?)?,
        project_id: parse_uuid(&row.try_get::<String, _>("project_id")?)?,
        start_step_id: parse_uuid(&row.try_get::<String, _>("start_step_id")?)?,
        run_id: parse_uuid(&row.try_get::<String, _>("run_id")?)?,
        triggered_by: enum_from_str(&row.try_get::<String, _>("triggered_by")?)?,
        priority: priority_from_rank(row.try_get::<i64, _>("priority")?),
        status: enum_from_str(&row.try_get::<String, _>("status")?)?,
        idempotency_key: row.try_get::<Option<String>, _>("idempotency_key")?,
        not_before: row.try_get::<Option<i64>, _>("not_before")?.map(from_millis),
        claimed_by: row.try_get::<Option<String>, _>("claimed_by")?,
        lease_expires_at: row
            .try_get::<Option<i64>, _>("lease_expires_at")?
            .map(from_millis),
        attempts: row.try_get::<i64, _>("attempts")? as u32,
        created_at: from_millis(row.try_get::<i64, _>("created_at")?),
    })
}

fn schedule_from_row(row: &SqliteRow) -> Result<Schedule, StoreError> {
    Ok(Schedule {
        id: parse_uuid(&row.try_get::<String, _>("id")?)?,
        tenant_id: parse_uuid(&row.try_get::<String, _>("tenant_id")?)?,
        project_id: parse_uuid(&row.try_get::<String, _>("project_id")?)?,
        start_step_id: parse_uuid(&row.try_get::<String, _>("start_step_id")?)?,
        cron_expr: row.try_get::<String, _>("cron_expr")?,
        timezone: row.try_get::<String, _>("timezone")?,
        input: parse_json(&row.try_get::<String, _>("input")?)?,
        enabled: row.try_get::<i64, _>("enabled")? != 0,
        retry_policy: row
            .try_get::<Option<String>, _>("retry_policy")?
            .map(|s| parse_json(&s))
            .transpose()?,
        next_run_at: row
            .try_get::<Option<i64>, _>("next_run_at")?
            .map(from_millis),
    })
}

#[async_trait]
impl RunStore for SqliteStore {
    async fn create_run(&self, new_run: NewRun) -> Result<Run, StoreError> {
        let scope = new_run.triggered_by.as_str();
        let row = sqlx::query(
            "INSERT INTO run_numbers (project_id, scope, value) VALUES (?1, ?2, 1) \
             ON CONFLICT(project_id, scope) DO UPDATE SET value = value + 1 \
             RETURNING value",
        )
        .bind(new_run.project_id.to_string())
        .bind(scope)
        .fetch_one(&self.pool)
        .await?;
        let run_number: i64 = row.try_get("value")?;

        let run = Run {
            id: Uuid::new_v4(),
            tenant_id: new_run.tenant_id,
            project_id: new_run.project_id,
            project_version: new_run.project_version,
            start_step_id: new_run.start_step_id,
            run_number: run_number as u64,
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

        sqlx::query(
            "INSERT INTO runs (id, tenant_id, project_id, project_version, start_step_id, \
             run_number, triggered_by, status, cancel_requested, input, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, ?9, ?10)",
        )
        .bind(run.id.to_string())
        .bind(run.tenant_id.to_string())
        .bind(run.project_id.to_string())
        .bind(run.project_version as i64)
        .bind(run.start_step_id.to_string())
        .bind(run_number)
        .bind(scope)
        .bind(enum_to_str(&run.status)?)
        .bind(run.input.to_string())
        .bind(millis(run.created_at))
        .execute(&self.pool)
        .await?;

        Ok(run)
    }

    async fn get_run(&self, id: Uuid) -> Result<Run, StoreError> {
        let row = sqlx::query("SELECT * FROM runs WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound {
                entity: "run",
                id: id.to_string(),
            })?;
        run_from_row(&row)
    }

    async fn update_run_status(
        &self,
        id: Uuid,
        status: RunStatus,
        output: Option<Value>,
        error: Option<String>,
    ) -> Result<Run, StoreError> {
        let now = Utc::now();
        let completed_at = if status.is_terminal() {
            Some(millis(now))
        } else {
            None
        };
        let started = status == RunStatus::Running;

        let result = sqlx::query(
            "UPDATE runs SET status = ?1, \
             output = COALESCE(?2, output), \
             error = COALESCE(?3, error), \
             started_at = CASE WHEN ?4 AND started_at IS NULL THEN ?5 ELSE started_at END, \
             completed_at = COALESCE(?6, completed_at) \
             WHERE id = ?7 AND status NOT IN ('completed', 'failed', 'cancelled')",
        )
        .bind(enum_to_str(&status)?)
        .bind(output.map(|v| v.to_string()))
        .bind(error)
        .bind(started)
        .bind(millis(now))
        .bind(completed_at)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            // Distinguish missing from terminal.
            let existing = self.get_run(id).await?;
            return Err(StoreError::InvalidTransition {
                message: format!("run {} is already terminal ({:?})", id, existing.status),
            });
        }
        self.get_run(id).await
    }

    async fn request_cancel(&self, id: Uuid) -> Result<Run, StoreError> {
        let result = sqlx::query(
            "UPDATE runs SET cancel_requested = 1 \
             WHERE id = ?1 AND status NOT IN ('completed', 'failed', 'cancelled')",
        )
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let existing = self.get_run(id).await?;
            return Err(StoreError::InvalidTransition {
                message: format!("run {} is already terminal ({:?})", id, existing.status),
            });
        }
        self.get_run(id).await
    }

    async fn is_cancel_requested(&self, id: Uuid) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT cancel_requested FROM runs WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound {
                entity: "run",
                id: id.to_string(),
            })?;
        Ok(row.try_get::<i64, _>("cancel_requested")? != 0)
    }

    async fn insert_step_run(&self, step_run: &StepRun) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO step_runs (id, run_id, step_id, step_name, attempt, status, input, \
             output, error, logs, started_at, completed_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        )
        .bind(step_run.id.to_string())
        .bind(step_run.run_id.to_string())
        .bind(step_run.step_id.to_string())
        .bind(&step_run.step_name)
        .bind(step_run.attempt as i64)
        .bind(enum_to_str(&step_run.status)?)
        .bind(step_run.input.to_string())
        .bind(step_run.output.as_ref().map(|v| v.to_string()))
        .bind(&step_run.error)
        .bind(serde_json::to_string(&step_run.logs)?)
        .bind(millis(step_run.started_at))
        .bind(opt_millis(step_run.completed_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_step_run(&self, step_run: &StepRun) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE step_runs SET status = ?1, output = ?2, error = ?3, logs = ?4, \
             completed_at = ?5 WHERE id = ?6",
        )
        .bind(enum_to_str(&step_run.status)?)
        .bind(step_run.output.as_ref().map(|v| v.to_string()))
        .bind(&step_run.error)
        .bind(serde_json::to_string(&step_run.logs)?)
        .bind(opt_millis(step_run.completed_at))
        .bind(step_run.id.to_string())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity: "step_run",
                id: step_run.id.to_string(),
            });
        }
        Ok(())
    }

    async fn list_step_runs(&self, run_id: Uuid) -> Result<Vec<StepRun>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM step_runs WHERE run_id = ?1 ORDER BY started_at, attempt",
        )
        .bind(run_id.to_string())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(step_run_from_row).collect()
    }

    async fn next_attempt(&self, run_id: Uuid, step_id: Uuid) -> Result<u32, StoreError> {
        let row = sqlx::query(
            "SELECT COALESCE(MAX(attempt), 0) AS highest FROM step_runs \
             WHERE run_id = ?1 AND step_id = ?2",
        )
        .bind(run_id.to_string())
        .bind(step_id.to_string())
        .fetch_one(&self.pool)
        .await?;
        let highest: i64 = row.try_get("highest")?;
        Ok(highest as u32 + 1)
    }
}

#[async_trait]
impl JobQueue for SqliteStore {
    async fn enqueue(&self, job: Job) -> Result<Job, StoreError> {
        sqlx::query(
            "INSERT INTO jobs (id, tenant_id, project_id, start_step_id, run_id, triggered_by, \
             priority, status, idempotency_key, not_before, attempts, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        )
        .bind(job.id.to_string())
        .bind(job.tenant_id.to_string())
        .bind(job.project_id.to_string())
        .bind(job.start_step_id.to_string())
        .bind(job.run_id.to_string())
        .bind(enum_to_str(&job.triggered_by)?)
        .bind(job.priority.rank())
        .bind(enum_to_str(&job.status)?)
        .bind(&job.idempotency_key)
        .bind(opt_millis(job.not_before))
        .bind(job.attempts as i64)
        .bind(millis(job.created_at))
        .execute(&self.pool)
        .await?;
        Ok(job)
    }

    async fn claim(&self, worker_id: &str, lease: Duration) -> Result<Option<Job>, StoreError> {
        let now = Utc::now();
        let deadline = now + chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::zero());
        let row = sqlx::query(
            "UPDATE jobs SET status = 'claimed', claimed_by = ?1, lease_expires_at = ?2, \
             attempts = attempts + 1 \
             WHERE id = (SELECT id FROM jobs WHERE status = 'queued' \
                         AND (not_before IS NULL OR not_before <= ?3) \
                         ORDER BY priority, created_at LIMIT 1) \
             RETURNING *",
        )
        .bind(worker_id)
        .bind(millis(deadline))
        .bind(millis(now))
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| job_from_row(&r)).transpose()
    }

    async fn extend_lease(
        &self,
        job_id: Uuid,
        worker_id: &str,
        lease: Duration,
    ) -> Result<(), StoreError> {
        let deadline = Utc::now() + chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::zero());
        let result = sqlx::query(
            "UPDATE jobs SET lease_expires_at = ?1 \
             WHERE id = ?2 AND status = 'claimed' AND claimed_by = ?3",
        )
        .bind(millis(deadline))
        .bind(job_id.to_string())
        .bind(worker_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict {
                message: format!("job {} is not leased to {}", job_id, worker_id),
            });
        }
        Ok(())
    }

    async fn ack(&self, job_id: Uuid, worker_id: &str) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE jobs SET status = 'done', claimed_by = NULL, lease_expires_at = NULL \
             WHERE id = ?1 AND status = 'claimed' AND claimed_by = ?2",
        )
        .bind(job_id.to_string())
        .bind(worker_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict {
                message: format!("job {} is not leased to {}", job_id, worker_id),
            });
        }
        Ok(())
    }

    async fn release(&self, job_id: Uuid, worker_id: &str) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE jobs SET status = 'queued', claimed_by = NULL, lease_expires_at = NULL \
             WHERE id = ?1 AND status = 'claimed' AND claimed_by = ?2",
        )
        .bind(job_id.to_string())
        .bind(worker_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict {
                message: format!("job {} is not leased to {}", job_id, worker_id),
            });
        }
        Ok(())
    }

    async fn reap_expired(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE jobs SET status = 'queued', claimed_by = NULL, lease_expires_at = NULL \
             WHERE status = 'claimed' AND lease_expires_at < ?1",
        )
        .bind(millis(now))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl ScheduleStore for SqliteStore {
    async fn upsert(&self, schedule: Schedule) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO schedules (id, tenant_id, project_id, start_step_id, cron_expr, \
             timezone, input, enabled, retry_policy, next_run_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10) \
             ON CONFLICT(id) DO UPDATE SET cron_expr = excluded.cron_expr, \
             timezone = excluded.timezone, input = excluded.input, \
             enabled = excluded.enabled, retry_policy = excluded.retry_policy, \
             next_run_at = excluded.next_run_at",
        )
        .bind(schedule.id.to_string())
        .bind(schedule.tenant_id.to_string())
        .bind(schedule.project_id.to_string())
        .bind(schedule.start_step_id.to_string())
        .bind(&schedule.cron_expr)
        .bind(&schedule.timezone)
        .bind(schedule.input.to_string())
        .bind(schedule.enabled as i64)
        .bind(schedule.retry_policy.as_ref().map(|v| v.to_string()))
        .bind(opt_millis(schedule.next_run_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Schedule, StoreError> {
        let row = sqlx::query("SELECT * FROM schedules WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound {
                entity: "schedule",
                id: id.to_string(),
            })?;
        schedule_from_row(&row)
    }

    async fn due(&self, now: DateTime<Utc>) -> Result<Vec<Schedule>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM schedules WHERE enabled = 1 \
             AND next_run_at IS NOT NULL AND next_run_at <= ?1",
        )
        .bind(millis(now))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(schedule_from_row).collect()
    }

    async fn advance(
        &self,
        id: Uuid,
        expected: Option<DateTime<Utc>>,
        next: Option<DateTime<Utc>>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE schedules SET next_run_at = ?1 WHERE id = ?2 AND next_run_at IS ?3",
        )
        .bind(opt_millis(next))
        .bind(id.to_string())
        .bind(opt_millis(expected))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl IdempotencyStore for SqliteStore {
    async fn lookup(&self, key: &str) -> Result<Option<Uuid>, StoreError> {
        let row = sqlx::query(
            "SELECT run_id FROM webhook_idempotency WHERE key = ?1 AND expires_at > ?2",
        )
        .bind(key)
        .bind(millis(Utc::now()))
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| parse_uuid(&r.try_get::<String, _>("run_id")?))
            .transpose()
    }

    async fn put_if_absent(
        &self,
        key: &str,
        run_id: Uuid,
        ttl: Duration,
    ) -> Result<Uuid, StoreError> {
        let now = Utc::now();
        let expires = now + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero());
        // Evict any expired entry so the insert below can take its place.
        sqlx::query("DELETE FROM webhook_idempotency WHERE key = ?1 AND expires_at <= ?2")
            .bind(key)
            .bind(millis(now))
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "INSERT INTO webhook_idempotency (key, run_id, expires_at) VALUES (?1, ?2, ?3) \
             ON CONFLICT(key) DO NOTHING",
        )
        .bind(key)
        .bind(run_id.to_string())
        .bind(millis(expires))
        .execute(&self.pool)
        .await?;
        let row = sqlx::query("SELECT run_id FROM webhook_idempotency WHERE key = ?1")
            .bind(key)
            .fetch_one(&self.pool)
            .await?;
        parse_uuid(&row.try_get::<String, _>("run_id")?)
    }
}

#[async_trait]
impl ApprovalStore for SqliteStore {
    async fn record_request(&self, key: &str, request: Value) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO approvals (key, request) VALUES (?1, ?2) \
             ON CONFLICT(key) DO UPDATE SET request = excluded.request",
        )
        .bind(key)
        .bind(request.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn decision(&self, key: &str) -> Result<Option<ApprovalDecision>, StoreError> {
        let row = sqlx::query("SELECT decision FROM approvals WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(r) => {
                let raw: Option<String> = r.try_get("decision")?;
                raw.map(|s| serde_json::from_str(&s).map_err(StoreError::from))
                    .transpose()
            }
            None => Ok(None),
        }
    }

    async fn submit(&self, key: &str, decision: ApprovalDecision) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO approvals (key, decision) VALUES (?1, ?2) \
             ON CONFLICT(key) DO UPDATE SET decision = excluded.decision",
        )
        .bind(key)
        .bind(serde_json::to_string(&decision)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl UsageSink for SqliteStore {
    async fn record(&self, record: UsageRecord) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO usage_records (id, tenant_id, project_id, run_id, step_run_id, kind, \
             provider, model, tokens_in, tokens_out, duration_ms, at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        )
        .bind(record.id.to_string())
        .bind(record.tenant_id.to_string())
        .bind(record.project_id.to_string())
        .bind(record.run_id.to_string())
        .bind(record.step_run_id.to_string())
        .bind(enum_to_str(&record.kind)?)
        .bind(&record.provider)
        .bind(&record.model)
        .bind(record.tokens_in.map(|v| v as i64))
        .bind(record.tokens_out.map(|v| v as i64))
        .bind(record.duration_ms as i64)
        .bind(millis(record.at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TriggeredBy;
    use serde_json::json;

    async fn store() -> SqliteStore {
        SqliteStore::connect("sqlite::memory:").await.unwrap()
    }

    fn new_run(project: Uuid) -> NewRun {
        NewRun {
            tenant_id: Uuid::new_v4(),
            project_id: project,
            project_version: 1,
            start_step_id: Uuid::new_v4(),
            triggered_by: TriggeredBy::Manual,
            input: json!({"x": 1}),
        }
    }

    #[tokio::test]
    async fn test_run_round_trip() {
        let store = store().await;
        let created = store.create_run(new_run(Uuid::new_v4())).await.unwrap();
        let fetched = store.get_run(created.id).await.unwrap();
        assert_eq!(fetched.run_number, 1);
        assert_eq!(fetched.status, RunStatus::Pending);
        assert_eq!(fetched.input, json!({"x": 1}));
    }

    #[tokio::test]
    async fn test_run_numbers_increment() {
        let store = store().await;
        let project = Uuid::new_v4();
        let first = store.create_run(new_run(project)).await.unwrap();
        let second = store.create_run(new_run(project)).await.unwrap();
        assert_eq!(first.run_number, 1);
        assert_eq!(second.run_number, 2);
    }

    #[tokio::test]
    async fn test_terminal_transition_rejected() {
        let store = store().await;
        let run = store.create_run(new_run(Uuid::new_v4())).await.unwrap();
        store
            .update_run_status(run.id, RunStatus::Failed, None, Some("boom".into()))
            .await
            .unwrap();
        let err = store
            .update_run_status(run.id, RunStatus::Running, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let store = store().await;
        let run = store.create_run(new_run(Uuid::new_v4())).await.unwrap();
        store
            .enqueue(Job::for_run(&run, JobPriority::Normal))
            .await
            .unwrap();

        let first = store.claim("w1", Duration::from_secs(60)).await.unwrap();
        assert!(first.is_some());
        let second = store.claim("w2", Duration::from_secs(60)).await.unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn test_idempotency_window() {
        let store = store().await;
        let original = Uuid::new_v4();
        let got = store
            .put_if_absent("k", original, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(got, original);
        let dup = store
            .put_if_absent("k", Uuid::new_v4(), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(dup, original);
    }
}
