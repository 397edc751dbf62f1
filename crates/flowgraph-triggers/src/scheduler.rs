// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Cron scheduler.
//!
//! Every tick selects enabled schedules whose `next_run_at` is due,
//! advances `next_run_at` with a compare-and-swap (the per-schedule lock
//! that lets replicas coexist), and only then enqueues the run. A crash
//! between advance and enqueue loses at most one firing; missed firings
//! are not backfilled.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule as CronSchedule;
use flowgraph_core::error::{EngineError, Result};
use flowgraph_core::model::{JobPriority, TriggeredBy};
use flowgraph_core::{CancelFlag, Engine, RunRequest};
use flowgraph_state::traits::ScheduleStore;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Normalizes a cron expression to the 6-field form the parser expects;
/// standard 5-field expressions gain a `0` seconds field.
fn normalize(expr: &str) -> String {
    let fields = expr.split_whitespace().count();
    if fields == 5 {
        format!("0 {}", expr)
    } else {
        expr.to_string()
    }
}

/// Next fire time after `after`, computed in the schedule's timezone.
pub fn next_fire(
    cron_expr: &str,
    timezone: &str,
    after: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>> {
    let schedule = CronSchedule::from_str(&normalize(cron_expr)).map_err(|e| {
        EngineError::validation(format!("invalid cron expression '{}': {}", cron_expr, e))
    })?;
    let tz: Tz = timezone
        .parse()
        .map_err(|_| EngineError::validation(format!("invalid timezone '{}'", timezone)))?;
    let next = schedule.after(&after.with_timezone(&tz)).next();
    Ok(next.map(|t| t.with_timezone(&Utc)))
}

/// Next `count` fire times, for operator preview.
pub fn preview_fires(
    cron_expr: &str,
    timezone: &str,
    after: DateTime<Utc>,
    count: usize,
) -> Result<Vec<DateTime<Utc>>> {
    let schedule = CronSchedule::from_str(&normalize(cron_expr)).map_err(|e| {
        EngineError::validation(format!("invalid cron expression '{}': {}", cron_expr, e))
    })?;
    let tz: Tz = timezone
        .parse()
        .map_err(|_| EngineError::validation(format!("invalid timezone '{}'", timezone)))?;
    Ok(schedule
        .after(&after.with_timezone(&tz))
        .take(count)
        .map(|t| t.with_timezone(&Utc))
        .collect())
}

/// Drives due schedules into the job queue.
pub struct Scheduler {
    engine: Arc<Engine>,
    tick_interval: Duration,
}

impl Scheduler {
    /// Creates a scheduler over the engine's schedule store.
    pub fn new(engine: Arc<Engine>) -> Self {
        let tick_interval = engine.services().config.scheduler_tick;
        Self {
            engine,
            tick_interval,
        }
    }

    /// One tick: fire everything due at `now`. Returns how many runs
    /// were enqueued.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<u32> {
        let services = self.engine.services();
        let schedules = services.schedules.due(now).await?;
        let mut fired = 0;

        for schedule in schedules {
            let next = match next_fire(&schedule.cron_expr, &schedule.timezone, now) {
                Ok(next) => next,
                Err(err) => {
                    warn!(schedule_id = %schedule.id, error = %err, "skipping schedule with invalid cron");
                    continue;
                }
            };

            // Advance before enqueue: the CAS doubles as the
            // per-schedule lock across replicas.
            let won = services
                .schedules
                .advance(schedule.id, schedule.next_run_at, next)
                .await?;
            if !won {
                debug!(schedule_id = %schedule.id, "another replica advanced this schedule");
                continue;
            }

            let request = RunRequest {
                tenant_id: schedule.tenant_id,
                project_id: schedule.project_id,
                version: 0,
                start_step_id: Some(schedule.start_step_id),
                triggered_by: TriggeredBy::Schedule,
                input: schedule.input.clone(),
                priority: JobPriority::Normal,
                idempotency_key: None,
            };
            match self.engine.create_run(request).await {
                Ok(run) => {
                    fired += 1;
                    info!(schedule_id = %schedule.id, run_id = %run.id, "schedule fired");
                }
                Err(err) => {
                    warn!(schedule_id = %schedule.id, error = %err, "schedule failed to enqueue");
                }
            }
        }
        Ok(fired)
    }

    /// Tick loop; exits when `shutdown` is cancelled.
    pub async fn run(&self, shutdown: CancelFlag) {
        info!(tick_ms = self.tick_interval.as_millis() as u64, "scheduler started");
        let mut interval = tokio::time::interval(self.tick_interval);
        loop {
            interval.tick().await;
            if shutdown.is_cancelled() {
                break;
            }
            if let Err(err) = self.tick(Utc::now()).await {
                warn!(error = %err, "scheduler tick failed");
            }
        }
        info!("scheduler stopped");
    }
}
