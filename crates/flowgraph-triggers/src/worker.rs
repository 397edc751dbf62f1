// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Worker pool.
//!
//! Workers claim jobs atomically, extend their lease on a heartbeat
//! while driving the run, and acknowledge on any settled outcome. A
//! worker crash simply lets the lease lapse; the reaper re-queues the
//! job and the next delivery replays completed steps from their
//! materialized outputs.

use chrono::Utc;
use flowgraph_core::error::Result;
use flowgraph_core::model::{Job, JobPriority};
use flowgraph_core::{CancelFlag, Engine, RunOutcome};
use flowgraph_state::traits::JobQueue;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How long an idle worker sleeps between claim attempts.
const IDLE_POLL: Duration = Duration::from_millis(250);

/// Pool of run-driving workers over the shared job queue.
pub struct WorkerPool {
    engine: Arc<Engine>,
    concurrency: usize,
    lease: Duration,
    heartbeat: Duration,
}

impl WorkerPool {
    /// Creates a pool sized from the engine config.
    pub fn new(engine: Arc<Engine>) -> Self {
        let config = &engine.services().config;
        Self {
            concurrency: config.worker_concurrency.max(1),
            lease: config.job_lease,
            heartbeat: config.lease_heartbeat,
            engine,
        }
    }

    /// Runs the pool until `shutdown` is cancelled.
    pub async fn run(&self, shutdown: CancelFlag) {
        info!(workers = self.concurrency, "worker pool started");

        let mut handles = Vec::with_capacity(self.concurrency + 1);
        for index in 0..self.concurrency {
            let engine = self.engine.clone();
            let shutdown = shutdown.clone();
            let lease = self.lease;
            let heartbeat = self.heartbeat;
            let worker_id = format!("worker-{}-{}", index, Uuid::new_v4());
            handles.push(tokio::spawn(async move {
                worker_loop(engine, worker_id, lease, heartbeat, shutdown).await;
            }));
        }

        // One reaper task re-queues jobs whose lease expired.
        {
            let engine = self.engine.clone();
            let shutdown = shutdown.clone();
            let interval = self.heartbeat;
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    ticker.tick().await;
                    if shutdown.is_cancelled() {
                        break;
                    }
                    match engine.services().job_queue.reap_expired(Utc::now()).await {
                        Ok(0) => {}
                        Ok(reclaimed) => {
                            warn!(reclaimed, "re-queued jobs with expired leases")
                        }
                        Err(err) => warn!(error = %err, "lease reaper failed"),
                    }
                }
            }));
        }

        for handle in handles {
            let _ = handle.await;
        }
        info!("worker pool stopped");
    }

    /// Claims and processes at most one job; test and CLI convenience.
    pub async fn run_once(&self, worker_id: &str) -> Result<Option<RunOutcome>> {
        let queue = self.engine.services().job_queue.clone();
        let Some(job) = queue.claim(worker_id, self.lease).await? else {
            return Ok(None);
        };
        let outcome = process_job(&self.engine, &job, worker_id, self.heartbeat).await?;
        Ok(Some(outcome))
    }
}

async fn worker_loop(
    engine: Arc<Engine>,
    worker_id: String,
    lease: Duration,
    heartbeat: Duration,
    shutdown: CancelFlag,
) {
    debug!(%worker_id, "worker started");
    loop {
        if shutdown.is_cancelled() {
            break;
        }
        let claimed = engine
            .services()
            .job_queue
            .claim(&worker_id, lease)
            .await;
        match claimed {
            Ok(Some(job)) => {
                if let Err(err) = process_job(&engine, &job, &worker_id, heartbeat).await {
                    warn!(%worker_id, job_id = %job.id, error = %err, "job processing failed");
                    let _ = engine
                        .services()
                        .job_queue
                        .release(job.id, &worker_id)
                        .await;
                }
            }
            Ok(None) => tokio::time::sleep(IDLE_POLL).await,
            Err(err) => {
                warn!(%worker_id, error = %err, "claim failed");
                tokio::time::sleep(IDLE_POLL).await;
            }
        }
    }
    debug!(%worker_id, "worker stopped");
}

/// Drives one claimed job to a settled outcome and acknowledges it.
async fn process_job(
    engine: &Arc<Engine>,
    job: &Job,
    worker_id: &str,
    heartbeat: Duration,
) -> Result<RunOutcome> {
    let queue = engine.services().job_queue.clone();

    // Heartbeat keeps the lease alive while the run executes.
    let beat = {
        let queue = queue.clone();
        let job_id = job.id;
        let worker_id = worker_id.to_string();
        let lease = heartbeat * 2;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(heartbeat);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if queue.extend_lease(job_id, &worker_id, lease).await.is_err() {
                    break;
                }
            }
        })
    };

    let result = engine.execute_run(job.run_id).await;
    beat.abort();

    let outcome = result?;
    match &outcome {
        RunOutcome::Completed(run) => {
            info!(run_id = %run.id, job_id = %job.id, "job done: run completed")
        }
        RunOutcome::Failed(run) => {
            info!(run_id = %run.id, job_id = %job.id, "job done: run failed")
        }
        RunOutcome::Cancelled(run) => {
            info!(run_id = %run.id, job_id = %job.id, "job done: run cancelled")
        }
        RunOutcome::WaitingApproval { run, approval_key } => {
            info!(run_id = %run.id, %approval_key, "job parked: waiting for approval")
        }
        RunOutcome::Delayed { run, resume_at } => {
            // Re-deliver after the wait elapses.
            let mut delayed = Job::for_run(run, JobPriority::Normal);
            delayed.not_before = Some(*resume_at);
            queue.enqueue(delayed).await?;
            info!(run_id = %run.id, %resume_at, "job parked: delayed re-enqueue")
        }
    }

    queue.ack(job.id, worker_id).await?;
    Ok(outcome)
}
