// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Scheduler firing semantics and worker-pool delivery.

use chrono::{Duration as ChronoDuration, Utc};
use flowgraph_core::model::{
    Edge, JobPriority, Position, Project, ProjectDefinition, ProjectStatus, RunStatus, Schedule,
    Step, StepType, TriggerType, TriggeredBy,
};
use flowgraph_core::{
    system_blocks, BlockRegistry, Engine, EngineServices, MemoryDefinitionSource, RunOutcome,
    RunRequest, SharedRegistry,
};
use flowgraph_state::traits::{JobQueue, RunStore, ScheduleStore};
use flowgraph_triggers::{Scheduler, WorkerPool};
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

fn simple_project(trigger: TriggerType, step_config: Value) -> ProjectDefinition {
    let project_id = Uuid::new_v4();
    let start = Step {
        id: Uuid::new_v4(),
        project_id,
        name: "begin".into(),
        step_type: StepType::Start,
        config: json!({}),
        trigger_type: Some(trigger),
        trigger_config: None,
        block_group_id: None,
        position: Position::default(),
        block_definition_id: None,
        retry: None,
        timeout_ms: None,
    };
    let work = Step {
        id: Uuid::new_v4(),
        project_id,
        name: "work".into(),
        step_type: StepType::Code,
        config: step_config,
        trigger_type: None,
        trigger_config: None,
        block_group_id: None,
        position: Position::default(),
        block_definition_id: None,
        retry: None,
        timeout_ms: None,
    };
    let edge = Edge {
        id: Uuid::new_v4(),
        project_id,
        source_step_id: start.id,
        target_step_id: work.id,
        source_port: None,
        condition: None,
    };
    ProjectDefinition {
        project: Project {
            id: project_id,
            tenant_id: Uuid::new_v4(),
            name: "scheduled".into(),
            status: ProjectStatus::Published,
            version: 1,
            variables: json!({}),
            run_timeout_ms: None,
        },
        steps: vec![start, work],
        edges: vec![edge],
        groups: vec![],
    }
}

fn engine_for(definition: &ProjectDefinition) -> Arc<Engine> {
    let registry = SharedRegistry::new(BlockRegistry::load(system_blocks(), 50).unwrap());
    let source = Arc::new(MemoryDefinitionSource::new());
    source.insert(definition.clone());
    Engine::new(Arc::new(EngineServices::in_memory(registry, source)))
}

fn schedule_for(definition: &ProjectDefinition, enabled: bool) -> Schedule {
    Schedule {
        id: Uuid::new_v4(),
        tenant_id: definition.project.tenant_id,
        project_id: definition.project.id,
        start_step_id: definition.steps[0].id,
        cron_expr: "0 * * * *".into(),
        timezone: "UTC".into(),
        input: json!({"from": "cron"}),
        enabled,
        retry_policy: None,
        next_run_at: Some(Utc::now() - ChronoDuration::seconds(5)),
    }
}

#[tokio::test]
async fn test_due_schedule_fires_exactly_once_per_tick() {
    let definition = simple_project(TriggerType::Schedule, json!({"source": "return input;"}));
    let engine = engine_for(&definition);
    let services = engine.services();

    let schedule = schedule_for(&definition, true);
    services.schedules.upsert(schedule.clone()).await.unwrap();

    let scheduler = Scheduler::new(engine.clone());
    let now = Utc::now();
    assert_eq!(scheduler.tick(now).await.unwrap(), 1);

    // next_run_at advanced past now; a second tick fires nothing.
    let stored = services.schedules.get(schedule.id).await.unwrap();
    assert!(stored.next_run_at.unwrap() > now);
    assert_eq!(scheduler.tick(now).await.unwrap(), 0);
}

#[tokio::test]
async fn test_disabled_schedule_never_fires() {
    let definition = simple_project(TriggerType::Schedule, json!({"source": "return input;"}));
    let engine = engine_for(&definition);
    engine
        .services()
        .schedules
        .upsert(schedule_for(&definition, false))
        .await
        .unwrap();

    let scheduler = Scheduler::new(engine.clone());
    assert_eq!(scheduler.tick(Utc::now()).await.unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_worker_drives_scheduled_run_to_completion() {
    let definition = simple_project(
        TriggerType::Schedule,
        json!({"source": "return { echoed: input.from };"}),
    );
    let engine = engine_for(&definition);
    engine
        .services()
        .schedules
        .upsert(schedule_for(&definition, true))
        .await
        .unwrap();

    Scheduler::new(engine.clone())
        .tick(Utc::now())
        .await
        .unwrap();

    let pool = WorkerPool::new(engine.clone());
    let outcome = pool.run_once("test-worker").await.unwrap().unwrap();
    let run = match outcome {
        RunOutcome::Completed(run) => run,
        other => panic!("expected completion, got {:?}", other),
    };
    assert_eq!(run.triggered_by, TriggeredBy::Schedule);
    assert_eq!(run.output.unwrap()["work"], json!({"echoed": "cron"}));

    // Queue drained.
    assert!(pool.run_once("test-worker").await.unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_long_wait_parks_job_until_resume_time() {
    let definition = simple_project(
        TriggerType::Manual,
        json!({"source": "return input;"}),
    );
    // Replace the code step with a long wait.
    let mut definition = definition;
    definition.steps[1].step_type = StepType::Wait;
    definition.steps[1].config = json!({"duration_ms": 120_000});

    let engine = engine_for(&definition);
    engine
        .create_run(RunRequest {
            tenant_id: definition.project.tenant_id,
            project_id: definition.project.id,
            version: 0,
            start_step_id: None,
            triggered_by: TriggeredBy::Manual,
            input: json!({}),
            priority: JobPriority::Normal,
            idempotency_key: None,
        })
        .await
        .unwrap();

    let pool = WorkerPool::new(engine.clone());
    let outcome = pool.run_once("test-worker").await.unwrap().unwrap();
    let (run, resume_at) = match outcome {
        RunOutcome::Delayed { run, resume_at } => (run, resume_at),
        other => panic!("expected delay, got {:?}", other),
    };
    assert_eq!(run.status, RunStatus::Pending);
    assert!(resume_at > Utc::now() + ChronoDuration::seconds(60));

    // The delayed job is not claimable before its resume time.
    assert!(pool.run_once("test-worker").await.unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_duplicate_job_for_settled_run_is_harmless() {
    let definition = simple_project(TriggerType::Manual, json!({"source": "return input;"}));
    let engine = engine_for(&definition);
    let run = engine
        .create_run(RunRequest {
            tenant_id: definition.project.tenant_id,
            project_id: definition.project.id,
            version: 0,
            start_step_id: None,
            triggered_by: TriggeredBy::Manual,
            input: json!({}),
            priority: JobPriority::Normal,
            idempotency_key: None,
        })
        .await
        .unwrap();

    let pool = WorkerPool::new(engine.clone());
    let first = pool.run_once("w1").await.unwrap().unwrap();
    assert!(matches!(first, RunOutcome::Completed(_)));

    // A duplicate delivery settles without re-executing steps.
    let duplicate = flowgraph_core::model::Job::for_run(&run, JobPriority::Normal);
    engine
        .services()
        .job_queue
        .enqueue(duplicate)
        .await
        .unwrap();
    let second = pool.run_once("w2").await.unwrap().unwrap();
    assert!(matches!(second, RunOutcome::Completed(_)));

    let step_runs = engine
        .services()
        .run_store
        .list_step_runs(run.id)
        .await
        .unwrap();
    // Each step executed exactly once despite two deliveries.
    assert_eq!(step_runs.len(), 2);
    assert!(step_runs.iter().all(|sr| sr.attempt == 1));
}
