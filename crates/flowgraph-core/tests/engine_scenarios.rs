// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! End-to-end engine scenarios: branch pruning, groups, inheritance,
//! cancellation, suspension, and sub-workflows.

use async_trait::async_trait;
use flowgraph_core::model::{
    ApprovalDecision, BlockDefinition, BlockGroup, Edge, GroupType, JobPriority, Position,
    Project, ProjectDefinition, ProjectStatus, Step, StepRunStatus, StepType, TriggerType,
    TriggeredBy,
};
use flowgraph_core::ports::{HttpPort, SecretResolver};
use flowgraph_core::{
    system_blocks, BlockRegistry, Engine, EngineServices, MemoryDefinitionSource, RunOutcome,
    RunRequest, SharedRegistry,
};
use flowgraph_sandbox::{CapabilityError, HttpRequest, HttpResponse};
use flowgraph_state::traits::RunStore;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Fluent project assembly for tests.
struct ProjectBuilder {
    project: Project,
    steps: Vec<Step>,
    edges: Vec<Edge>,
    groups: Vec<BlockGroup>,
}

impl ProjectBuilder {
    fn new() -> Self {
        Self {
            project: Project {
                id: Uuid::new_v4(),
                tenant_id: Uuid::new_v4(),
                name: "test-project".into(),
                status: ProjectStatus::Published,
                version: 1,
                variables: json!({}),
                run_timeout_ms: None,
            },
            steps: Vec::new(),
            edges: Vec::new(),
            groups: Vec::new(),
        }
    }

    fn start(&mut self, name: &str) -> Uuid {
        let id = Uuid::new_v4();
        self.steps.push(Step {
            id,
            project_id: self.project.id,
            name: name.into(),
            step_type: StepType::Start,
            config: json!({}),
            trigger_type: Some(TriggerType::Manual),
            trigger_config: None,
            block_group_id: None,
            position: Position::default(),
            block_definition_id: None,
            retry: None,
            timeout_ms: None,
        });
        id
    }

    fn step(&mut self, name: &str, step_type: StepType, config: Value) -> Uuid {
        self.step_in(name, step_type, config, None)
    }

    fn step_in(
        &mut self,
        name: &str,
        step_type: StepType,
        config: Value,
        group: Option<Uuid>,
    ) -> Uuid {
        let id = Uuid::new_v4();
        self.steps.push(Step {
            id,
            project_id: self.project.id,
            name: name.into(),
            step_type,
            config,
            trigger_type: None,
            trigger_config: None,
            block_group_id: group,
            position: Position::default(),
            block_definition_id: None,
            retry: None,
            timeout_ms: None,
        });
        id
    }

    fn group(&mut self, name: &str, group_type: GroupType, config: Value) -> Uuid {
        let id = Uuid::new_v4();
        self.groups.push(BlockGroup {
            id,
            project_id: self.project.id,
            name: name.into(),
            group_type,
            config,
            parent_group_id: None,
            pre_process: None,
            post_process: None,
        });
        id
    }

    fn edge(&mut self, source: Uuid, target: Uuid) {
        self.edge_port(source, target, None);
    }

    fn edge_port(&mut self, source: Uuid, target: Uuid, port: Option<&str>) {
        self.edges.push(Edge {
            id: Uuid::new_v4(),
            project_id: self.project.id,
            source_step_id: source,
            target_step_id: target,
            source_port: port.map(str::to_string),
            condition: None,
        });
    }

    fn build(self) -> ProjectDefinition {
        ProjectDefinition {
            project: self.project,
            steps: self.steps,
            edges: self.edges,
            groups: self.groups,
        }
    }
}

fn code_config(source: &str) -> Value {
    json!({ "source": source })
}

/// Engine over in-memory services, with a hook to customize them.
fn engine_with(
    definitions: Vec<ProjectDefinition>,
    extra_blocks: Vec<BlockDefinition>,
    customize: impl FnOnce(&mut EngineServices),
) -> Arc<Engine> {
    let mut blocks = system_blocks();
    blocks.extend(extra_blocks);
    let registry = SharedRegistry::new(BlockRegistry::load(blocks, 50).unwrap());
    let source = Arc::new(MemoryDefinitionSource::new());
    for definition in definitions {
        source.insert(definition);
    }
    let mut services = EngineServices::in_memory(registry, source);
    customize(&mut services);
    Engine::new(Arc::new(services))
}

fn engine_for(definition: ProjectDefinition) -> Arc<Engine> {
    engine_with(vec![definition], vec![], |_| {})
}

async fn start_run(engine: &Arc<Engine>, definition: &ProjectDefinition, input: Value) -> Uuid {
    let run = engine
        .create_run(RunRequest {
            tenant_id: definition.project.tenant_id,
            project_id: definition.project.id,
            version: 0,
            start_step_id: None,
            triggered_by: TriggeredBy::Manual,
            input,
            priority: JobPriority::Normal,
            idempotency_key: None,
        })
        .await
        .unwrap();
    run.id
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_condition_branch_selects_then() {
    let mut builder = ProjectBuilder::new();
    let a = builder.start("A");
    let b = builder.step("B", StepType::Condition, json!({"expression": "$.x > 10"}));
    let c1 = builder.step("C1", StepType::Code, code_config("return input;"));
    let c2 = builder.step("C2", StepType::Code, code_config("return input;"));
    builder.edge(a, b);
    builder.edge_port(b, c1, Some("then"));
    builder.edge_port(b, c2, Some("else"));
    let definition = builder.build();

    let engine = engine_for(definition.clone());
    let run_id = start_run(&engine, &definition, json!({"x": 11})).await;
    let outcome = engine.execute_run(run_id).await.unwrap();

    let run = match outcome {
        RunOutcome::Completed(run) => run,
        other => panic!("expected completion, got {:?}", other),
    };

    let step_runs = engine
        .services()
        .run_store
        .list_step_runs(run.id)
        .await
        .unwrap();
    let names: Vec<&str> = step_runs.iter().map(|sr| sr.step_name.as_str()).collect();
    assert!(names.contains(&"A"));
    assert!(names.contains(&"B"));
    assert!(names.contains(&"C1"));
    assert!(!names.contains(&"C2"), "pruned branch must not execute");
    assert!(step_runs.iter().all(|sr| sr.status == StepRunStatus::Completed));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_condition_branch_selects_else() {
    let mut builder = ProjectBuilder::new();
    let a = builder.start("A");
    let b = builder.step("B", StepType::Condition, json!({"expression": "$.x > 10"}));
    let c1 = builder.step("C1", StepType::Code, code_config("return input;"));
    let c2 = builder.step("C2", StepType::Code, code_config("return input;"));
    builder.edge(a, b);
    builder.edge_port(b, c1, Some("then"));
    builder.edge_port(b, c2, Some("else"));
    let definition = builder.build();

    let engine = engine_for(definition.clone());
    let run_id = start_run(&engine, &definition, json!({"x": 5})).await;
    engine.execute_run(run_id).await.unwrap();

    let names: Vec<String> = engine
        .services()
        .run_store
        .list_step_runs(run_id)
        .await
        .unwrap()
        .into_iter()
        .map(|sr| sr.step_name)
        .collect();
    assert!(names.contains(&"C2".to_string()));
    assert!(!names.contains(&"C1".to_string()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_foreach_parallel_doubles() {
    let mut builder = ProjectBuilder::new();
    let a = builder.start("A");
    let fanout = builder.group(
        "fanout",
        GroupType::Foreach,
        json!({"input_path": "$.items", "parallel": true, "max_workers": 2}),
    );
    builder.step_in(
        "double",
        StepType::Code,
        code_config("return { v: input.item * 2 };"),
        Some(fanout),
    );
    builder.edge(a, fanout);
    let definition = builder.build();

    let engine = engine_for(definition.clone());
    let run_id = start_run(&engine, &definition, json!({"items": [1, 2, 3, 4]})).await;
    let outcome = engine.execute_run(run_id).await.unwrap();

    let run = match outcome {
        RunOutcome::Completed(run) => run,
        other => panic!("expected completion, got {:?}", other),
    };
    let output = run.output.unwrap();
    let group_output = &output["fanout"];
    assert_eq!(
        group_output["results"],
        json!([{"v": 2}, {"v": 4}, {"v": 6}, {"v": 8}])
    );
    assert_eq!(group_output["_meta"]["iterations"], json!(4));

    let double_runs: Vec<_> = engine
        .services()
        .run_store
        .list_step_runs(run.id)
        .await
        .unwrap()
        .into_iter()
        .filter(|sr| sr.step_name == "double")
        .collect();
    assert_eq!(double_runs.len(), 4);
    assert!(double_runs.iter().all(|sr| sr.attempt == 1));
}

/// Serves 500 twice, then 200 with `{"ok": true}`.
struct FlakyHttp {
    calls: AtomicU32,
}

#[async_trait]
impl HttpPort for FlakyHttp {
    async fn request(&self, _request: HttpRequest) -> Result<HttpResponse, CapabilityError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= 2 {
            Ok(HttpResponse {
                status: 500,
                status_text: "Internal Server Error".into(),
                headers: HashMap::new(),
                body: json!({}),
            })
        } else {
            Ok(HttpResponse {
                status: 200,
                status_text: "OK".into(),
                headers: HashMap::new(),
                body: json!({"ok": true}),
            })
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_try_catch_retries_until_success() {
    let mut builder = ProjectBuilder::new();
    let a = builder.start("A");
    let tc = builder.group(
        "guarded",
        GroupType::TryCatch,
        json!({"retry_count": 2, "retry_delay_ms": 10}),
    );
    let fetch = builder.step_in(
        "fetch",
        StepType::Tool,
        json!({"url": "https://api.example.com/flaky"}),
        Some(tc),
    );
    builder.edge(a, tc);
    let definition = builder.build();

    let engine = engine_with(vec![definition.clone()], vec![], |services| {
        services.http = Some(Arc::new(FlakyHttp {
            calls: AtomicU32::new(0),
        }));
    });
    let run_id = start_run(&engine, &definition, json!({})).await;
    let outcome = engine.execute_run(run_id).await.unwrap();

    let run = match outcome {
        RunOutcome::Completed(run) => run,
        other => panic!("expected completion, got {:?}", other),
    };
    let output = run.output.unwrap();
    assert_eq!(output["guarded"]["status"], json!(200));
    assert_eq!(output["guarded"]["body"], json!({"ok": true}));

    let attempts: Vec<u32> = engine
        .services()
        .run_store
        .list_step_runs(run.id)
        .await
        .unwrap()
        .into_iter()
        .filter(|sr| sr.step_id == fetch)
        .map(|sr| sr.attempt)
        .collect();
    assert_eq!(attempts, vec![1, 2, 3]);
}

/// Records the request and answers like the GitHub issues endpoint.
struct RecordingHttp {
    seen: Mutex<Option<HttpRequest>>,
}

#[async_trait]
impl HttpPort for RecordingHttp {
    async fn request(&self, request: HttpRequest) -> Result<HttpResponse, CapabilityError> {
        *self.seen.lock() = Some(request);
        Ok(HttpResponse {
            status: 201,
            status_text: "Created".into(),
            headers: HashMap::new(),
            body: json!({
                "id": 99001,
                "number": 17,
                "url": "https://api.github.com/repos/o/r/issues/17",
                "html_url": "https://github.com/o/r/issues/17",
                "state": "open"
            }),
        })
    }
}

struct OneSecret;

impl SecretResolver for OneSecret {
    fn resolve(&self, _tenant_id: Uuid) -> HashMap<String, String> {
        HashMap::from([("GITHUB_TOKEN".to_string(), "tk".to_string())])
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_block_inheritance_github_chain() {
    // http (system root) ← rest-api ← github-api ← github_create_issue
    let system = system_blocks();
    let http_id = system.iter().find(|b| b.slug == "http").unwrap().id;

    let mut rest = BlockDefinition::with_code("rest-api", "");
    rest.parent_block_id = Some(http_id);
    rest.pre_process = r#"
        var req = (typeof input === "object" && input !== null) ? input : {};
        req.headers = Object.assign({}, req.headers, {
            "Authorization": "Bearer " + (ctx.secrets.GITHUB_TOKEN || "")
        });
        return req;
    "#
    .into();

    let mut github = BlockDefinition::with_code("github-api", "");
    github.parent_block_id = Some(rest.id);
    github.config_defaults = json!({"base_url": "https://api.github.com"});

    let mut create_issue = BlockDefinition::with_code("github_create_issue", "");
    create_issue.parent_block_id = Some(github.id);
    create_issue.pre_process = r#"
        return {
            method: "POST",
            url: config.base_url + "/repos/" + config.owner + "/" + config.repo + "/issues",
            body: { title: config.title }
        };
    "#
    .into();
    create_issue.post_process = r#"
        return {
            id: output.body.id,
            number: output.body.number,
            url: output.body.url,
            html_url: output.body.html_url
        };
    "#
    .into();

    let mut builder = ProjectBuilder::new();
    let a = builder.start("A");
    let issue = builder.step(
        "create_issue",
        StepType::Custom("github_create_issue".into()),
        json!({"owner": "o", "repo": "r", "title": "t"}),
    );
    builder.edge(a, issue);
    let definition = builder.build();

    let http = Arc::new(RecordingHttp {
        seen: Mutex::new(None),
    });
    let http_for_services = http.clone();
    let engine = engine_with(
        vec![definition.clone()],
        vec![rest, github, create_issue],
        move |services| {
            services.http = Some(http_for_services);
            services.secrets = Arc::new(OneSecret);
        },
    );

    let run_id = start_run(&engine, &definition, json!({})).await;
    let outcome = engine.execute_run(run_id).await.unwrap();
    let run = match outcome {
        RunOutcome::Completed(run) => run,
        other => panic!("expected completion, got {:?}", other),
    };

    let request = http.seen.lock().clone().expect("request was sent");
    assert_eq!(request.method, "POST");
    assert_eq!(request.url, "https://api.github.com/repos/o/r/issues");
    assert_eq!(
        request.headers.get("Authorization").map(String::as_str),
        Some("Bearer tk")
    );
    assert_eq!(request.body.as_ref().unwrap()["title"], json!("t"));

    let output = run.output.unwrap();
    assert_eq!(
        output["create_issue"],
        json!({
            "id": 99001,
            "number": 17,
            "url": "https://api.github.com/repos/o/r/issues/17",
            "html_url": "https://github.com/o/r/issues/17"
        })
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cancellation_mid_while_loop() {
    let mut builder = ProjectBuilder::new();
    let a = builder.start("A");
    let looper = builder.group(
        "looper",
        GroupType::While,
        json!({"condition": "$.go", "max_iterations": 10000}),
    );
    builder.step_in(
        "pause",
        StepType::Wait,
        json!({"duration_ms": 200}),
        Some(looper),
    );
    builder.edge(a, looper);
    let definition = builder.build();

    let engine = engine_for(definition.clone());
    let run_id = start_run(&engine, &definition, json!({"go": true})).await;

    let driver = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.execute_run(run_id).await })
    };
    tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    engine.cancel_run(run_id).await.unwrap();

    let outcome = driver.await.unwrap().unwrap();
    let run = match outcome {
        RunOutcome::Cancelled(run) => run,
        other => panic!("expected cancellation, got {:?}", other),
    };

    let step_runs = engine
        .services()
        .run_store
        .list_step_runs(run.id)
        .await
        .unwrap();
    let last = step_runs
        .iter()
        .filter(|sr| sr.step_name == "pause")
        .max_by_key(|sr| sr.attempt)
        .unwrap();
    assert_eq!(last.status, StepRunStatus::Cancelled);

    // Cancelling a terminal run is rejected.
    let err = engine.cancel_run(run_id).await.unwrap_err();
    assert_eq!(err.code(), "INVALID_STATE");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_fail_fast_cancels_siblings() {
    let mut builder = ProjectBuilder::new();
    let a = builder.start("A");
    let par = builder.group(
        "race",
        GroupType::Parallel,
        json!({"max_concurrent": 0, "fail_fast": true}),
    );
    builder.step_in("slow1", StepType::Wait, json!({"duration_ms": 1500}), Some(par));
    builder.step_in(
        "bomb",
        StepType::Code,
        code_config("throw new Error('component exploded');"),
        Some(par),
    );
    builder.step_in("slow2", StepType::Wait, json!({"duration_ms": 1500}), Some(par));
    builder.edge(a, par);
    let definition = builder.build();

    let engine = engine_for(definition.clone());
    let run_id = start_run(&engine, &definition, json!({})).await;
    let outcome = engine.execute_run(run_id).await.unwrap();

    // No error-port edge is connected, so the failure fails the run.
    let run = match outcome {
        RunOutcome::Failed(run) => run,
        other => panic!("expected failure, got {:?}", other),
    };

    let step_runs = engine
        .services()
        .run_store
        .list_step_runs(run.id)
        .await
        .unwrap();
    let status_of = |name: &str| {
        step_runs
            .iter()
            .find(|sr| sr.step_name == name)
            .map(|sr| sr.status)
    };
    assert_eq!(status_of("bomb"), Some(StepRunStatus::Failed));
    assert_eq!(status_of("slow1"), Some(StepRunStatus::Cancelled));
    assert_eq!(status_of("slow2"), Some(StepRunStatus::Cancelled));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_fan_in_merges_by_rank() {
    let mut builder = ProjectBuilder::new();
    let a = builder.start("A");
    let b1 = builder.step(
        "b1",
        StepType::Code,
        code_config("return { x: 1, shared: 'b1' };"),
    );
    let b2 = builder.step(
        "b2",
        StepType::Code,
        code_config("return { y: 2, shared: 'b2' };"),
    );
    let join = builder.step("join_point", StepType::Code, code_config("return input;"));
    builder.edge(a, b1);
    builder.edge(a, b2);
    builder.edge(b1, join);
    builder.edge(b2, join);
    let definition = builder.build();

    let engine = engine_for(definition.clone());
    let run_id = start_run(&engine, &definition, json!({})).await;
    let outcome = engine.execute_run(run_id).await.unwrap();
    let run = match outcome {
        RunOutcome::Completed(run) => run,
        other => panic!("expected completion, got {:?}", other),
    };

    let output = run.output.unwrap();
    // Later topological rank overrides on key collision.
    assert_eq!(
        output["join_point"],
        json!({"x": 1, "y": 2, "shared": "b2"})
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_single_step_execution() {
    let mut builder = ProjectBuilder::new();
    let a = builder.start("A");
    let lone = builder.step(
        "lone",
        StepType::Code,
        code_config("return { tripled: input.n * 3 };"),
    );
    let after = builder.step("after", StepType::Code, code_config("return input;"));
    builder.edge(a, lone);
    builder.edge(lone, after);
    let definition = builder.build();

    let engine = engine_for(definition.clone());
    let run = engine
        .execute_single_step(
            definition.project.tenant_id,
            definition.project.id,
            lone,
            json!({"n": 4}),
        )
        .await
        .unwrap();

    assert_eq!(run.output.unwrap()["lone"], json!({"tripled": 12}));
    assert_eq!(run.triggered_by, TriggeredBy::Test);

    // Successors are never scheduled.
    let names: Vec<String> = engine
        .services()
        .run_store
        .list_step_runs(run.id)
        .await
        .unwrap()
        .into_iter()
        .map(|sr| sr.step_name)
        .collect();
    assert_eq!(names, vec!["lone".to_string()]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_approval_suspends_and_resumes() {
    let mut builder = ProjectBuilder::new();
    let a = builder.start("A");
    let gate = builder.step(
        "gate",
        StepType::HumanInLoop,
        json!({"prompt": "Deploy to production?"}),
    );
    builder.edge(a, gate);
    let definition = builder.build();

    let engine = engine_for(definition.clone());
    let run_id = start_run(&engine, &definition, json!({"build": 42})).await;

    let outcome = engine.execute_run(run_id).await.unwrap();
    match outcome {
        RunOutcome::WaitingApproval { approval_key, .. } => {
            assert!(approval_key.contains(&run_id.to_string()));
        }
        other => panic!("expected suspension, got {:?}", other),
    }

    engine
        .submit_approval(
            run_id,
            gate,
            ApprovalDecision {
                approved: true,
                comment: Some("ship it".into()),
                data: None,
                decided_at: chrono::Utc::now(),
            },
        )
        .await
        .unwrap();

    let outcome = engine.execute_run(run_id).await.unwrap();
    let run = match outcome {
        RunOutcome::Completed(run) => run,
        other => panic!("expected completion after approval, got {:?}", other),
    };
    let output = run.output.unwrap();
    assert_eq!(output["gate"]["approved"], json!(true));
    assert_eq!(output["gate"]["comment"], json!("ship it"));

    // The gate has two attempts: the suspended one and the resumed one.
    let attempts: Vec<u32> = engine
        .services()
        .run_store
        .list_step_runs(run_id)
        .await
        .unwrap()
        .into_iter()
        .filter(|sr| sr.step_name == "gate")
        .map(|sr| sr.attempt)
        .collect();
    assert_eq!(attempts, vec![1, 2]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_subflow_invocation() {
    let mut child_builder = ProjectBuilder::new();
    let child_start = child_builder.start("child_start");
    let compute = child_builder.step(
        "compute",
        StepType::Code,
        code_config("return { sum: input.a + input.b };"),
    );
    child_builder.edge(child_start, compute);
    let child = child_builder.build();
    let child_id = child.project.id;

    let mut parent_builder = ProjectBuilder::new();
    let a = parent_builder.start("A");
    let call = parent_builder.step(
        "call_child",
        StepType::Subflow,
        json!({"project_id": child_id.to_string(), "input": {"a": 2, "b": 3}}),
    );
    parent_builder.edge(a, call);
    let parent = parent_builder.build();

    let engine = engine_with(vec![parent.clone(), child], vec![], |_| {});
    let run_id = start_run(&engine, &parent, json!({})).await;
    let outcome = engine.execute_run(run_id).await.unwrap();
    let run = match outcome {
        RunOutcome::Completed(run) => run,
        other => panic!("expected completion, got {:?}", other),
    };

    let output = run.output.unwrap();
    assert_eq!(output["call_child"]["compute"], json!({"sum": 5}));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_while_zero_cap_routes_out_when_condition_false() {
    let mut builder = ProjectBuilder::new();
    let a = builder.start("A");
    let looper = builder.group(
        "looper",
        GroupType::While,
        json!({"condition": "$.go", "max_iterations": 0}),
    );
    builder.step_in(
        "body",
        StepType::Code,
        code_config("return input;"),
        Some(looper),
    );
    builder.edge(a, looper);
    let definition = builder.build();

    let engine = engine_for(definition.clone());
    let run_id = start_run(&engine, &definition, json!({"go": false})).await;
    let outcome = engine.execute_run(run_id).await.unwrap();
    let run = match outcome {
        RunOutcome::Completed(run) => run,
        other => panic!("expected completion, got {:?}", other),
    };
    assert_eq!(run.output.unwrap()["looper"]["_meta"]["iterations"], json!(0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_while_zero_cap_errors_when_condition_true() {
    let mut builder = ProjectBuilder::new();
    let a = builder.start("A");
    let looper = builder.group(
        "looper",
        GroupType::While,
        json!({"condition": "$.go", "max_iterations": 0}),
    );
    builder.step_in(
        "body",
        StepType::Code,
        code_config("return input;"),
        Some(looper),
    );
    builder.edge(a, looper);
    let definition = builder.build();

    let engine = engine_for(definition.clone());
    let run_id = start_run(&engine, &definition, json!({"go": true})).await;
    let outcome = engine.execute_run(run_id).await.unwrap();
    match outcome {
        RunOutcome::Failed(run) => {
            assert!(run.error.unwrap().contains("max_iterations"));
        }
        other => panic!("expected failure, got {:?}", other),
    }
}
