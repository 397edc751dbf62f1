// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Run orchestrator.
//!
//! Drives a run from its start step through the DAG: ready-set
//! scheduling with branch pruning, input buffering with deterministic
//! fan-in merging, group dispatch, cancellation, and resume. Group
//! interiors run through the same scope loop ([`run_scope`]) with their
//! group id as the scope, which keeps nesting a plain recursion.

use crate::context::{EngineServices, RunContext};
use crate::dag::ProjectGraph;
use crate::error::{EngineError, Result};
use crate::executor::capabilities::{StepScope, SubflowRunner};
use crate::executor::group::{unit_name, GroupExecutor};
use crate::executor::step::StepExecutor;
use crate::expr::{deep_merge, evaluate};
use crate::model::{
    Edge, JobPriority, NewRun, Run, RunStatus, StepRunStatus, StepType, TriggeredBy,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use flowgraph_sandbox::CancelFlag;
use flowgraph_state::model::Job;
use flowgraph_state::traits::{ApprovalStore, JobQueue, RunStore};
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Weak};
use tracing::{info, warn};
use uuid::Uuid;

/// Materialized outputs carried into a resumed run; consumed once so
/// loop iterations re-execute fresh.
pub type Preseed = Arc<Mutex<HashMap<Uuid, Value>>>;

/// Result of draining one scope.
pub struct ScopeOutcome {
    /// Output per completed unit.
    pub outputs: HashMap<Uuid, Value>,
    /// Units pruned by branch selection.
    pub skipped: HashSet<Uuid>,
}

/// Units (steps and groups) whose parent scope is `scope`, ordered by
/// topological rank.
pub(crate) fn scope_units(rctx: &RunContext, scope: Option<Uuid>) -> Vec<Uuid> {
    let mut units: Vec<Uuid> = rctx
        .definition
        .steps
        .iter()
        .filter(|s| s.block_group_id == scope)
        .map(|s| s.id)
        .chain(
            rctx.definition
                .groups
                .iter()
                .filter(|g| g.parent_group_id == scope)
                .map(|g| g.id),
        )
        .collect();
    units.sort_by_key(|id| rctx.graph.rank(*id));
    units
}

/// Body entry units of a group: members with no in-scope incoming edge.
pub(crate) fn scope_entries(rctx: &RunContext, group_id: Uuid) -> Vec<Uuid> {
    let units = scope_units(rctx, Some(group_id));
    let unit_set: HashSet<Uuid> = units.iter().copied().collect();
    units
        .into_iter()
        .filter(|unit| {
            rctx.graph
                .incoming(*unit)
                .iter()
                .all(|e| !unit_set.contains(&e.source_step_id))
        })
        .collect()
}

/// Whether an edge fires for the produced output.
///
/// A labeled edge requires the matching branch label; `out` doubles as
/// the default success port for units that emit no label. Unlabeled
/// edges are always active, subject to their guard condition.
fn edge_active(edge: &Edge, branch: Option<&str>, output: &Value) -> Result<bool> {
    let port_ok = match (edge.source_port.as_deref(), branch) {
        (None, _) => true,
        (Some(port), Some(label)) => port == label,
        (Some(port), None) => port == "out",
    };
    if !port_ok {
        return Ok(false);
    }
    match &edge.condition {
        Some(condition) => evaluate(condition, output),
        None => Ok(true),
    }
}

/// Drains one scope: executes entries and everything they activate.
///
/// Boxed so group dispatch can recurse through it.
pub(crate) fn run_scope(
    rctx: RunContext,
    scope: Option<Uuid>,
    entries: Vec<(Uuid, Value)>,
    preseed: Preseed,
    subflow: Option<Arc<dyn SubflowRunner>>,
) -> BoxFuture<'static, Result<ScopeOutcome>> {
    async move {
        let units = scope_units(&rctx, scope);
        let unit_set: HashSet<Uuid> = units.iter().copied().collect();
        let group_ids: HashSet<Uuid> = rctx
            .definition
            .groups
            .iter()
            .filter(|g| g.parent_group_id == scope)
            .map(|g| g.id)
            .collect();
        let in_scope_edges: Vec<Edge> = rctx
            .definition
            .edges
            .iter()
            .filter(|e| {
                unit_set.contains(&e.source_step_id) && unit_set.contains(&e.target_step_id)
            })
            .cloned()
            .collect();

        let mut incoming_count: HashMap<Uuid, usize> = HashMap::new();
        for edge in &in_scope_edges {
            *incoming_count.entry(edge.target_step_id).or_default() += 1;
        }

        let mut resolved_in: HashMap<Uuid, usize> = HashMap::new();
        let mut buffers: HashMap<Uuid, Vec<(usize, Value)>> = HashMap::new();
        let mut ready: BTreeSet<(usize, Uuid)> = BTreeSet::new();
        let mut ready_inputs: HashMap<Uuid, Value> = HashMap::new();
        let mut dispatched: HashSet<Uuid> = HashSet::new();
        let mut outputs: HashMap<Uuid, Value> = HashMap::new();
        let mut skipped: HashSet<Uuid> = HashSet::new();

        for (unit, input) in entries {
            if unit_set.contains(&unit) {
                ready.insert((rctx.graph.rank(unit), unit));
                ready_inputs.insert(unit, input);
            }
        }

        while let Some((_, unit)) = ready.pop_first() {
            if dispatched.contains(&unit) {
                continue;
            }
            dispatched.insert(unit);

            if rctx.is_cancelled().await {
                return Err(EngineError::Cancelled);
            }

            let input = ready_inputs.remove(&unit).unwrap_or(Value::Null);
            let replayed = preseed.lock().remove(&unit);

            let (output, branch): (Value, Option<String>) = if let Some(output) = replayed {
                let branch = output
                    .get("__branch")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                (output, branch)
            } else if group_ids.contains(&unit) {
                let group = rctx.definition.group(unit)?.clone();
                let outcome = GroupExecutor::execute(
                    rctx.clone(),
                    &group,
                    input,
                    preseed.clone(),
                    subflow.clone(),
                )
                .await?;
                if outcome.port == "error" {
                    let error_edge_connected = in_scope_edges.iter().any(|e| {
                        e.source_step_id == unit && e.source_port.as_deref() == Some("error")
                    });
                    if !error_edge_connected {
                        return Err(outcome.error.unwrap_or_else(|| {
                            EngineError::internal("group failed with no error payload")
                        }));
                    }
                }
                (outcome.output, Some(outcome.port.to_string()))
            } else {
                let step = rctx.definition.step(unit)?.clone();
                let output = StepExecutor::execute(&rctx, &step, input, subflow.clone()).await?;
                let branch = output
                    .get("__branch")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                (output, branch)
            };

            outputs.insert(unit, output.clone());

            // Resolve this unit's outgoing edges, then cascade skip
            // state through targets whose every feed is settled.
            let mut settle: VecDeque<Uuid> = VecDeque::new();
            for edge in in_scope_edges.iter().filter(|e| e.source_step_id == unit) {
                let active = edge_active(edge, branch.as_deref(), &output)?;
                *resolved_in.entry(edge.target_step_id).or_default() += 1;
                if active {
                    buffers
                        .entry(edge.target_step_id)
                        .or_default()
                        .push((rctx.graph.rank(unit), output.clone()));
                }
                settle.push_back(edge.target_step_id);
            }

            while let Some(target) = settle.pop_front() {
                if dispatched.contains(&target) || skipped.contains(&target) {
                    continue;
                }
                let expected = incoming_count.get(&target).copied().unwrap_or(0);
                let resolved = resolved_in.get(&target).copied().unwrap_or(0);
                if resolved < expected {
                    continue;
                }
                match buffers.remove(&target) {
                    Some(mut feeds) if !feeds.is_empty() => {
                        // Deterministic fan-in: merge in predecessor
                        // rank order, later ranks overriding.
                        feeds.sort_by_key(|(rank, _)| *rank);
                        let merged = if feeds.len() == 1 {
                            feeds.pop().map(|(_, v)| v).unwrap_or(Value::Null)
                        } else {
                            feeds
                                .into_iter()
                                .fold(Value::Null, |acc, (_, v)| match acc {
                                    Value::Null => v,
                                    acc => deep_merge(&acc, &v),
                                })
                        };
                        ready.insert((rctx.graph.rank(target), target));
                        ready_inputs.insert(target, merged);
                    }
                    _ => {
                        // Every feed pruned: the target is skipped and
                        // its own edges resolve as inactive.
                        skipped.insert(target);
                        for edge in
                            in_scope_edges.iter().filter(|e| e.source_step_id == target)
                        {
                            *resolved_in.entry(edge.target_step_id).or_default() += 1;
                            settle.push_back(edge.target_step_id);
                        }
                    }
                }
            }
        }

        Ok(ScopeOutcome { outputs, skipped })
    }
    .boxed()
}

/// How a driven run ended, from the worker's point of view.
#[derive(Debug)]
pub enum RunOutcome {
    /// All reachable steps done or skipped.
    Completed(Run),
    /// An unhandled step failure.
    Failed(Run),
    /// Cancellation observed.
    Cancelled(Run),
    /// Suspended at a human-in-loop gate; resumed by an approval event.
    WaitingApproval {
        /// The suspended run.
        run: Run,
        /// Key the approval event must resolve.
        approval_key: String,
    },
    /// A long `wait` step wants the run re-delivered later.
    Delayed {
        /// The parked run.
        run: Run,
        /// Earliest re-delivery time.
        resume_at: DateTime<Utc>,
    },
}

/// Parameters for creating a run.
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// Owning tenant.
    pub tenant_id: Uuid,
    /// Project to execute.
    pub project_id: Uuid,
    /// Snapshot version (0 = draft).
    pub version: u32,
    /// Start step; optional when the project has exactly one.
    pub start_step_id: Option<Uuid>,
    /// Trigger source.
    pub triggered_by: TriggeredBy,
    /// Input payload.
    pub input: Value,
    /// Queue priority.
    pub priority: JobPriority,
    /// Webhook idempotency key, carried on the job.
    pub idempotency_key: Option<String>,
}

/// The workflow engine: run creation, orchestration, cancellation,
/// resume, and approvals.
pub struct Engine {
    services: Arc<EngineServices>,
    active: DashMap<Uuid, CancelFlag>,
    this: Weak<Engine>,
}

impl Engine {
    /// Creates the engine.
    pub fn new(services: Arc<EngineServices>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            services,
            active: DashMap::new(),
            this: weak.clone(),
        })
    }

    /// Shared services.
    pub fn services(&self) -> Arc<EngineServices> {
        self.services.clone()
    }

    fn subflow_handle(&self) -> Option<Arc<dyn SubflowRunner>> {
        self.this
            .upgrade()
            .map(|engine| engine as Arc<dyn SubflowRunner>)
    }

    /// Creates a pending run and enqueues its job.
    pub async fn create_run(&self, request: RunRequest) -> Result<Run> {
        let definition = self
            .services
            .definitions
            .definition(request.project_id, request.version)
            .await?;

        let start_step_id = match request.start_step_id {
            Some(id) => {
                let step = definition.step(id)?;
                if step.step_type != StepType::Start {
                    return Err(EngineError::validation(format!(
                        "step '{}' is not a start step",
                        step.name
                    )));
                }
                id
            }
            None => {
                let starts = definition.start_steps();
                match starts.len() {
                    1 => starts[0].id,
                    0 => {
                        return Err(EngineError::validation("project has no start step"));
                    }
                    _ => {
                        return Err(EngineError::validation(
                            "project has multiple start steps; start_step_id is required",
                        ));
                    }
                }
            }
        };

        let run = self
            .services
            .run_store
            .create_run(NewRun {
                tenant_id: request.tenant_id,
                project_id: request.project_id,
                project_version: definition.project.version,
                start_step_id,
                triggered_by: request.triggered_by,
                input: request.input,
            })
            .await?;

        let mut job = Job::for_run(&run, request.priority);
        job.idempotency_key = request.idempotency_key;
        self.services.job_queue.enqueue(job).await?;
        info!(run_id = %run.id, run_number = run.run_number, "run created");
        Ok(run)
    }

    /// Drives a run to its next stopping point.
    ///
    /// Steps completed by a prior delivery are replayed from their
    /// materialized outputs, so a reclaimed or resumed run re-executes
    /// only the remainder.
    pub async fn execute_run(&self, run_id: Uuid) -> Result<RunOutcome> {
        let run = self.services.run_store.get_run(run_id).await?;
        if run.status.is_terminal() {
            // At-least-once delivery: a duplicate job for a settled run
            // completes without re-executing anything.
            return Ok(match run.status {
                RunStatus::Completed => RunOutcome::Completed(run),
                RunStatus::Cancelled => RunOutcome::Cancelled(run),
                _ => RunOutcome::Failed(run),
            });
        }

        let definition = self
            .services
            .definitions
            .definition(run.project_id, run.project_version)
            .await?;
        let graph = Arc::new(ProjectGraph::build(&definition)?);
        let cancel = self
            .active
            .entry(run.id)
            .or_insert_with(CancelFlag::new)
            .clone();

        let run = self
            .services
            .run_store
            .update_run_status(run.id, RunStatus::Running, None, None)
            .await?;

        let rctx = RunContext {
            run: Arc::new(run.clone()),
            definition,
            graph,
            cancel,
            services: self.services.clone(),
        };

        let preseed = self.preseed_for(run.id).await?;
        let entries = vec![(run.start_step_id, run.input.clone())];
        let scope_future = run_scope(rctx.clone(), None, entries, preseed, self.subflow_handle());
        let result = match rctx.definition.project.run_timeout_ms {
            Some(limit) => {
                let limit = std::time::Duration::from_millis(limit);
                match tokio::time::timeout(limit, scope_future).await {
                    Ok(inner) => inner,
                    Err(_) => {
                        // The run deadline wins over whatever is in
                        // flight; sandbox executions observe the flag.
                        rctx.cancel.cancel();
                        Err(EngineError::Timeout { elapsed: limit })
                    }
                }
            }
            None => scope_future.await,
        };
        self.active.remove(&run.id);

        let store = &self.services.run_store;
        match result {
            Ok(scope_outcome) => {
                let output = self.run_output(&rctx, &scope_outcome);
                let run = store
                    .update_run_status(run.id, RunStatus::Completed, Some(output), None)
                    .await?;
                info!(run_id = %run.id, "run completed");
                Ok(RunOutcome::Completed(run))
            }
            Err(EngineError::Cancelled) => {
                let run = store
                    .update_run_status(run.id, RunStatus::Cancelled, None, None)
                    .await?;
                info!(run_id = %run.id, "run cancelled");
                Ok(RunOutcome::Cancelled(run))
            }
            Err(EngineError::WaitingApproval { approval_key }) => {
                let run = store
                    .update_run_status(run.id, RunStatus::WaitingApproval, None, None)
                    .await?;
                info!(run_id = %run.id, %approval_key, "run waiting for approval");
                Ok(RunOutcome::WaitingApproval { run, approval_key })
            }
            Err(EngineError::Delayed { resume_at }) => {
                let run = store
                    .update_run_status(run.id, RunStatus::Pending, None, None)
                    .await?;
                info!(run_id = %run.id, %resume_at, "run delayed");
                Ok(RunOutcome::Delayed { run, resume_at })
            }
            Err(err) => {
                warn!(run_id = %run.id, error = %err, "run failed");
                let run = store
                    .update_run_status(run.id, RunStatus::Failed, None, Some(err.to_string()))
                    .await?;
                Ok(RunOutcome::Failed(run))
            }
        }
    }

    /// Latest completed output per step, for replay.
    async fn preseed_for(&self, run_id: Uuid) -> Result<Preseed> {
        let mut latest: HashMap<Uuid, (u32, StepRunStatus, Option<Value>)> = HashMap::new();
        for step_run in self.services.run_store.list_step_runs(run_id).await? {
            let entry = latest.entry(step_run.step_id).or_insert((
                step_run.attempt,
                step_run.status,
                step_run.output.clone(),
            ));
            if step_run.attempt >= entry.0 {
                *entry = (step_run.attempt, step_run.status, step_run.output);
            }
        }
        let map: HashMap<Uuid, Value> = latest
            .into_iter()
            .filter_map(|(step_id, (_, status, output))| {
                (status == StepRunStatus::Completed)
                    .then_some(output)
                    .flatten()
                    .map(|value| (step_id, value))
            })
            .collect();
        Ok(Arc::new(Mutex::new(map)))
    }

    /// Default run output: terminal unit name → output.
    fn run_output(&self, rctx: &RunContext, outcome: &ScopeOutcome) -> Value {
        let done: HashSet<Uuid> = outcome.outputs.keys().copied().collect();
        let mut map = Map::new();
        for id in rctx.graph.terminals(&done) {
            map.insert(unit_name(rctx, id), outcome.outputs[&id].clone());
        }
        Value::Object(map)
    }

    /// Sets the cancellation flag; the orchestrator observes it at the
    /// next step boundary. `INVALID_STATE` when the run is terminal.
    pub async fn cancel_run(&self, run_id: Uuid) -> Result<Run> {
        let run = self.services.run_store.request_cancel(run_id).await?;
        if let Some(flag) = self.active.get(&run_id) {
            flag.cancel();
        }
        info!(run_id = %run_id, "cancellation requested");
        Ok(run)
    }

    /// Forks a new run starting at `from_step_id`. The prior run is not
    /// mutated; history is preserved.
    pub async fn resume_from_step(
        &self,
        run_id: Uuid,
        from_step_id: Uuid,
        input_override: Option<Value>,
    ) -> Result<Run> {
        let original = self.services.run_store.get_run(run_id).await?;
        let definition = self
            .services
            .definitions
            .definition(original.project_id, original.project_version)
            .await?;
        let step = definition.step(from_step_id)?;
        if step.block_group_id.is_some() {
            return Err(EngineError::validation(
                "cannot resume from a step inside a block group",
            ));
        }

        let input = match input_override {
            Some(value) => value,
            None => {
                let prior = self
                    .services
                    .run_store
                    .list_step_runs(run_id)
                    .await?
                    .into_iter()
                    .filter(|sr| sr.step_id == from_step_id)
                    .max_by_key(|sr| sr.attempt);
                prior.map(|sr| sr.input).unwrap_or(original.input.clone())
            }
        };

        let run = self
            .services
            .run_store
            .create_run(NewRun {
                tenant_id: original.tenant_id,
                project_id: original.project_id,
                project_version: original.project_version,
                start_step_id: from_step_id,
                triggered_by: TriggeredBy::Manual,
                input,
            })
            .await?;
        self.services
            .job_queue
            .enqueue(Job::for_run(&run, JobPriority::Normal))
            .await?;
        info!(original = %run_id, resumed = %run.id, "run forked for resume");
        Ok(run)
    }

    /// Executes a single step as an ephemeral test run; no successors
    /// are scheduled.
    pub async fn execute_single_step(
        &self,
        tenant_id: Uuid,
        project_id: Uuid,
        step_id: Uuid,
        input: Value,
    ) -> Result<Run> {
        let definition = self.services.definitions.definition(project_id, 0).await?;
        let graph = Arc::new(ProjectGraph::build(&definition)?);
        let step = definition.step(step_id)?.clone();

        let run = self
            .services
            .run_store
            .create_run(NewRun {
                tenant_id,
                project_id,
                project_version: definition.project.version,
                start_step_id: step_id,
                triggered_by: TriggeredBy::Test,
                input: input.clone(),
            })
            .await?;
        let run = self
            .services
            .run_store
            .update_run_status(run.id, RunStatus::Running, None, None)
            .await?;

        let rctx = RunContext {
            run: Arc::new(run.clone()),
            definition,
            graph,
            cancel: CancelFlag::new(),
            services: self.services.clone(),
        };

        let store = &self.services.run_store;
        match StepExecutor::execute(&rctx, &step, input, self.subflow_handle()).await {
            Ok(output) => {
                let mut map = Map::new();
                map.insert(step.name.clone(), output);
                Ok(store
                    .update_run_status(
                        run.id,
                        RunStatus::Completed,
                        Some(Value::Object(map)),
                        None,
                    )
                    .await?)
            }
            Err(err) => Ok(store
                .update_run_status(run.id, RunStatus::Failed, None, Some(err.to_string()))
                .await?),
        }
    }

    /// Records an approval decision and re-enqueues the suspended run.
    pub async fn submit_approval(
        &self,
        run_id: Uuid,
        step_id: Uuid,
        decision: crate::model::ApprovalDecision,
    ) -> Result<Run> {
        let key = StepScope {
            tenant_id: Uuid::nil(),
            project_id: Uuid::nil(),
            run_id,
            step_id,
            step_run_id: Uuid::nil(),
        }
        .approval_key();
        self.services.approvals.submit(&key, decision).await?;

        let run = self.services.run_store.get_run(run_id).await?;
        if run.status != RunStatus::WaitingApproval {
            return Err(EngineError::InvalidState {
                message: format!("run {} is not waiting for approval", run_id),
            });
        }
        let run = self
            .services
            .run_store
            .update_run_status(run_id, RunStatus::Pending, None, None)
            .await?;
        self.services
            .job_queue
            .enqueue(Job::for_run(&run, JobPriority::High))
            .await?;
        info!(run_id = %run_id, "approval submitted, run re-enqueued");
        Ok(run)
    }
}

#[async_trait::async_trait]
impl SubflowRunner for Engine {
    async fn run_subflow(
        &self,
        tenant_id: Uuid,
        project_id: Uuid,
        start_step_id: Option<Uuid>,
        input: Value,
    ) -> Result<Value> {
        let definition = self.services.definitions.definition(project_id, 0).await?;

        let start_step_id = match start_step_id {
            Some(id) => {
                definition.step(id)?;
                id
            }
            None => {
                let starts = definition.start_steps();
                match starts.len() {
                    1 => starts[0].id,
                    _ => {
                        return Err(EngineError::validation(
                            "sub-workflow target has multiple start steps; \
                             pass start_step_id explicitly",
                        ));
                    }
                }
            }
        };

        let run = self
            .services
            .run_store
            .create_run(NewRun {
                tenant_id,
                project_id,
                project_version: definition.project.version,
                start_step_id,
                triggered_by: TriggeredBy::Internal,
                input,
            })
            .await?;

        match self.execute_run(run.id).await? {
            RunOutcome::Completed(run) => Ok(run.output.unwrap_or(Value::Null)),
            RunOutcome::Failed(run) => Err(EngineError::internal(format!(
                "sub-workflow failed: {}",
                run.error.unwrap_or_default()
            ))),
            RunOutcome::Cancelled(_) => Err(EngineError::Cancelled),
            RunOutcome::WaitingApproval { .. } | RunOutcome::Delayed { .. } => {
                Err(EngineError::validation(
                    "sub-workflows may not suspend; remove approval gates and long \
                     waits from the target project",
                ))
            }
        }
    }
}
