// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Group executor.
//!
//! Each block group runs as a nested orchestration over its body scope,
//! with its own ready set and input buffers (see
//! [`crate::executor::run::run_scope`]). All four variants share the
//! pre/post-process wrapping and the two exit ports: `out` on success,
//! `error` on final failure. Cancellation is checked at iteration and
//! component boundaries.

use crate::context::RunContext;
use crate::error::{EngineError, Result};
use crate::executor::capabilities::SubflowRunner;
use crate::executor::run::{run_scope, scope_entries, scope_units, Preseed, ScopeOutcome};
use crate::expr::evaluate;
use crate::model::{
    BlockGroup, ForeachConfig, GroupType, ParallelConfig, TryCatchConfig, WhileConfig,
};
use chrono::Utc;
use flowgraph_sandbox::{
    CancelFlag, Capabilities, ExecutionSpec, NullCapabilities, SandboxRuntime,
};
use serde_json::{json, Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{info, warn};
use uuid::Uuid;

/// How a group resolved.
pub struct GroupOutcome {
    /// Exit port: `out` or `error`.
    pub port: &'static str,
    /// Payload deposited on the port.
    pub output: Value,
    /// The failure behind an `error` exit, for propagation when the
    /// port is not connected.
    pub error: Option<EngineError>,
}

impl GroupOutcome {
    fn out(output: Value) -> Self {
        Self {
            port: "out",
            output,
            error: None,
        }
    }

    fn error(output: Value, error: EngineError) -> Self {
        Self {
            port: "error",
            output,
            error: Some(error),
        }
    }
}

/// Executes block groups.
pub struct GroupExecutor;

impl GroupExecutor {
    /// Runs a group against its input.
    ///
    /// `Err` is reserved for control flow (cancellation, suspension,
    /// delay) and internal faults; body failures resolve to the `error`
    /// port.
    pub async fn execute(
        rctx: RunContext,
        group: &BlockGroup,
        input: Value,
        preseed: Preseed,
        subflow: Option<Arc<dyn SubflowRunner>>,
    ) -> Result<GroupOutcome> {
        if rctx.is_cancelled().await {
            return Err(EngineError::Cancelled);
        }

        let input = match &group.pre_process {
            Some(snippet) => run_group_snippet(&rctx, snippet, &input, None).await?,
            None => input,
        };

        info!(run_id = %rctx.run.id, group = %group.name, kind = ?group.group_type, "entering group");

        let mut outcome = match group.group_type {
            GroupType::Parallel => {
                Self::execute_parallel(&rctx, group, input, preseed, subflow).await?
            }
            GroupType::TryCatch => {
                Self::execute_try_catch(&rctx, group, input, preseed, subflow).await?
            }
            GroupType::Foreach => {
                Self::execute_foreach(&rctx, group, input, preseed, subflow).await?
            }
            GroupType::While => Self::execute_while(&rctx, group, input, preseed, subflow).await?,
        };

        if outcome.port == "out" {
            if let Some(snippet) = &group.post_process {
                outcome.output =
                    run_group_snippet(&rctx, snippet, &outcome.output, Some(&outcome.output))
                        .await?;
            }
        }
        Ok(outcome)
    }

    /// `parallel`: weakly-connected components of the body fan out
    /// concurrently under the configured bound.
    async fn execute_parallel(
        rctx: &RunContext,
        group: &BlockGroup,
        input: Value,
        preseed: Preseed,
        subflow: Option<Arc<dyn SubflowRunner>>,
    ) -> Result<GroupOutcome> {
        let config: ParallelConfig =
            serde_json::from_value(group.config.clone()).unwrap_or(ParallelConfig {
                max_concurrent: 0,
                fail_fast: false,
            });
        let components = connected_components(rctx, group.id);
        if components.is_empty() {
            return Ok(GroupOutcome::out(input));
        }

        let permits = if config.max_concurrent == 0 {
            components.len()
        } else {
            config.max_concurrent
        };
        let semaphore = Arc::new(Semaphore::new(permits));

        // Component tasks share a group-level flag so fail_fast can stop
        // siblings; run-level cancellation reaches them through the
        // persisted flag check inside the scope loop.
        let group_cancel = CancelFlag::new();
        let mut handles = Vec::with_capacity(components.len());
        for component in &components {
            let entries: Vec<(Uuid, Value)> = component
                .entries
                .iter()
                .map(|id| (*id, input.clone()))
                .collect();
            let mut child = rctx.clone();
            child.cancel = group_cancel.clone();
            let semaphore = semaphore.clone();
            let preseed = preseed.clone();
            let subflow = subflow.clone();
            let scope = Some(group.id);
            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                run_scope(child, scope, entries, preseed, subflow).await
            }));
        }

        let mut outputs: Map<String, Value> = Map::new();
        let mut first_error: Option<EngineError> = None;
        for (component, handle) in components.iter().zip(handles) {
            let result = handle
                .await
                .map_err(|e| EngineError::internal(format!("component task failed: {}", e)))?;
            match result {
                Ok(scope_outcome) => {
                    outputs.insert(
                        component.key.clone(),
                        aggregate_scope(rctx, group.id, &scope_outcome),
                    );
                }
                Err(EngineError::Cancelled) if first_error.is_some() => {
                    // Sibling stopped by fail_fast; the triggering error
                    // already routes to the error port.
                }
                Err(err @ (EngineError::WaitingApproval { .. } | EngineError::Delayed { .. })) => {
                    return Err(err);
                }
                Err(EngineError::Cancelled) => return Err(EngineError::Cancelled),
                Err(err) => {
                    if first_error.is_none() {
                        warn!(group = %group.name, error = %err, "parallel component failed");
                        first_error = Some(err);
                        if config.fail_fast {
                            group_cancel.cancel();
                        }
                    }
                }
            }
        }

        if rctx.is_cancelled().await {
            return Err(EngineError::Cancelled);
        }

        match first_error {
            None => Ok(GroupOutcome::out(Value::Object(outputs))),
            Some(err) => Ok(GroupOutcome::error(
                json!({ "error": err.to_string(), "input": input }),
                err,
            )),
        }
    }

    /// `try_catch`: the body is one sub-DAG, re-executed on failure up
    /// to `retry_count` more times.
    async fn execute_try_catch(
        rctx: &RunContext,
        group: &BlockGroup,
        input: Value,
        preseed: Preseed,
        subflow: Option<Arc<dyn SubflowRunner>>,
    ) -> Result<GroupOutcome> {
        let config: TryCatchConfig =
            serde_json::from_value(group.config.clone()).unwrap_or(TryCatchConfig {
                retry_count: 0,
                retry_delay_ms: 0,
            });

        let mut last_error = None;
        for attempt in 0..=config.retry_count {
            if rctx.is_cancelled().await {
                return Err(EngineError::Cancelled);
            }
            if attempt > 0 {
                tokio::time::sleep(Duration::from_millis(config.retry_delay_ms)).await;
            }

            let entries = scope_entries(rctx, group.id)
                .into_iter()
                .map(|id| (id, input.clone()))
                .collect();
            match run_scope(
                rctx.clone(),
                Some(group.id),
                entries,
                preseed.clone(),
                subflow.clone(),
            )
            .await
            {
                Ok(scope_outcome) => {
                    return Ok(GroupOutcome::out(aggregate_scope(
                        rctx,
                        group.id,
                        &scope_outcome,
                    )));
                }
                Err(
                    err @ (EngineError::Cancelled
                    | EngineError::WaitingApproval { .. }
                    | EngineError::Delayed { .. }),
                ) => return Err(err),
                Err(err) => {
                    warn!(group = %group.name, attempt, error = %err, "try_catch body failed");
                    last_error = Some(err);
                }
            }
        }

        let err = last_error.unwrap_or_else(|| EngineError::internal("empty try_catch body"));
        Ok(GroupOutcome::error(
            json!({ "error": err.to_string(), "input": input }),
            err,
        ))
    }

    /// `foreach`: the body runs once per element of the array at
    /// `input_path`; iterations fan out when `parallel` is set.
    async fn execute_foreach(
        rctx: &RunContext,
        group: &BlockGroup,
        input: Value,
        preseed: Preseed,
        subflow: Option<Arc<dyn SubflowRunner>>,
    ) -> Result<GroupOutcome> {
        let config: ForeachConfig = serde_json::from_value(group.config.clone())
            .map_err(|e| EngineError::validation(format!("foreach config: {}", e)))?;

        let items = match crate::expr::get_path(&input, &config.input_path) {
            Some(Value::Array(items)) => items.clone(),
            Some(_) | None => {
                let err = EngineError::validation(format!(
                    "foreach input path '{}' does not resolve to an array",
                    config.input_path
                ));
                return Ok(GroupOutcome::error(
                    json!({ "error": err.to_string(), "input": input }),
                    err,
                ));
            }
        };

        let element_inputs: Vec<Value> = items
            .iter()
            .enumerate()
            .map(|(index, item)| json!({ "item": item, "index": index, "context": input }))
            .collect();

        let results = if config.parallel {
            let semaphore = Arc::new(Semaphore::new(config.max_workers.max(1)));
            let mut handles = Vec::with_capacity(element_inputs.len());
            for element in element_inputs {
                let entries: Vec<(Uuid, Value)> = scope_entries(rctx, group.id)
                    .into_iter()
                    .map(|id| (id, element.clone()))
                    .collect();
                let child = rctx.clone();
                let semaphore = semaphore.clone();
                let preseed = preseed.clone();
                let subflow = subflow.clone();
                let scope = Some(group.id);
                handles.push(tokio::spawn(async move {
                    let _permit = semaphore.acquire_owned().await;
                    run_scope(child, scope, entries, preseed, subflow).await
                }));
            }
            let mut results = Vec::with_capacity(handles.len());
            for handle in handles {
                results.push(handle.await.map_err(|e| {
                    EngineError::internal(format!("foreach task failed: {}", e))
                })?);
            }
            results
        } else {
            let mut results = Vec::with_capacity(element_inputs.len());
            for element in element_inputs {
                if rctx.is_cancelled().await {
                    return Err(EngineError::Cancelled);
                }
                let entries = scope_entries(rctx, group.id)
                    .into_iter()
                    .map(|id| (id, element.clone()))
                    .collect();
                results.push(
                    run_scope(
                        rctx.clone(),
                        Some(group.id),
                        entries,
                        preseed.clone(),
                        subflow.clone(),
                    )
                    .await,
                );
            }
            results
        };

        let mut outputs = Vec::with_capacity(results.len());
        for (index, result) in results.into_iter().enumerate() {
            match result {
                Ok(scope_outcome) => {
                    outputs.push(aggregate_scope(rctx, group.id, &scope_outcome))
                }
                Err(
                    err @ (EngineError::Cancelled
                    | EngineError::WaitingApproval { .. }
                    | EngineError::Delayed { .. }),
                ) => return Err(err),
                Err(err) => {
                    warn!(group = %group.name, index, error = %err, "foreach element failed");
                    return Ok(GroupOutcome::error(
                        json!({ "error": err.to_string(), "index": index, "input": input }),
                        err,
                    ));
                }
            }
        }

        let iterations = outputs.len();
        Ok(GroupOutcome::out(json!({
            "results": outputs,
            "_meta": { "iterations": iterations, "completedAt": Utc::now().to_rfc3339() },
        })))
    }

    /// `while`: repeats the body against its own output while the
    /// condition holds, capped by `max_iterations`.
    async fn execute_while(
        rctx: &RunContext,
        group: &BlockGroup,
        input: Value,
        preseed: Preseed,
        subflow: Option<Arc<dyn SubflowRunner>>,
    ) -> Result<GroupOutcome> {
        let config: WhileConfig = serde_json::from_value(group.config.clone())
            .map_err(|e| EngineError::validation(format!("while config: {}", e)))?;

        let mut current = input.clone();
        let mut iterations: u32 = 0;

        loop {
            if rctx.is_cancelled().await {
                return Err(EngineError::Cancelled);
            }

            if !config.do_while {
                // Test first: a false condition exits before the cap is
                // consulted, so max_iterations = 0 still routes `out`.
                if !evaluate(&config.condition, &current)? {
                    break;
                }
                if iterations >= config.max_iterations {
                    let err = EngineError::MaxIterations {
                        limit: config.max_iterations,
                    };
                    return Ok(GroupOutcome::error(
                        json!({ "error": err.to_string(), "input": input }),
                        err,
                    ));
                }
            }

            let entries = scope_entries(rctx, group.id)
                .into_iter()
                .map(|id| (id, current.clone()))
                .collect();
            match run_scope(
                rctx.clone(),
                Some(group.id),
                entries,
                preseed.clone(),
                subflow.clone(),
            )
            .await
            {
                Ok(scope_outcome) => {
                    current = aggregate_scope(rctx, group.id, &scope_outcome);
                    iterations += 1;
                }
                Err(
                    err @ (EngineError::Cancelled
                    | EngineError::WaitingApproval { .. }
                    | EngineError::Delayed { .. }),
                ) => return Err(err),
                Err(err) => {
                    return Ok(GroupOutcome::error(
                        json!({ "error": err.to_string(), "input": input }),
                        err,
                    ));
                }
            }

            if config.do_while {
                if !evaluate(&config.condition, &current)? {
                    break;
                }
                if iterations >= config.max_iterations {
                    let err = EngineError::MaxIterations {
                        limit: config.max_iterations,
                    };
                    return Ok(GroupOutcome::error(
                        json!({ "error": err.to_string(), "input": input }),
                        err,
                    ));
                }
            }
        }

        let output = match current {
            Value::Object(mut map) => {
                map.insert(
                    "_meta".into(),
                    json!({ "iterations": iterations, "completedAt": Utc::now().to_rfc3339() }),
                );
                Value::Object(map)
            }
            other => json!({
                "output": other,
                "_meta": { "iterations": iterations, "completedAt": Utc::now().to_rfc3339() },
            }),
        };
        Ok(GroupOutcome::out(output))
    }
}

/// Aggregates a finished scope into a single value: the lone terminal's
/// output, or a name-keyed map when several terminals exist.
pub(crate) fn aggregate_scope(
    rctx: &RunContext,
    _scope: Uuid,
    outcome: &ScopeOutcome,
) -> Value {
    let done: HashSet<Uuid> = outcome.outputs.keys().copied().collect();
    let terminals = rctx.graph.terminals(&done);
    match terminals.len() {
        0 => Value::Null,
        1 => outcome.outputs[&terminals[0]].clone(),
        _ => {
            let mut map = Map::new();
            for id in terminals {
                map.insert(unit_name(rctx, id), outcome.outputs[&id].clone());
            }
            Value::Object(map)
        }
    }
}

/// Display name for a unit (step or group).
pub(crate) fn unit_name(rctx: &RunContext, id: Uuid) -> String {
    if let Ok(step) = rctx.definition.step(id) {
        return step.name.clone();
    }
    if let Ok(group) = rctx.definition.group(id) {
        return group.name.clone();
    }
    id.to_string()
}

/// One weakly-connected component of a group body.
struct Component {
    /// Stable key in the parallel output map.
    key: String,
    /// Units with no in-scope incoming edges.
    entries: Vec<Uuid>,
}

/// Partitions a group's body into weakly-connected components.
fn connected_components(rctx: &RunContext, group_id: Uuid) -> Vec<Component> {
    let units = scope_units(rctx, Some(group_id));
    let unit_set: HashSet<Uuid> = units.iter().copied().collect();

    // Union-find over in-scope edges.
    let mut parent: HashMap<Uuid, Uuid> = units.iter().map(|u| (*u, *u)).collect();
    fn find(parent: &mut HashMap<Uuid, Uuid>, x: Uuid) -> Uuid {
        let p = parent[&x];
        if p == x {
            return x;
        }
        let root = find(parent, p);
        parent.insert(x, root);
        root
    }
    for edge in rctx.definition.edges.iter() {
        if unit_set.contains(&edge.source_step_id) && unit_set.contains(&edge.target_step_id) {
            let a = find(&mut parent, edge.source_step_id);
            let b = find(&mut parent, edge.target_step_id);
            if a != b {
                parent.insert(a, b);
            }
        }
    }

    let mut grouped: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
    for unit in &units {
        let root = find(&mut parent, *unit);
        grouped.entry(root).or_default().push(*unit);
    }

    let entry_set: HashSet<Uuid> = scope_entries(rctx, group_id).into_iter().collect();
    let mut components: Vec<Component> = grouped
        .into_values()
        .map(|members| {
            let mut entries: Vec<Uuid> = members
                .iter()
                .filter(|id| entry_set.contains(id))
                .copied()
                .collect();
            entries.sort_by_key(|id| rctx.graph.rank(*id));
            let key = entries
                .first()
                .map(|id| unit_name(rctx, *id))
                .unwrap_or_else(|| "component".to_string());
            Component { key, entries }
        })
        .filter(|c| !c.entries.is_empty())
        .collect();
    components.sort_by_key(|c| c.key.clone());
    components
}

/// Runs a group-level pre/post snippet as a pure transform.
async fn run_group_snippet(
    rctx: &RunContext,
    snippet: &str,
    input: &Value,
    output: Option<&Value>,
) -> Result<Value> {
    let code = snippet.to_string();
    let input = input.clone();
    let output = output.cloned();
    let timeout = rctx.services.config.sandbox_timeout;
    let cancel = rctx.cancel.clone();

    let execution = tokio::task::spawn_blocking(move || {
        let runtime = SandboxRuntime::new();
        let caps: Arc<dyn Capabilities> = Arc::new(NullCapabilities::new());
        runtime.execute(
            ExecutionSpec {
                code: &code,
                input: &input,
                config: &Value::Object(Map::new()),
                output: output.as_ref(),
                timeout,
                cancel,
            },
            caps,
        )
    })
    .await
    .map_err(|e| EngineError::internal(format!("group snippet task failed: {}", e)))?;

    execution.output.map_err(|err| match err {
        flowgraph_sandbox::SandboxError::Timeout { elapsed } => EngineError::Timeout { elapsed },
        flowgraph_sandbox::SandboxError::Cancelled => EngineError::Cancelled,
        other => EngineError::Script {
            message: other.to_string(),
            stack: None,
        },
    })
}
