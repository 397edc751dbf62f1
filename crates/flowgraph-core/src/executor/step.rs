// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Step executor.
//!
//! For one (step, input) pair: resolve the block, compute and validate
//! the effective config, then run the pre-process chain, the resolved
//! root code, and the post-process chain in the sandbox. Each attempt is
//! persisted as its own step run; retries are governed by the step's
//! policy and the block's error-code table.

use crate::context::RunContext;
use crate::error::{EngineError, Result};
use crate::executor::capabilities::{StepCapabilities, StepScope, SubflowRunner};
use crate::expr::{deep_merge, expand_value};
use crate::model::{ResolvedBlock, Step, StepRun, StepRunStatus, StepType};
use crate::retry::{RetryExecutor, RetryPolicy};
use chrono::Utc;
use flowgraph_sandbox::{
    Capabilities, ExecutionSpec, LogEntry, SandboxError, SandboxRuntime,
};
use flowgraph_state::model::StepLog;
use flowgraph_state::traits::RunStore;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Executes single steps.
pub struct StepExecutor;

impl StepExecutor {
    /// Runs `step` with `input`, recording one step run per attempt.
    ///
    /// Returns the final output, or the classified error once the retry
    /// policy is exhausted.
    pub async fn execute(
        rctx: &RunContext,
        step: &Step,
        input: Value,
        subflow: Option<Arc<dyn SubflowRunner>>,
    ) -> Result<Value> {
        let registry = rctx.services.registry.current();
        let block = registry.resolve_for_step(step)?.clone();

        // Effective config: resolved defaults ← step config ← template
        // expansion over input and project variables.
        let template_data = json!({
            "input": input,
            "ctx": { "variables": rctx.definition.project.variables },
        });
        let layered = deep_merge(&block.resolved_config_defaults, &step.config);
        let effective_config = expand_value(&layered, &template_data)?;

        registry.validate_config(block.definition.id, &effective_config)?;
        registry.validate_input(block.definition.id, &input)?;

        let policy = step
            .retry
            .as_ref()
            .map(RetryPolicy::from_config)
            .unwrap_or_else(RetryPolicy::none);

        info!(
            run_id = %rctx.run.id,
            step = %step.name,
            block = %block.definition.slug,
            "executing step"
        );

        let executor = RetryExecutor::new(policy);
        executor
            .execute(|| {
                Self::attempt(
                    rctx,
                    step,
                    &block,
                    input.clone(),
                    effective_config.clone(),
                    subflow.clone(),
                )
            })
            .await
    }

    /// One attempt: insert the step run, drive the snippet chain (or the
    /// native handler), classify, and persist the outcome.
    async fn attempt(
        rctx: &RunContext,
        step: &Step,
        block: &ResolvedBlock,
        input: Value,
        config: Value,
        subflow: Option<Arc<dyn SubflowRunner>>,
    ) -> Result<Value> {
        let store = &rctx.services.run_store;
        let attempt = store.next_attempt(rctx.run.id, step.id).await?;
        let mut step_run = StepRun {
            id: Uuid::new_v4(),
            run_id: rctx.run.id,
            step_id: step.id,
            step_name: step.name.clone(),
            attempt,
            status: StepRunStatus::Running,
            input: input.clone(),
            output: None,
            error: None,
            logs: Vec::new(),
            started_at: Utc::now(),
            completed_at: None,
        };
        store.insert_step_run(&step_run).await?;

        let result = if step.step_type == StepType::Wait {
            Self::execute_wait(rctx, &config, input.clone()).await
        } else {
            let scope = StepScope {
                tenant_id: rctx.run.tenant_id,
                project_id: rctx.run.project_id,
                run_id: rctx.run.id,
                step_id: step.id,
                step_run_id: step_run.id,
            };
            let caps: Arc<dyn Capabilities> = Arc::new(StepCapabilities::new(
                rctx.services.clone(),
                scope,
                rctx.definition.project.variables.clone(),
                subflow,
            ));
            let timeout = step
                .timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(rctx.services.config.sandbox_timeout);
            let (result, logs) = run_chain(
                block,
                input,
                config,
                timeout,
                rctx.cancel.clone(),
                caps,
            )
            .await;
            step_run.logs = logs;
            result.map_err(|err| classify(err, block))
        };

        step_run.completed_at = Some(Utc::now());
        match &result {
            Ok(output) => {
                step_run.status = StepRunStatus::Completed;
                step_run.output = Some(output.clone());
                debug!(step = %step.name, attempt, "step attempt completed");
            }
            Err(EngineError::WaitingApproval { approval_key }) => {
                step_run.status = StepRunStatus::Pending;
                step_run.error = Some(format!("waiting for approval '{}'", approval_key));
                info!(step = %step.name, "step suspended on approval");
            }
            Err(EngineError::Delayed { resume_at }) => {
                // The wait already accounts for the delay through the
                // job's not_before; the pass-through output is final.
                step_run.status = StepRunStatus::Completed;
                step_run.output = Some(step_run.input.clone());
                info!(step = %step.name, %resume_at, "step delayed");
            }
            Err(EngineError::Cancelled) => {
                step_run.status = StepRunStatus::Cancelled;
                step_run.error = Some("cancelled".into());
            }
            Err(err) => {
                step_run.status = StepRunStatus::Failed;
                step_run.error = Some(err.to_string());
                warn!(step = %step.name, attempt, error = %err, "step attempt failed");
            }
        }
        store.update_step_run(&step_run).await?;
        result
    }

    /// Native `wait` handling: short waits sleep on the worker, long
    /// waits complete the step and ask the worker to re-deliver the run
    /// after the delay.
    async fn execute_wait(rctx: &RunContext, config: &Value, input: Value) -> Result<Value> {
        let duration_ms = config
            .get("duration_ms")
            .and_then(Value::as_u64)
            .unwrap_or(0);
        let duration = Duration::from_millis(duration_ms);
        if duration <= rctx.services.config.wait_inline_threshold {
            tokio::time::sleep(duration).await;
            if rctx.is_cancelled().await {
                return Err(EngineError::Cancelled);
            }
            Ok(input)
        } else {
            Err(EngineError::Delayed {
                resume_at: Utc::now()
                    + chrono::Duration::from_std(duration)
                        .unwrap_or_else(|_| chrono::Duration::zero()),
            })
        }
    }
}

/// Drives pre-chain → root code → post-chain on a blocking thread.
///
/// Each stage runs in a fresh interpreter; logs accumulate across
/// stages and survive failures.
async fn run_chain(
    block: &ResolvedBlock,
    input: Value,
    config: Value,
    timeout: Duration,
    cancel: flowgraph_sandbox::CancelFlag,
    caps: Arc<dyn Capabilities>,
) -> (std::result::Result<Value, SandboxError>, Vec<StepLog>) {
    let pre_chain = block.pre_process_chain.clone();
    let post_chain = block.post_process_chain.clone();
    let root_code = root_code_for(block, &config);

    let joined = tokio::task::spawn_blocking(move || {
        let runtime = SandboxRuntime::new();
        let mut logs: Vec<LogEntry> = Vec::new();
        let mut current = input;

        // Pre-process chain, child→root: each stage transforms `input`.
        for stage in &pre_chain {
            let execution = runtime.execute(
                ExecutionSpec {
                    code: stage,
                    input: &current,
                    config: &config,
                    output: None,
                    timeout,
                    cancel: cancel.clone(),
                },
                caps.clone(),
            );
            logs.extend(execution.logs);
            match execution.output {
                Ok(value) => current = value,
                Err(err) => return (Err(err), logs),
            }
        }

        // Root snippet: its return value is the initial output.
        let execution = runtime.execute(
            ExecutionSpec {
                code: &root_code,
                input: &current,
                config: &config,
                output: None,
                timeout,
                cancel: cancel.clone(),
            },
            caps.clone(),
        );
        logs.extend(execution.logs);
        let mut output = match execution.output {
            Ok(value) => value,
            Err(err) => return (Err(err), logs),
        };

        // Post-process chain, root→child: each stage transforms `output`.
        for stage in &post_chain {
            let execution = runtime.execute(
                ExecutionSpec {
                    code: stage,
                    input: &current,
                    config: &config,
                    output: Some(&output),
                    timeout,
                    cancel: cancel.clone(),
                },
                caps.clone(),
            );
            logs.extend(execution.logs);
            match execution.output {
                Ok(value) => output = value,
                Err(err) => return (Err(err), logs),
            }
        }

        (Ok(output), logs)
    })
    .await;

    match joined {
        Ok((result, logs)) => {
            let logs = logs
                .into_iter()
                .map(|entry| StepLog {
                    level: entry.level,
                    message: entry.message,
                    data: entry.data,
                    at: entry.at,
                })
                .collect();
            (result, logs)
        }
        Err(join_err) => (
            Err(SandboxError::eval(format!(
                "sandbox thread panicked: {}",
                join_err
            ))),
            Vec::new(),
        ),
    }
}

/// The snippet executed as the root of the chain. `code` blocks take
/// their source from step config so user JS runs without a bespoke block
/// definition.
fn root_code_for(block: &ResolvedBlock, config: &Value) -> String {
    if block.definition.slug == "code" {
        if let Some(source) = config.get("source").and_then(Value::as_str) {
            if !source.trim().is_empty() {
                return source.to_string();
            }
        }
    }
    block.resolved_code.clone()
}

/// Maps a sandbox failure onto the engine taxonomy, consulting the
/// block's error-code table for `[CODE]`-prefixed throws.
fn classify(err: SandboxError, block: &ResolvedBlock) -> EngineError {
    match err {
        SandboxError::Timeout { elapsed } => EngineError::Timeout { elapsed },
        SandboxError::Cancelled => EngineError::Cancelled,
        SandboxError::Suspended { key } => EngineError::WaitingApproval { approval_key: key },
        SandboxError::Evaluation { message, stack } => match split_code(&message) {
            Some((code, rest)) => EngineError::Block {
                retryable: block.is_retryable_code(code),
                code: code.to_string(),
                message: rest.to_string(),
            },
            None => EngineError::Script { message, stack },
        },
        other => EngineError::internal(other.to_string()),
    }
}

/// Splits `"[CODE] message"` into its parts.
fn split_code(message: &str) -> Option<(&str, &str)> {
    let rest = message.strip_prefix('[')?;
    let end = rest.find(']')?;
    let code = &rest[..end];
    if code.is_empty() || code.contains(' ') {
        return None;
    }
    Some((code, rest[end + 1..].trim_start()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::BlockDefinition;

    fn resolved(block: BlockDefinition) -> ResolvedBlock {
        crate::blocks::BlockRegistry::load(vec![block.clone()], 50)
            .unwrap()
            .get(block.id)
            .unwrap()
            .clone()
    }

    #[test]
    fn test_split_code() {
        assert_eq!(
            split_code("[GITHUB_002] secondary rate limit"),
            Some(("GITHUB_002", "secondary rate limit"))
        );
        assert_eq!(split_code("plain failure"), None);
        assert_eq!(split_code("[not a code] x"), None);
        assert_eq!(split_code("[] x"), None);
    }

    #[test]
    fn test_classify_uses_error_code_table() {
        let mut def = BlockDefinition::with_code("svc", "return input;");
        def.error_codes.insert(
            "SVC_RETRY".into(),
            crate::model::ErrorCodeSpec {
                retryable: true,
                description: None,
            },
        );
        let block = resolved(def);

        let retryable = classify(
            SandboxError::eval("[SVC_RETRY] transient"),
            &block,
        );
        assert!(retryable.retryable());

        let unknown = classify(SandboxError::eval("[SVC_FATAL] broken"), &block);
        assert!(!unknown.retryable());

        let plain = classify(SandboxError::eval("undefined is not a function"), &block);
        assert_eq!(plain.code(), "SCRIPT_ERROR");
    }

    #[test]
    fn test_root_code_for_code_block() {
        let block = resolved(BlockDefinition::with_code("code", "return input;"));
        let config = serde_json::json!({"source": "return 42;"});
        assert_eq!(root_code_for(&block, &config), "return 42;");
        let empty = serde_json::json!({});
        assert_eq!(root_code_for(&block, &empty), "return input;");
    }
}
