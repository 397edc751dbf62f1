// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Sandbox execution runtime.
//!
//! One fresh QuickJS runtime and context per snippet. Capability calls
//! re-enter the async host through a captured Tokio handle; the
//! interpreter thread blocks until the call resolves, which is what makes
//! `ctx.*` look synchronous from JS. A QuickJS interrupt handler enforces
//! the execution deadline and cooperative run cancellation, and every
//! host call is additionally bounded by the time remaining on the
//! deadline so a stuck network call cannot outlive the step.

use crate::capabilities::{Capabilities, CapabilityError, HttpRequest, LogEntry};
use crate::error::SandboxError;
use crate::preamble::{harness, PREAMBLE};
use chrono::Utc;
use parking_lot::Mutex;
use rquickjs::{CatchResultExt, Context, Function, Runtime};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tracing::debug;

/// Heap ceiling for one snippet execution.
const MEMORY_LIMIT_BYTES: usize = 64 * 1024 * 1024;

const INTERRUPT_NONE: u8 = 0;
const INTERRUPT_TIMEOUT: u8 = 1;
const INTERRUPT_CANCELLED: u8 = 2;

/// Cooperative cancellation flag shared between a run and its sandbox
/// executions.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// Creates an unset flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Inputs for one snippet execution.
pub struct ExecutionSpec<'a> {
    /// JS source; the snippet body runs as a function of
    /// `(input, config, ctx)` and its `return` value becomes the output.
    pub code: &'a str,
    /// The `input` value visible to the snippet.
    pub input: &'a Value,
    /// The effective config visible to the snippet.
    pub config: &'a Value,
    /// The prior stage's result, bound as `output` for post-process
    /// snippets; `None` binds `null`.
    pub output: Option<&'a Value>,
    /// Hard execution deadline.
    pub timeout: Duration,
    /// Run-level cancellation flag.
    pub cancel: CancelFlag,
}

/// Outcome of one snippet execution. Logs are retained even when the
/// snippet failed or timed out.
pub struct Execution {
    /// The snippet's return value, or how it failed.
    pub output: Result<Value, SandboxError>,
    /// `ctx.log` lines captured during the execution.
    pub logs: Vec<LogEntry>,
}

/// Stateless sandbox entry point.
#[derive(Debug, Clone, Copy, Default)]
pub struct SandboxRuntime;

impl SandboxRuntime {
    /// Creates the runtime handle.
    pub fn new() -> Self {
        Self
    }

    /// Executes one snippet against a capability surface.
    ///
    /// Must be called from a blocking context inside a Tokio runtime
    /// (the step executor uses `spawn_blocking`); capability futures are
    /// driven via [`Handle::block_on`].
    pub fn execute(&self, spec: ExecutionSpec<'_>, caps: Arc<dyn Capabilities>) -> Execution {
        let logs: Arc<Mutex<Vec<LogEntry>>> = Arc::new(Mutex::new(Vec::new()));
        let output = self.execute_inner(&spec, caps, logs.clone());
        let logs = std::mem::take(&mut *logs.lock());
        Execution { output, logs }
    }

    fn execute_inner(
        &self,
        spec: &ExecutionSpec<'_>,
        caps: Arc<dyn Capabilities>,
        logs: Arc<Mutex<Vec<LogEntry>>>,
    ) -> Result<Value, SandboxError> {
        let handle = Handle::try_current().map_err(|_| {
            SandboxError::RuntimeCreation("no Tokio runtime on the sandbox thread".into())
        })?;

        let runtime = Runtime::new()
            .map_err(|e| SandboxError::RuntimeCreation(e.to_string()))?;
        runtime.set_memory_limit(MEMORY_LIMIT_BYTES);

        let started = Instant::now();
        let deadline = started + spec.timeout;
        let interrupt_reason = Arc::new(AtomicU8::new(INTERRUPT_NONE));
        let suspended: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));

        {
            let cancel = spec.cancel.clone();
            let reason = interrupt_reason.clone();
            runtime.set_interrupt_handler(Some(Box::new(move || {
                if cancel.is_cancelled() {
                    reason.store(INTERRUPT_CANCELLED, Ordering::SeqCst);
                    return true;
                }
                if Instant::now() >= deadline {
                    reason.store(INTERRUPT_TIMEOUT, Ordering::SeqCst);
                    return true;
                }
                false
            })));
        }

        let context = Context::full(&runtime)
            .map_err(|e| SandboxError::ContextCreation(e.to_string()))?;

        let result: Result<String, SandboxError> = context.with(|ctx| {
            let globals = ctx.globals();

            globals
                .set("__input_json", spec.input.to_string())
                .map_err(js_setup_err)?;
            globals
                .set("__config_json", spec.config.to_string())
                .map_err(js_setup_err)?;
            globals
                .set(
                    "__output_json",
                    spec.output
                        .map(|v| v.to_string())
                        .unwrap_or_else(|| "null".to_string()),
                )
                .map_err(js_setup_err)?;
            globals
                .set(
                    "__secrets_json",
                    serde_json::to_string(&caps.secrets()).unwrap_or_else(|_| "{}".into()),
                )
                .map_err(js_setup_err)?;
            globals
                .set(
                    "__env_json",
                    serde_json::to_string(&caps.env()).unwrap_or_else(|_| "{}".into()),
                )
                .map_err(js_setup_err)?;
            globals
                .set("__variables_json", caps.variables().to_string())
                .map_err(js_setup_err)?;

            let host_call = {
                let caps = caps.clone();
                let handle = handle.clone();
                let cancel = spec.cancel.clone();
                let suspended = suspended.clone();
                Function::new(
                    ctx.clone(),
                    move |ns: String, method: String, payload: String| -> String {
                        dispatch(
                            &handle, &caps, &cancel, deadline, &suspended, &ns, &method, &payload,
                        )
                    },
                )
                .map_err(js_setup_err)?
            };
            globals.set("__host_call", host_call).map_err(js_setup_err)?;

            let host_log = {
                let caps = caps.clone();
                let logs = logs.clone();
                Function::new(
                    ctx.clone(),
                    move |level: String, message: String, data: String| {
                        let data = match serde_json::from_str::<Value>(&data) {
                            Ok(Value::Null) => None,
                            Ok(v) => Some(v),
                            Err(_) => None,
                        };
                        let entry = LogEntry {
                            level,
                            message,
                            data,
                            at: Utc::now(),
                        };
                        logs.lock().push(entry.clone());
                        caps.log(entry);
                    },
                )
                .map_err(js_setup_err)?
            };
            globals.set("__host_log", host_log).map_err(js_setup_err)?;

            let preamble: Result<(), _> = ctx.eval(PREAMBLE);
            preamble
                .catch(&ctx)
                .map_err(|caught| convert_caught(caught))?;

            let wrapped = harness(spec.code);
            let evaluated: Result<String, _> = ctx.eval(wrapped);
            evaluated
                .catch(&ctx)
                .map_err(|caught| convert_caught(caught))
        });

        // An approval suspension surfaces as a thrown capability error;
        // the recorded key takes precedence over the JS-side symptom.
        if let Some(key) = suspended.lock().take() {
            return Err(SandboxError::Suspended { key });
        }

        match result {
            Ok(raw) => {
                debug!(elapsed_ms = started.elapsed().as_millis() as u64, "snippet completed");
                serde_json::from_str(&raw)
                    .map_err(|e| SandboxError::Serialization(e.to_string()))
            }
            Err(err) => match interrupt_reason.load(Ordering::SeqCst) {
                INTERRUPT_TIMEOUT => Err(SandboxError::Timeout {
                    elapsed: started.elapsed(),
                }),
                INTERRUPT_CANCELLED => Err(SandboxError::Cancelled),
                _ => Err(err),
            },
        }
    }
}

fn js_setup_err(err: rquickjs::Error) -> SandboxError {
    SandboxError::ContextCreation(err.to_string())
}

fn convert_caught(caught: rquickjs::CaughtError<'_>) -> SandboxError {
    use rquickjs::CaughtError;
    match caught {
        CaughtError::Exception(exc) => {
            let message = exc.message().unwrap_or_default();
            match exc.stack() {
                Some(stack) if !stack.is_empty() => SandboxError::eval_with_stack(message, stack),
                _ => SandboxError::eval(message),
            }
        }
        CaughtError::Value(val) => SandboxError::eval(format!(
            "JS threw value: {:?}",
            val.as_string().map(|s| s.to_string())
        )),
        CaughtError::Error(err) => SandboxError::eval(err.to_string()),
    }
}

/// Bridges one `__host_call` invocation to the capability surface.
///
/// Returns a JSON envelope string: `{"ok":true,"value":…}` on success,
/// `{"ok":false,"code":…,"message":…}` on failure. The preamble converts
/// failure envelopes into thrown `Error`s with a `[CODE]` message prefix.
#[allow(clippy::too_many_arguments)]
fn dispatch(
    handle: &Handle,
    caps: &Arc<dyn Capabilities>,
    cancel: &CancelFlag,
    deadline: Instant,
    suspended: &Arc<Mutex<Option<String>>>,
    ns: &str,
    method: &str,
    payload_json: &str,
) -> String {
    if cancel.is_cancelled() {
        return error_envelope("CANCELLED", "run cancelled");
    }
    let remaining = deadline.saturating_duration_since(Instant::now());
    if remaining.is_zero() {
        return error_envelope("TIMEOUT", "execution deadline elapsed");
    }

    let payload: Value = serde_json::from_str(payload_json).unwrap_or(Value::Null);

    let result = handle.block_on(async {
        let fut = invoke(caps, ns, method, payload);
        match tokio::time::timeout(remaining, fut).await {
            Ok(inner) => inner,
            Err(_) => Err(CapabilityError::Timeout),
        }
    });

    match result {
        Ok(value) => json!({ "ok": true, "value": value }).to_string(),
        Err(CapabilityError::Suspended { key }) => {
            *suspended.lock() = Some(key.clone());
            error_envelope("WAITING_APPROVAL", &format!("waiting for approval '{}'", key))
        }
        Err(err) => {
            let code = match &err {
                CapabilityError::HttpStatus { status, .. } => format!("HTTP_{}", status),
                CapabilityError::Timeout => "TIMEOUT".to_string(),
                CapabilityError::Denied { .. } => "EGRESS_DENIED".to_string(),
                CapabilityError::Provider { code, .. } => code.clone(),
                CapabilityError::Invalid { .. } => "INVALID_ARGUMENT".to_string(),
                CapabilityError::Unavailable { .. } => "CAPABILITY_UNAVAILABLE".to_string(),
                CapabilityError::Suspended { .. } => unreachable!("handled above"),
                CapabilityError::Internal(_) => "INTERNAL".to_string(),
            };
            error_envelope(&code, &err.to_string())
        }
    }
}

fn error_envelope(code: &str, message: &str) -> String {
    json!({ "ok": false, "code": code, "message": message }).to_string()
}

async fn invoke(
    caps: &Arc<dyn Capabilities>,
    ns: &str,
    method: &str,
    payload: Value,
) -> Result<Value, CapabilityError> {
    match (ns, method) {
        ("http", _) => {
            let request: HttpRequest = serde_json::from_value(payload)
                .map_err(|e| CapabilityError::Invalid {
                    message: e.to_string(),
                })?;
            let response = caps.http(request).await?;
            serde_json::to_value(response).map_err(|e| CapabilityError::Internal(e.to_string()))
        }
        ("llm", m @ ("chat" | "complete")) => {
            let provider = payload
                .get("provider")
                .and_then(Value::as_str)
                .ok_or_else(|| CapabilityError::Invalid {
                    message: "llm call requires a provider".into(),
                })?
                .to_string();
            let model = payload
                .get("model")
                .and_then(Value::as_str)
                .ok_or_else(|| CapabilityError::Invalid {
                    message: "llm call requires a model".into(),
                })?
                .to_string();
            let request = payload.get("request").cloned().unwrap_or(Value::Null);
            caps.llm(m, &provider, &model, request).await
        }
        ("workflow", "run") => {
            let project_id = payload
                .get("project_id")
                .and_then(Value::as_str)
                .ok_or_else(|| CapabilityError::Invalid {
                    message: "workflow.run requires a project id".into(),
                })?
                .to_string();
            let start_step_id = payload
                .get("start_step_id")
                .and_then(Value::as_str)
                .map(str::to_string);
            let input = payload.get("input").cloned().unwrap_or(Value::Null);
            caps.workflow_run(&project_id, start_step_id.as_deref(), input)
                .await
        }
        ("human", "requestApproval") => caps.approval(payload).await,
        ("adapter", "call") => {
            let name = payload
                .get("name")
                .and_then(Value::as_str)
                .ok_or_else(|| CapabilityError::Invalid {
                    message: "adapter.call requires a name".into(),
                })?
                .to_string();
            let adapter_method = payload
                .get("method")
                .and_then(Value::as_str)
                .unwrap_or("call")
                .to_string();
            let inner = payload.get("payload").cloned().unwrap_or(Value::Null);
            caps.adapter(&name, &adapter_method, inner).await
        }
        ("adapter", "list") => caps.adapter_list().await,
        ("embedding", "embed") => caps.embed(payload).await,
        ("vector", m) => caps.vector(m, payload).await,
        _ => Err(CapabilityError::Unavailable {
            name: format!("{}.{}", ns, method),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::NullCapabilities;
    use serde_json::json;

    async fn run_snippet(code: &'static str, input: Value, config: Value) -> Execution {
        tokio::task::spawn_blocking(move || {
            let runtime = SandboxRuntime::new();
            runtime.execute(
                ExecutionSpec {
                    code,
                    input: &input,
                    config: &config,
                    output: None,
                    timeout: Duration::from_secs(5),
                    cancel: CancelFlag::new(),
                },
                Arc::new(NullCapabilities::new()),
            )
        })
        .await
        .unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_snippet_transforms_input() {
        let exec = run_snippet(
            "return { doubled: input.x * 2 };",
            json!({"x": 21}),
            json!({}),
        )
        .await;
        assert_eq!(exec.output.unwrap(), json!({"doubled": 42}));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_config_is_visible() {
        let exec = run_snippet(
            "return { url: config.base_url + '/items' };",
            json!({}),
            json!({"base_url": "https://api.example.com"}),
        )
        .await;
        assert_eq!(
            exec.output.unwrap(),
            json!({"url": "https://api.example.com/items"})
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_undefined_return_becomes_null() {
        let exec = run_snippet("var x = 1;", json!({}), json!({})).await;
        assert_eq!(exec.output.unwrap(), Value::Null);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_throw_surfaces_as_evaluation_error() {
        let exec = run_snippet("throw new Error('boom');", json!({}), json!({})).await;
        match exec.output.unwrap_err() {
            SandboxError::Evaluation { message, .. } => assert!(message.contains("boom")),
            other => panic!("expected evaluation error, got {:?}", other),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_infinite_loop_times_out() {
        let input = json!({});
        let config = json!({});
        let exec = tokio::task::spawn_blocking(move || {
            let runtime = SandboxRuntime::new();
            runtime.execute(
                ExecutionSpec {
                    code: "while (true) {}",
                    input: &input,
                    config: &config,
                    output: None,
                    timeout: Duration::from_millis(100),
                    cancel: CancelFlag::new(),
                },
                Arc::new(NullCapabilities::new()),
            )
        })
        .await
        .unwrap();
        assert!(matches!(exec.output, Err(SandboxError::Timeout { .. })));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancellation_interrupts() {
        let input = json!({});
        let config = json!({});
        let cancel = CancelFlag::new();
        cancel.cancel();
        let exec = tokio::task::spawn_blocking(move || {
            let runtime = SandboxRuntime::new();
            runtime.execute(
                ExecutionSpec {
                    code: "while (true) {}",
                    input: &input,
                    config: &config,
                    output: None,
                    timeout: Duration::from_secs(5),
                    cancel,
                },
                Arc::new(NullCapabilities::new()),
            )
        })
        .await
        .unwrap();
        assert!(matches!(exec.output, Err(SandboxError::Cancelled)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_logs_captured_even_on_failure() {
        let exec = run_snippet(
            "ctx.log('info', 'before the fall', { n: 1 }); throw new Error('late');",
            json!({}),
            json!({}),
        )
        .await;
        assert!(exec.output.is_err());
        assert_eq!(exec.logs.len(), 1);
        assert_eq!(exec.logs[0].message, "before the fall");
        assert_eq!(exec.logs[0].data, Some(json!({"n": 1})));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_eval_is_neutered() {
        let exec = run_snippet(
            "return typeof eval === 'undefined' || eval === undefined;",
            json!({}),
            json!({}),
        )
        .await;
        assert_eq!(exec.output.unwrap(), json!(true));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_helper_get_path() {
        let exec = run_snippet(
            "return getPath(input, '$.a.b[1]');",
            json!({"a": {"b": [10, 20]}}),
            json!({}),
        )
        .await;
        assert_eq!(exec.output.unwrap(), json!(20));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_helper_render_template() {
        let exec = run_snippet(
            "return renderTemplate('hello {{ $.name }}, missing: \"{{ $.nope }}\"', input);",
            json!({"name": "world"}),
            json!({}),
        )
        .await;
        assert_eq!(
            exec.output.unwrap(),
            json!("hello world, missing: \"\"")
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_helper_evaluate() {
        let exec = run_snippet(
            "return [evaluate('$.x > 10', input), evaluate('$.x <= 10', input), evaluate('$.name == \"a\"', input)];",
            json!({"x": 11, "name": "a"}),
            json!({}),
        )
        .await;
        assert_eq!(exec.output.unwrap(), json!([true, false, true]));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unavailable_capability_throws_coded_error() {
        let exec = run_snippet(
            "return ctx.http.get('https://example.com');",
            json!({}),
            json!({}),
        )
        .await;
        match exec.output.unwrap_err() {
            SandboxError::Evaluation { message, .. } => {
                assert!(message.contains("CAPABILITY_UNAVAILABLE"), "{}", message);
            }
            other => panic!("expected evaluation error, got {:?}", other),
        }
    }
}
