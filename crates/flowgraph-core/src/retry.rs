// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Retry policies with backoff and jitter.

use crate::error::{EngineError, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Backoff growth strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Delay doubles each attempt.
    Exponential,
    /// Delay grows linearly with the attempt number.
    Linear,
    /// Fixed delay.
    Constant,
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::Exponential
    }
}

/// Step-level retry configuration as stored on a step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts including the first.
    pub max_attempts: u32,
    /// Growth strategy.
    #[serde(default)]
    pub backoff: BackoffStrategy,
    /// Delay before the second attempt.
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Upper bound on any single delay.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_initial_delay_ms() -> u64 {
    200
}

fn default_max_delay_ms() -> u64 {
    30_000
}

/// Resolved retry policy.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_delay: Duration,
    /// Per-attempt delay multiplier.
    pub multiplier: f64,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Creates a policy.
    pub fn new(
        max_attempts: u32,
        initial_delay: Duration,
        multiplier: f64,
        max_delay: Duration,
    ) -> Self {
        Self {
            max_attempts,
            initial_delay,
            multiplier,
            max_delay,
        }
    }

    /// Single attempt, no delays.
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO, 1.0, Duration::ZERO)
    }

    /// Builds a policy from step-level config.
    pub fn from_config(config: &RetryConfig) -> Self {
        let multiplier = match config.backoff {
            BackoffStrategy::Exponential => 2.0,
            BackoffStrategy::Linear | BackoffStrategy::Constant => 1.0,
        };
        Self::new(
            config.max_attempts.max(1),
            Duration::from_millis(config.initial_delay_ms),
            multiplier,
            Duration::from_millis(config.max_delay_ms),
        )
    }

    /// Delay before `attempt` (2-based; the first attempt has none),
    /// with jitter applied.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let exponent = (attempt - 2) as i32;
        let raw = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        let bounded = raw.min(self.max_delay.as_millis() as f64);
        // Jitter in [0.5, 1.0) keeps retries from aligning across steps.
        let jitter = rand::thread_rng().gen_range(0.5..1.0);
        Duration::from_millis((bounded * jitter) as u64)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(200), 2.0, Duration::from_secs(30))
    }
}

/// Drives an async operation under a [`RetryPolicy`].
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    /// Creates an executor with the given policy.
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// Runs `operation` until it succeeds, raises a non-retryable error,
    /// or exhausts the policy's attempts.
    pub async fn execute<T, F, Fut>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) if err.retryable() && attempt < self.policy.max_attempts => {
                    let delay = self.policy.delay_for(attempt + 1);
                    warn!(
                        attempt,
                        max_attempts = self.policy.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    debug!(attempt, error = %err, "attempt failed, not retrying");
                    return Err(err);
                }
            }
        }
    }
}

/// Clamps an error into the retryable space when the block's error-code
/// table says so; used by the step executor after classification.
pub fn apply_code_retryability(err: EngineError, declared_retryable: Option<bool>) -> EngineError {
    match (err, declared_retryable) {
        (EngineError::Block { code, message, .. }, Some(retryable)) => EngineError::Block {
            code,
            message,
            retryable,
        },
        (other, _) => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_policy_from_config() {
        let config = RetryConfig {
            max_attempts: 5,
            backoff: BackoffStrategy::Exponential,
            initial_delay_ms: 200,
            max_delay_ms: 10_000,
        };
        let policy = RetryPolicy::from_config(&config);
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.initial_delay, Duration::from_millis(200));
        assert_eq!(policy.multiplier, 2.0);
        assert_eq!(policy.max_delay, Duration::from_millis(10_000));
    }

    #[test]
    fn test_delay_growth_is_bounded() {
        let policy = RetryPolicy::new(10, Duration::from_millis(100), 2.0, Duration::from_millis(400));
        // Attempt 2 delay derives from 100ms, attempt 5 from min(800, 400).
        assert!(policy.delay_for(2) <= Duration::from_millis(100));
        assert!(policy.delay_for(5) <= Duration::from_millis(400));
        assert_eq!(policy.delay_for(1), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let executor = RetryExecutor::new(RetryPolicy::new(
            3,
            Duration::from_millis(1),
            1.0,
            Duration::from_millis(1),
        ));
        let result = executor
            .execute(move || {
                let counter = counter.clone();
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    if n < 3 {
                        Err(EngineError::Timeout {
                            elapsed: Duration::from_millis(1),
                        })
                    } else {
                        Ok(n)
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(result, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_error_fails_fast() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let executor = RetryExecutor::new(RetryPolicy::default());
        let result: Result<()> = executor
            .execute(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(EngineError::SchemaValidation {
                        message: "bad".into(),
                    })
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_attempts_exhausted() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let executor = RetryExecutor::new(RetryPolicy::new(
            3,
            Duration::from_millis(1),
            1.0,
            Duration::from_millis(1),
        ));
        let result: Result<()> = executor
            .execute(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(EngineError::Timeout {
                        elapsed: Duration::from_millis(1),
                    })
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
