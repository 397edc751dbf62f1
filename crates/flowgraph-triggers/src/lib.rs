// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The trigger layer: cron schedules, HMAC-verified webhooks, and the
//! worker pool that drains the job queue.

pub mod scheduler;
pub mod webhook;
pub mod worker;

pub use scheduler::{next_fire, preview_fires, Scheduler};
pub use webhook::{IngressError, WebhookAccepted, WebhookIngress, WebhookRequest};
pub use worker::WorkerPool;
