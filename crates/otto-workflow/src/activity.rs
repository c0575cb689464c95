// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::retry::RetryPolicy;

/// An idempotent external call whose result is written into workflow
/// history.  Implementations run on the worker's multi-thread runtime and
/// must be `Send + Sync`; payloads are JSON values because they are
/// persisted verbatim.
#[async_trait]
pub trait Activity: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(&self, input: Value) -> Result<Value, crate::ActivityError>;
}

/// Per-invocation activity options.
#[derive(Debug, Clone)]
pub struct ActivityOptions {
    pub retry: RetryPolicy,
    /// Per-attempt timeout.
    pub start_to_close: Duration,
    /// Routes the call to a dedicated worker pool when set; falls back to
    /// the default queue when the pool has no such activity.
    pub task_queue: Option<String>,
}

impl Default for ActivityOptions {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            start_to_close: Duration::from_secs(60),
            task_queue: None,
        }
    }
}

impl ActivityOptions {
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_start_to_close(mut self, timeout: Duration) -> Self {
        self.start_to_close = timeout;
        self
    }

    pub fn with_task_queue(mut self, queue: Option<String>) -> Self {
        self.task_queue = queue;
        self
    }
}
