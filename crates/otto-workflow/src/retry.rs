// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Exponential-backoff retry policy applied by the kernel around activity
/// attempts.  `max_attempts` counts the first attempt, so `1` means no
/// retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub initial_interval: Duration,
    pub backoff_coefficient: f64,
    pub max_interval: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(1),
            backoff_coefficient: 2.0,
            max_interval: Duration::from_secs(60),
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    pub fn new(
        initial_interval: Duration,
        backoff_coefficient: f64,
        max_interval: Duration,
        max_attempts: u32,
    ) -> Self {
        Self {
            initial_interval,
            backoff_coefficient,
            max_interval,
            max_attempts,
        }
    }

    /// A single attempt, no backoff.
    pub fn no_retries() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before the attempt following `completed_attempts` failures.
    pub fn delay_for(&self, completed_attempts: u32) -> Duration {
        let exponent = completed_attempts.saturating_sub(1);
        let factor = self.backoff_coefficient.powi(exponent as i32);
        let delay = self.initial_interval.mul_f64(factor.max(1.0));
        delay.min(self.max_interval)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
