//! Retry and catch rules attached to task states.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ErrorKind;

/// Retry a task when it fails with one of `error_equals`.
///
/// `max_attempts` counts retries after the first invocation, so a task with
/// `max_attempts: 8` runs at most nine times. The delay before retry `n`
/// (1-based) is `interval_ms * backoff_rate^(n-1)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RetryPolicy {
    pub error_equals: Vec<ErrorKind>,
    pub interval_ms: u64,
    pub backoff_rate: f64,
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub fn on(kind: ErrorKind, interval_ms: u64, backoff_rate: f64, max_attempts: u32) -> Self {
        Self {
            error_equals: vec![kind],
            interval_ms,
            backoff_rate,
            max_attempts,
        }
    }

    pub fn matches(&self, kind: ErrorKind) -> bool {
        self.error_equals.contains(&kind)
    }

    /// Delay before retry number `retry`, or `None` once the budget is spent.
    pub fn delay_for(&self, retry: u32) -> Option<Duration> {
        if retry == 0 || retry > self.max_attempts {
            return None;
        }
        let factor = self.backoff_rate.max(1.0).powi(retry as i32 - 1);
        let ms = (self.interval_ms as f64 * factor).min(u64::MAX as f64);
        Some(Duration::from_millis(ms as u64))
    }
}

/// Route a failed task to `next` instead of failing the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CatchRule {
    pub error_equals: Vec<ErrorKind>,
    pub next: String,
}

impl CatchRule {
    pub fn matches(&self, kind: ErrorKind) -> bool {
        self.error_equals.contains(&kind)
    }
}
