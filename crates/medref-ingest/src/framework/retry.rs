//! Timeout and retry for store calls
//!
//! Every store call runs under a timeout. Transient failures, timeouts
//! included, are retried with exponential backoff; anything else is returned
//! immediately.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{IngestError, IngestResult};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_BASE_DELAY_MS: u64 = 500;
pub const DEFAULT_MAX_DELAY_MS: u64 = 30_000;
pub const DEFAULT_STORE_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Per-attempt timeout
    pub timeout_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            timeout_secs: DEFAULT_STORE_TIMEOUT_SECS,
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `attempt` (1-based): base, 2x base, 4x base, ...
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(20);
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn validate(&self) -> IngestResult<()> {
        if self.max_attempts == 0 {
            return Err(IngestError::config("retry.max_attempts must be at least 1"));
        }
        if self.timeout_secs == 0 {
            return Err(IngestError::config("retry.timeout_secs must be at least 1"));
        }
        if self.base_delay_ms > self.max_delay_ms {
            return Err(IngestError::config("retry.base_delay_ms must not exceed retry.max_delay_ms"));
        }
        Ok(())
    }
}

/// Run `operation` under the policy's timeout, retrying transient failures
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut call: F,
) -> IngestResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = IngestResult<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        debug!(operation, attempt, max_attempts, "Store call attempt");

        let result = match tokio::time::timeout(policy.timeout(), call()).await {
            Ok(result) => result,
            Err(_) => Err(IngestError::StoreTransient(format!(
                "{} timed out after {}s",
                operation, policy.timeout_secs
            ))),
        };

        match result {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < max_attempts => {
                let delay = policy.delay_for(attempt);
                warn!(
                    operation,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Store call failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            },
            Err(e) => return Err(e),
        }
    }
}
