//! Retry policy for capability calls.
//!
//! Retries are counted per step and never exceed the step's remaining
//! budget. Every attempt is bounded by the per-call timeout.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::adapters::{with_timeout, CapabilityError};

/// Backoff between retries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Initial delay between retries in milliseconds
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Maximum delay between retries in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Backoff multiplier (delay *= multiplier after each retry)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_initial_delay() -> u64 {
    1000
}
fn default_max_delay() -> u64 {
    30000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryPolicy {
    /// No waiting between attempts
    pub fn immediate() -> Self {
        Self {
            initial_delay_ms: 0,
            max_delay_ms: 0,
            backoff_multiplier: 1.0,
        }
    }

    /// Calculate delay before retry number `retry` (1-indexed)
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        if retry <= 1 {
            return Duration::from_millis(self.initial_delay_ms.min(self.max_delay_ms));
        }

        let delay = self.initial_delay_ms as f64 * self.backoff_multiplier.powi((retry - 1) as i32);

        let capped = delay.min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(capped)
    }
}

/// Result of a retried call plus the retries it consumed
#[derive(Debug)]
pub struct Attempted<T> {
    pub result: Result<T, CapabilityError>,
    pub retries_used: u32,
}

/// Call `op` until it succeeds, fails permanently, or `max_retries` retries are spent
pub async fn call_with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    max_retries: u32,
    timeout: Duration,
    label: &str,
    mut op: F,
) -> Attempted<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CapabilityError>>,
{
    let mut retries_used = 0u32;

    loop {
        match with_timeout(timeout, op()).await {
            Ok(value) => {
                return Attempted {
                    result: Ok(value),
                    retries_used,
                }
            }
            Err(e) if e.is_transient() && retries_used < max_retries => {
                retries_used += 1;
                let delay = policy.delay_for_retry(retries_used);
                warn!(
                    call = label,
                    retry = retries_used,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Capability call failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                return Attempted {
                    result: Err(e),
                    retries_used,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_retry_policy_delays() {
        let policy = RetryPolicy {
            initial_delay_ms: 1000,
            backoff_multiplier: 2.0,
            max_delay_ms: 10000,
        };

        assert_eq!(policy.delay_for_retry(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_retry(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_retry(3), Duration::from_millis(4000));
        assert_eq!(policy.delay_for_retry(4), Duration::from_millis(8000));
        assert_eq!(policy.delay_for_retry(5), Duration::from_millis(10000)); // Capped
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let calls = AtomicU32::new(0);
        let attempted: Attempted<()> = call_with_retry(
            &RetryPolicy::immediate(),
            2,
            Duration::from_secs(5),
            "test",
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(CapabilityError::RateLimited("slow down".into())) }
            },
        )
        .await;

        assert!(attempted.result.is_err());
        assert_eq!(attempted.retries_used, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let attempted: Attempted<()> = call_with_retry(
            &RetryPolicy::immediate(),
            5,
            Duration::from_secs(5),
            "test",
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(CapabilityError::Unavailable("no backend".into())) }
            },
        )
        .await;

        assert_eq!(attempted.retries_used, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_success_after_retry() {
        let calls = AtomicU32::new(0);
        let attempted = call_with_retry(
            &RetryPolicy::immediate(),
            2,
            Duration::from_secs(5),
            "test",
            || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(CapabilityError::Upstream("flaky".into()))
                    } else {
                        Ok(42)
                    }
                }
            },
        )
        .await;

        assert_eq!(attempted.result, Ok(42));
        assert_eq!(attempted.retries_used, 1);
    }
}
