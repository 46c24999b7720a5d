// =============================================================================
// Bounded exponential retry for network calls
// =============================================================================
//
//   delay(attempt) = min(base * 2^(attempt - 1), max)
//
// Only errors that `IngestError::is_retryable` accepts are retried. Running out
// of attempts surfaces `RetriesExhausted` carrying the last error.
// =============================================================================

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::IngestError;

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    30_000
}

/// How many times, and how patiently, a failed network call is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetryPolicy {
    /// Policy that never sleeps long; handy for tests.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay_ms: 1,
            max_delay_ms: 1,
        }
    }

    /// Backoff before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32);
        let ms = self
            .base_delay_ms
            .saturating_mul(1_u64 << exp)
            .min(self.max_delay_ms);
        Duration::from_millis(ms)
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// policy's retries are used up.
pub async fn retry<T, F, Fut>(policy: &RetryPolicy, label: &str, mut op: F) -> Result<T, IngestError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, IngestError>>,
{
    let mut attempt = 0_u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) => {
                attempt += 1;
                if attempt > policy.max_retries {
                    return Err(IngestError::RetriesExhausted {
                        attempts: attempt,
                        last: Box::new(e),
                    });
                }
                let delay = policy.delay_for(attempt);
                warn!(
                    op = %label,
                    attempt,
                    max_retries = policy.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "retrying after failure"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn delays_double_and_cap() {
        let policy = RetryPolicy {
            max_retries: 10,
            base_delay_ms: 500,
            max_delay_ms: 3_000,
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for(2), Duration::from_millis(1_000));
        assert_eq!(policy.delay_for(3), Duration::from_millis(2_000));
        assert_eq!(policy.delay_for(4), Duration::from_millis(3_000));
        assert_eq!(policy.delay_for(60), Duration::from_millis(3_000));
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let out = retry(&RetryPolicy::immediate(3), "test", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(IngestError::Transport("flaky".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(out, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausting_retries_surfaces_last_error() {
        let calls = AtomicU32::new(0);
        let err = retry(&RetryPolicy::immediate(2), "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(IngestError::Transport("down".into())) }
        })
        .await
        .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match err {
            IngestError::RetriesExhausted { attempts, last } => {
                assert_eq!(attempts, 3);
                assert!(matches!(*last, IngestError::Transport(_)));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn non_retryable_error_fails_fast() {
        let calls = AtomicU32::new(0);
        let err = retry(&RetryPolicy::immediate(5), "test", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(IngestError::MalformedPage("bad".into())) }
        })
        .await
        .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(err, IngestError::MalformedPage(_)));
    }
}
