//! Retry machinery: a per-call exponential-backoff policy for transient
//! external errors (HTTP to the sync daemon, storage-tool invocations),
//! and the higher-level `retry_on_error` wrapper that keeps a crashed
//! worker's main loop restarting in place while still surfacing a
//! pathological one.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};
use triarchive_core::model::FailureWindow;
use triarchive_core::TriarchiveError;

/// Backoff policy for a single external call.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Retry budget for sync-daemon HTTP calls: `syncthingRetryCount`
    /// attempts spaced `syncthingRetryDelay` apart, no backoff growth —
    /// the source retries at a fixed interval, not exponentially.
    pub fn for_sync_daemon(retry_count: u32, retry_delay: Duration) -> Self {
        Self {
            max_attempts: retry_count,
            initial_backoff: retry_delay,
            max_backoff: retry_delay,
            multiplier: 1.0,
            jitter: false,
        }
    }

    /// Retry budget for storage-tool invocations that fail transiently
    /// (busy remote, rate limiting).
    pub fn for_storage_tool() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: true,
        }
    }

    fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let exp = self.initial_backoff.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let capped = exp.min(self.max_backoff.as_secs_f64());
        let jittered = if self.jitter {
            let mut rng = rand::thread_rng();
            capped * rng.gen_range(0.5..1.5)
        } else {
            capped
        };
        Duration::from_secs_f64(jittered.max(0.0))
    }
}

/// Runs `operation` up to `policy.max_attempts` times, sleeping between
/// attempts according to the backoff curve. `context` is used only for
/// log messages.
pub async fn with_retry_async<F, Fut, T>(
    mut operation: F,
    policy: &RetryPolicy,
    context: &str,
) -> Result<T, TriarchiveError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, TriarchiveError>>,
{
    let mut last_err = None;
    for attempt in 0..policy.max_attempts {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if !err.is_retryable() {
                    return Err(err);
                }
                warn!(%context, attempt, error = %err, "attempt failed, retrying");
                last_err = Some(err);
                if attempt + 1 < policy.max_attempts {
                    tokio::time::sleep(policy.backoff_for_attempt(attempt)).await;
                }
            }
        }
    }
    Err(last_err.unwrap_or_else(|| TriarchiveError::Transient(context.to_string())))
}

/// Options for [`retry_on_error`]'s restart budget: how many failures
/// within `retry_expiry` are tolerated before the worker is left down.
pub struct RetryOnErrorOptions {
    pub max_retry_count: u32,
    pub retry_expiry: Duration,
    pub retry_delay: Duration,
    pub error_message: String,
}

/// Wraps a long-lived worker's main loop. `attempt` is called repeatedly;
/// each time it returns an error, the error is logged, `on_failure` is
/// notified (so a caller can feed a process-wide failure window
/// independent of this call's own budget), `retry_delay` is slept, and
/// the failure is recorded in a sliding window of `retry_expiry`. If
/// more failures than `max_retry_count` are live in that window, the
/// error is propagated (the worker is considered pathological and is
/// left down for the supervisor to handle).
pub async fn retry_on_error<F, Fut, OnFailure>(
    mut attempt: F,
    opts: RetryOnErrorOptions,
    mut on_failure: OnFailure,
) -> Result<(), TriarchiveError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), TriarchiveError>>,
    OnFailure: FnMut(&TriarchiveError),
{
    let mut window = FailureWindow::new(opts.retry_expiry);
    loop {
        match attempt().await {
            Ok(()) => return Ok(()),
            Err(err) => {
                error!(error = %err, message = %opts.error_message, "worker loop failed");
                on_failure(&err);
                let now = chrono::Utc::now();
                window.record(now);
                if window.count(now) as u32 > opts.max_retry_count {
                    error!(
                        message = %opts.error_message,
                        "exceeded failure budget, not restarting"
                    );
                    return Err(err);
                }
                tokio::time::sleep(opts.retry_delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn with_retry_async_succeeds_after_transient_failures() {
        let attempts = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy {
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(1),
            jitter: false,
            ..RetryPolicy::default()
        };
        let result: Result<u32, TriarchiveError> = with_retry_async(
            || {
                let attempts = attempts.clone();
                async move {
                    let n = attempts.fetch_add(1, Ordering::SeqCst);
                    if n < 2 {
                        Err(TriarchiveError::Transient("not yet".into()))
                    } else {
                        Ok(42)
                    }
                }
            },
            &policy,
            "test",
        )
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn with_retry_async_does_not_retry_non_retryable_errors() {
        let attempts = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::default();
        let result: Result<(), TriarchiveError> = with_retry_async(
            || {
                let attempts = attempts.clone();
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err(TriarchiveError::Configuration("bad input".into()))
                }
            },
            &policy,
            "test",
        )
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retry_on_error_gives_up_once_failure_budget_exceeded() {
        let opts = RetryOnErrorOptions {
            max_retry_count: 2,
            retry_expiry: Duration::from_secs(3600),
            retry_delay: Duration::from_millis(1),
            error_message: "test worker".into(),
        };
        let calls = Arc::new(AtomicU32::new(0));
        let result = retry_on_error(
            || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(TriarchiveError::Fatal("boom".into()))
                }
            },
            opts,
            |_| {},
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
