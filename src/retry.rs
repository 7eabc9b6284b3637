/// Transient-error classification and retry policy
use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::errors::ProvisionError;

/// Message fragments that mark a failure as transient. Substring match on the
/// full context chain is sufficient; the underlying clients preserve the
/// original wording.
const TRANSIENT_MARKERS: &[&str] = &[
    "EOF",
    "connection refused",
    "connection reset",
    "i/o timeout",
    "no such host",
    "TLS handshake timeout",
    "context deadline exceeded",
];

/// Classify an error chain as transient (retryable) or permanent.
pub fn is_transient(err: &anyhow::Error) -> bool {
    // Typed engine errors are never retried blindly.
    if err.downcast_ref::<ProvisionError>().is_some() {
        return false;
    }
    let message = format!("{:#}", err);
    TRANSIENT_MARKERS.iter().any(|m| message.contains(m))
}

/// Retry policy for phase steps: a fixed delay between attempts, with a hard
/// attempt cap. Permanent failures propagate on first sight.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 10,
            delay: Duration::from_secs(15),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, delay: Duration) -> Self {
        Self { max_retries, delay }
    }

    /// Run `operation` until it succeeds, fails permanently, or the retry
    /// budget is exhausted. The delay between attempts is cancellable.
    pub async fn run<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        description: &str,
        mut operation: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1u32;
        loop {
            if cancel.is_cancelled() {
                return Err(ProvisionError::Cancelled.into());
            }

            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) if is_transient(&err) && attempt < self.max_retries => {
                    warn!(
                        "{} failed (attempt {}/{}), retrying in {}s: {:#}",
                        description,
                        attempt,
                        self.max_retries,
                        self.delay.as_secs(),
                        err
                    );
                    attempt += 1;
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(ProvisionError::Cancelled.into()),
                        _ = tokio::time::sleep(self.delay) => {}
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Exponential backoff for API readiness polls. Delays double from `initial`
/// up to `max`; the caller owns the deadline.
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            current: initial,
            max,
        }
    }

    /// Next delay in the sequence.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(max_retries, Duration::from_millis(1))
    }

    #[test]
    fn test_transient_classification() {
        assert!(is_transient(&anyhow::anyhow!(
            "dial tcp 1.2.3.4:6443: connection refused"
        )));
        assert!(is_transient(&anyhow::anyhow!("unexpected EOF")));
        assert!(is_transient(&anyhow::anyhow!(
            "request failed: TLS handshake timeout"
        )));
        assert!(!is_transient(&anyhow::anyhow!("invalid server type cx99")));
        // Context wrapping must not hide the marker.
        let wrapped = anyhow::anyhow!("read tcp: i/o timeout").context("fetching server");
        assert!(is_transient(&wrapped));
    }

    #[test]
    fn test_typed_errors_are_permanent() {
        let err: anyhow::Error = ProvisionError::BootstrapConflict {
            node: "test-cp-01".to_string(),
            reason: "etcd already has members".to_string(),
        }
        .into();
        assert!(!is_transient(&err));
    }

    #[tokio::test]
    async fn test_retry_succeeds_within_budget() {
        let failures = Arc::new(AtomicU32::new(0));
        let failures_clone = failures.clone();
        let cancel = CancellationToken::new();

        let result = fast_policy(10)
            .run(&cancel, "test op", || {
                let failures = failures_clone.clone();
                async move {
                    if failures.fetch_add(1, Ordering::SeqCst) < 3 {
                        anyhow::bail!("connection refused")
                    }
                    Ok(42)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(failures.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_retry_budget_exhausted() {
        // N transients followed by success succeeds iff N < max_retries:
        // with max_retries = 3 the third transient attempt is the last.
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = attempts.clone();
        let cancel = CancellationToken::new();

        let result: Result<u32> = fast_policy(3)
            .run(&cancel, "test op", || {
                let attempts = attempts_clone.clone();
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    anyhow::bail!("connection reset")
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_propagates_immediately() {
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = attempts.clone();
        let cancel = CancellationToken::new();

        let result: Result<u32> = fast_policy(10)
            .run(&cancel, "test op", || {
                let attempts = attempts_clone.clone();
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    anyhow::bail!("name conflict")
                }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result: Result<u32> = fast_policy(10)
            .run(&cancel, "test op", || async { Ok(1) })
            .await;

        assert!(crate::errors::is_cancelled(&result.unwrap_err()));
    }

    #[test]
    fn test_backoff_doubles_to_cap() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(8));
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
        assert_eq!(backoff.next_delay(), Duration::from_secs(4));
        assert_eq!(backoff.next_delay(), Duration::from_secs(8));
        assert_eq!(backoff.next_delay(), Duration::from_secs(8));
    }
}
