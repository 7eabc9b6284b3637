/// Cancellable condition polling with a deadline
use std::future::Future;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::errors::ProvisionError;

/// Configuration for a polling loop. Every wait in the engine that watches
/// external progress goes through here so it stays cancellable.
pub struct PollingConfig {
    pub timeout: Duration,
    pub interval: Duration,
    pub description: String,
}

impl PollingConfig {
    pub fn new(timeout: Duration, interval: Duration, description: impl Into<String>) -> Self {
        Self {
            timeout,
            interval,
            description: description.into(),
        }
    }

    /// Poll until the condition yields a value or the deadline passes.
    ///
    /// The condition returns:
    /// - `Ok(Some(T))` when met (polling stops, returns T)
    /// - `Ok(None)` when not yet met (polling continues)
    /// - `Err(e)` on a hard failure (polling stops, propagates)
    pub async fn poll<F, Fut, T>(&self, cancel: &CancellationToken, condition: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<Option<T>>>,
    {
        info!("{}...", self.description);

        let start = Instant::now();

        loop {
            if cancel.is_cancelled() {
                return Err(ProvisionError::Cancelled.into());
            }

            match condition().await {
                Ok(Some(value)) => {
                    info!("{} done", self.description);
                    return Ok(value);
                }
                Ok(None) => {}
                Err(e) => return Err(e),
            }

            if start.elapsed() > self.timeout {
                anyhow::bail!(
                    "timeout after {}s: {}",
                    self.timeout.as_secs(),
                    self.description
                );
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(ProvisionError::Cancelled.into()),
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
    }

    /// Boolean shorthand over [`poll`].
    pub async fn poll_until<F, Fut>(&self, cancel: &CancellationToken, condition: F) -> Result<()>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<bool>>,
    {
        self.poll(cancel, || async {
            match condition().await {
                Ok(true) => Ok(Some(())),
                Ok(false) => Ok(None),
                Err(e) => Err(e),
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast(timeout_ms: u64) -> PollingConfig {
        PollingConfig::new(
            Duration::from_millis(timeout_ms),
            Duration::from_millis(1),
            "test polling",
        )
    }

    #[tokio::test]
    async fn test_poll_returns_value() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();
        let cancel = CancellationToken::new();

        let result = fast(5_000)
            .poll(&cancel, || {
                let c = counter_clone.clone();
                async move {
                    let val = c.fetch_add(1, Ordering::SeqCst);
                    Ok(if val >= 2 { Some(val) } else { None })
                }
            })
            .await;

        assert_eq!(result.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_poll_times_out() {
        let cancel = CancellationToken::new();
        let result = fast(10)
            .poll(&cancel, || async { Ok::<Option<()>, anyhow::Error>(None) })
            .await;

        assert!(result.unwrap_err().to_string().contains("timeout"));
    }

    #[tokio::test]
    async fn test_poll_propagates_errors() {
        let cancel = CancellationToken::new();
        let result = fast(5_000)
            .poll(&cancel, || async {
                Err::<Option<()>, anyhow::Error>(anyhow::anyhow!("hard failure"))
            })
            .await;

        assert!(result.unwrap_err().to_string().contains("hard failure"));
    }

    #[tokio::test]
    async fn test_poll_respects_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = fast(5_000)
            .poll_until(&cancel, || async { Ok(false) })
            .await;

        assert!(crate::errors::is_cancelled(&result.unwrap_err()));
    }
}
