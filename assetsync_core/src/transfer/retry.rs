use std::{future::Future, time::Duration};

use log::warn;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::{Result, SyncError};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Fixed,
    Exponential,
}

/// How often and how patiently an operation is retried.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub const fn fixed(max_attempts: u32, delay: Duration) -> Self {
        RetryPolicy {
            max_attempts,
            base_delay: delay,
            backoff: Backoff::Fixed,
        }
    }

    pub const fn exponential(max_attempts: u32, base_delay: Duration) -> Self {
        RetryPolicy {
            max_attempts,
            base_delay,
            backoff: Backoff::Exponential,
        }
    }

    /// Per-file transfer retries: 5 attempts, 2 s apart.
    pub const fn file_transfer() -> Self {
        Self::fixed(5, Duration::from_secs(2))
    }

    /// Whole-batch passes: 3 attempts, 1 s, 2 s, ... between them.
    pub const fn batch() -> Self {
        Self::exponential(3, Duration::from_secs(1))
    }

    /// Delay to wait after the 1-based `attempt` failed.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.base_delay,
            Backoff::Exponential => {
                let exponent = attempt.saturating_sub(1).min(16);
                self.base_delay.saturating_mul(1 << exponent)
            }
        }
    }
}

/// Sleeps for `delay` unless `ct` fires first.
pub async fn sleep_or_cancel(delay: Duration, ct: &CancellationToken) -> Result<()> {
    tokio::select! {
        biased;
        _ = ct.cancelled() => Err(SyncError::Cancelled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

/// Runs `op` until it succeeds, fails with a non-retryable error, or the
/// policy's attempts are used up. `op` receives the 1-based attempt number.
pub async fn retry<T, F, Fut>(policy: &RetryPolicy, ct: &CancellationToken, mut op: F) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        if ct.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if attempt >= max_attempts || !err.is_retryable() => return Err(err),
            Err(err) => {
                let delay = policy.delay_for(attempt);
                warn!(
                    "Attempt {}/{} failed: {} (retrying in {:?})",
                    attempt, max_attempts, err, delay
                );
                sleep_or_cancel(delay, ct).await?;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    fn io_error() -> SyncError {
        SyncError::Io(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
    }

    #[test]
    fn should_compute_backoff_delays() {
        let batch = RetryPolicy::batch();
        assert_eq!(batch.delay_for(1), Duration::from_secs(1));
        assert_eq!(batch.delay_for(2), Duration::from_secs(2));
        assert_eq!(batch.delay_for(3), Duration::from_secs(4));

        let file = RetryPolicy::file_transfer();
        assert_eq!(file.delay_for(1), Duration::from_secs(2));
        assert_eq!(file.delay_for(4), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn should_stop_after_max_attempts() {
        let policy = RetryPolicy::fixed(5, Duration::from_millis(1));
        let mut calls = 0;

        let result: Result<()> = retry(&policy, &CancellationToken::new(), |_| {
            calls += 1;
            async { Err(io_error()) }
        })
        .await;

        assert!(matches!(result, Err(SyncError::Io(_))));
        assert_eq!(calls, 5);
    }

    #[tokio::test]
    async fn should_succeed_after_transient_failure() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(1));

        let result = retry(&policy, &CancellationToken::new(), |attempt| async move {
            if attempt < 2 {
                Err(io_error())
            } else {
                Ok(attempt)
            }
        })
        .await;

        assert_eq!(result.ok(), Some(2));
    }

    #[tokio::test]
    async fn should_not_retry_permanent_errors() {
        let policy = RetryPolicy::fixed(5, Duration::from_millis(1));
        let mut calls = 0;

        let result: Result<()> = retry(&policy, &CancellationToken::new(), |_| {
            calls += 1;
            async { Err(SyncError::Unauthorized) }
        })
        .await;

        assert!(matches!(result, Err(SyncError::Unauthorized)));
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn should_abort_backoff_on_cancellation() {
        let policy = RetryPolicy::fixed(5, Duration::from_secs(60));
        let ct = CancellationToken::new();
        let trigger = ct.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let result: Result<()> = retry(&policy, &ct, |_| async { Err(io_error()) }).await;

        assert!(matches!(result, Err(SyncError::Cancelled)));
    }
}
