use metrics::counter;
use promvault_core::storage::PersistentStorageError;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::persistent_metrics::STAGE_RETRIES_TOTAL;

/// Delay between attempts of a failed compress or upload stage.
pub const RETRY_DELAY: Duration = Duration::from_secs(10);

/// Fixed-delay retry loop shared by the compress and upload stages.
///
/// The pipeline runs these unbounded: the rotated segment is the only copy of
/// its data, so giving up would mean dropping it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    delay: Duration,
    max_attempts: Option<u32>,
}

#[derive(Debug, Error)]
pub enum RetryError {
    #[error("cancelled after {attempts} attempt(s)")]
    Cancelled { attempts: u32 },
    #[error("gave up after {attempts} attempt(s): {last}")]
    Exhausted {
        attempts: u32,
        last: PersistentStorageError,
    },
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::fixed(RETRY_DELAY)
    }
}

impl RetryPolicy {
    /// Retry forever with `delay` between attempts.
    pub const fn fixed(delay: Duration) -> Self {
        RetryPolicy {
            delay,
            max_attempts: None,
        }
    }

    /// Retry with `delay` between attempts, at most `max_attempts` in total.
    pub const fn bounded(delay: Duration, max_attempts: u32) -> Self {
        RetryPolicy {
            delay,
            max_attempts: Some(max_attempts),
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn max_attempts(&self) -> Option<u32> {
        self.max_attempts
    }

    /// Run `op` until it succeeds. Returns the value and the number of
    /// attempts it took. Every failure is logged; the delay is cut short when
    /// `cancel` fires.
    pub async fn run<T, F, Fut>(
        &self,
        stage: &'static str,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<(T, u32), RetryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, PersistentStorageError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let err = match op().await {
                Ok(value) => return Ok((value, attempt)),
                Err(e) => e,
            };

            counter!(STAGE_RETRIES_TOTAL.name, "stage" => stage).increment(1);
            if self.max_attempts.is_some_and(|max| attempt >= max) {
                warn!(target = "uploader", stage, attempt, error = %err, "stage failed, giving up");
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last: err,
                });
            }
            warn!(
                target = "uploader",
                stage,
                attempt,
                error = %err,
                retry_in_secs = self.delay.as_secs_f64(),
                "stage failed, retrying"
            );

            tokio::select! {
                _ = cancel.cancelled() => return Err(RetryError::Cancelled { attempts: attempt }),
                _ = tokio::time::sleep(self.delay) => {}
            }
        }
    }
}
