//! Retry loop and backoff policy shared by every backend-calling task kind.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use nodes::NodeError;

use crate::metrics::MetricsSink;
use crate::models::{RetryLogic, Task};
use crate::EngineError;

/// Delay computation between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    /// `FIXED` delay, and the first `EXPONENTIAL_BACKOFF` delay.
    pub base: Duration,
    /// Upper bound on any single delay.
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(300),
        }
    }
}

impl Backoff {
    /// Delay before the `retry`-th retry (1-based).
    ///
    /// `EXPONENTIAL_BACKOFF` yields `base * 2^(retry-1)` plus a random jitter
    /// of up to half of that, so retries against one backend spread out.
    pub fn delay(&self, logic: RetryLogic, retry: u32) -> Duration {
        match logic {
            RetryLogic::Fixed => self.base.min(self.max),
            RetryLogic::ExponentialBackoff => {
                let exp = retry.saturating_sub(1).min(31);
                let delay = self
                    .base
                    .checked_mul(1u32 << exp)
                    .map_or(self.max, |d| d.min(self.max));
                let jitter = delay.mul_f64(rand::thread_rng().gen::<f64>() * 0.5);
                delay + jitter
            }
        }
    }
}

/// A successful call and how many retries it took.
#[derive(Debug, Clone, PartialEq)]
pub struct Retried<T> {
    pub value: T,
    pub retries: u32,
}

/// Run `op` up to `1 + task.retry_count` times.
///
/// `Fatal` errors end the loop immediately; `Retryable` errors are retried
/// after the task's backoff while attempts remain.
pub async fn run_with_retry<T, F, Fut>(
    task: &Task,
    backoff: &Backoff,
    metrics: &dyn MetricsSink,
    mut op: F,
) -> Result<Retried<T>, EngineError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, NodeError>>,
{
    let max_attempts = task.retry_count.saturating_add(1);
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        match op().await {
            Ok(value) => {
                return Ok(Retried {
                    value,
                    retries: attempt - 1,
                })
            }
            Err(err @ NodeError::Fatal(_)) => {
                return Err(EngineError::from_node(&task.name, attempt, err));
            }
            Err(err) if attempt >= max_attempts => {
                return Err(EngineError::from_node(&task.name, attempt, err));
            }
            Err(err) => {
                let delay = backoff.delay(task.retry_logic, attempt);
                warn!(
                    task = %task.name,
                    attempt,
                    max_attempts,
                    ?delay,
                    error = %err.message(),
                    "transient failure, retrying"
                );
                metrics.record_task_retry(task.kind.as_str(), &task.name);
                tokio::time::sleep(delay).await;
            }
        }
    }
}
