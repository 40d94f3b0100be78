//! Retry with exponential backoff and jitter.
//!
//! Wraps sink calls. For attempt `n` (1-based) the delay before the next
//! attempt is `min(max_delay, base_delay · multiplier^(n−1)) · (1 + U[0,
//! jitter_frac])`. Retries are per-batch: a retried batch re-executes the
//! whole write protocol, whose primary-key upserts make the replay
//! idempotent.
//!
//! Only transient errors retry. A terminal error returns immediately; a
//! transient error that exhausts the cap escalates to terminal. Cancellation
//! is checked before every sleep and every attempt.

use crate::config::RetryConfig;
use crate::error::ConnectorError;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Backoff policy derived from configuration.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub jitter_frac: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_delay: Duration::from_millis(config.base_delay_ms),
            multiplier: config.multiplier,
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter_frac: config.jitter_frac,
        }
    }

    /// Delay before retrying after attempt `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let base = self.base_delay.as_secs_f64() * exp;
        let capped = base.min(self.max_delay.as_secs_f64());
        let jitter = 1.0 + rand::thread_rng().gen_range(0.0..=self.jitter_frac);
        Duration::from_secs_f64(capped * jitter)
    }
}

/// Why a retried operation gave up.
#[derive(Debug)]
pub enum RetryError {
    /// Transient failures hit the attempt cap; now terminal.
    Exhausted {
        attempts: u32,
        source: ConnectorError,
    },
    /// A terminal error occurred; `attempts` records prior transient tries.
    Terminal {
        attempts: u32,
        source: ConnectorError,
    },
    /// Shutdown was signalled before the operation succeeded.
    Cancelled,
}

impl RetryError {
    /// Attempt count at failure and the underlying error, for DLQ records.
    pub fn into_parts(self) -> Option<(u32, ConnectorError)> {
        match self {
            Self::Exhausted { attempts, source } | Self::Terminal { attempts, source } => {
                Some((attempts, source))
            }
            Self::Cancelled => None,
        }
    }
}

/// Run `op` under the retry policy.
///
/// `op` is called with the 1-based attempt number. `shutdown` aborts waits
/// between attempts; an in-flight attempt runs to completion.
pub async fn run_with_retry<F, Fut, T>(
    policy: &RetryPolicy,
    shutdown: &watch::Receiver<bool>,
    op_name: &str,
    mut op: F,
) -> Result<T, RetryError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, ConnectorError>>,
{
    let mut attempt = 0u32;
    loop {
        if *shutdown.borrow() {
            return Err(RetryError::Cancelled);
        }
        attempt += 1;

        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_transient() => {
                return Err(RetryError::Terminal {
                    attempts: attempt.saturating_sub(1),
                    source: e,
                });
            }
            Err(e) if attempt >= policy.max_attempts => {
                warn!(
                    op = op_name,
                    attempts = attempt,
                    error = %e,
                    "retry attempts exhausted"
                );
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    source: e,
                });
            }
            Err(e) => {
                let delay = policy.delay_for_attempt(attempt);
                debug!(
                    op = op_name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "transient failure, backing off"
                );
                let mut shutdown = shutdown.clone();
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return Err(RetryError::Cancelled);
                        }
                    }
                }
            }
        }
    }
}
