//! Bounded retries with exponential backoff and jitter.
//!
//! Every outbound caller goes through [`Retrier::run`]. Classification is
//! narrow: transport-level failures and the configured retryable status
//! codes retry; everything else surfaces immediately.

use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::errors::TetherError;

/// Status codes retried by the default profile.
const DEFAULT_RETRYABLE_STATUSES: [u16; 4] = [500, 502, 503, 504];

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Number of retries after the first attempt (total attempts = `max_retries + 1`).
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
    pub retryable_status_codes: HashSet<u16>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            jitter: true,
            retryable_status_codes: DEFAULT_RETRYABLE_STATUSES.into_iter().collect(),
        }
    }
}

impl RetryConfig {
    /// Default profile plus 429 — for callers that prefer waiting out
    /// rate limits over failing fast.
    pub fn aggressive() -> Self {
        let mut config = Self::default();
        config.retryable_status_codes.insert(429);
        config
    }

    /// Delay before the k-th retry (1-indexed), before jitter.
    fn delay_for(&self, retry: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(retry.saturating_sub(1)));
        exp.min(self.max_delay)
    }
}

/// Atomic counters shared by all calls through one [`Retrier`].
#[derive(Debug, Default)]
pub struct RetryStats {
    attempts: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    retries: AtomicU64,
    total_delay_ms: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryStatsSnapshot {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub retries: u64,
    pub total_delay_ms: u64,
}

impl RetryStats {
    pub fn snapshot(&self) -> RetryStatsSnapshot {
        RetryStatsSnapshot {
            attempts: self.attempts.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            total_delay_ms: self.total_delay_ms.load(Ordering::Relaxed),
        }
    }
}

pub struct Retrier {
    config: RetryConfig,
    stats: RetryStats,
}

impl Retrier {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            stats: RetryStats::default(),
        }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn stats(&self) -> RetryStatsSnapshot {
        self.stats.snapshot()
    }

    /// Whether a failed attempt is eligible for another try.
    ///
    /// A `Transient` error without a status is a transport failure
    /// (timeout, reset) and retries. With a status, the configured code
    /// set decides. `RateLimited` retries only when the profile opted
    /// into 429.
    fn should_retry(&self, err: &TetherError) -> bool {
        match err {
            TetherError::Transient { status: None, .. } => true,
            TetherError::Transient {
                status: Some(code), ..
            } => self.config.retryable_status_codes.contains(code),
            TetherError::RateLimited { .. } => self.config.retryable_status_codes.contains(&429),
            _ => false,
        }
    }

    /// Run `op` with up to `max_retries` re-attempts.
    ///
    /// `op` receives the 1-indexed attempt number. Cancellation during a
    /// backoff sleep returns immediately without a further attempt. A
    /// final failure carries the last error wrapped with the attempt
    /// count and total elapsed time.
    pub async fn run<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T, TetherError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, TetherError>>,
    {
        let started = Instant::now();
        let total_attempts = self.config.max_retries + 1;
        let mut last_err: Option<TetherError> = None;

        for attempt in 1..=total_attempts {
            if cancel.is_cancelled() {
                return Err(TetherError::Internal(anyhow::anyhow!(
                    "cancelled before attempt {}",
                    attempt
                )));
            }

            self.stats.attempts.fetch_add(1, Ordering::Relaxed);
            match op(attempt).await {
                Ok(value) => {
                    self.stats.successes.fetch_add(1, Ordering::Relaxed);
                    return Ok(value);
                }
                Err(err) => {
                    if !self.should_retry(&err) {
                        self.stats.failures.fetch_add(1, Ordering::Relaxed);
                        return Err(err);
                    }
                    warn!("attempt {}/{} failed: {}", attempt, total_attempts, err);
                    if attempt < total_attempts {
                        let delay = self.next_delay(attempt, &err);
                        self.stats
                            .total_delay_ms
                            .fetch_add(delay.as_millis() as u64, Ordering::Relaxed);
                        self.stats.retries.fetch_add(1, Ordering::Relaxed);
                        debug!("backing off {}ms before retry", delay.as_millis());
                        tokio::select! {
                            () = cancel.cancelled() => {
                                self.stats.failures.fetch_add(1, Ordering::Relaxed);
                                return Err(TetherError::Internal(anyhow::anyhow!(
                                    "cancelled while backing off after attempt {}",
                                    attempt
                                )));
                            }
                            () = tokio::time::sleep(delay) => {}
                        }
                    }
                    last_err = Some(err);
                }
            }
        }

        self.stats.failures.fetch_add(1, Ordering::Relaxed);
        let elapsed = started.elapsed();
        let cause = last_err.unwrap_or_else(|| {
            TetherError::Fatal("retry loop exhausted without recording an error".into())
        });
        let status = match &cause {
            TetherError::Transient { status, .. } => *status,
            TetherError::RateLimited { .. } => Some(429),
            _ => None,
        };
        Err(TetherError::Transient {
            message: format!(
                "{} attempts failed over {}ms: {}",
                total_attempts,
                elapsed.as_millis(),
                cause
            ),
            status,
        })
    }

    /// Backoff for the retry following `attempt`. A rate-limit
    /// `retry_after` hint overrides the exponential schedule (still
    /// capped by `max_delay`).
    fn next_delay(&self, attempt: u32, err: &TetherError) -> Duration {
        if let TetherError::RateLimited {
            retry_after: Some(secs),
        } = err
        {
            return Duration::from_secs(*secs).min(self.config.max_delay);
        }
        let base = self.config.delay_for(attempt);
        if self.config.jitter {
            let noise = base.mul_f64(0.1 * fastrand::f64());
            base + noise
        } else {
            base
        }
    }
}

impl Default for Retrier {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

#[cfg(test)]
mod tests;
