use std::future::Future;
use std::time::Duration;

use discogs_config::shared::RetryConfig;
use metrics::counter;
use rand::Rng;
use tracing::{debug, warn};

use crate::error::{ErrorKind, EtlError, EtlResult};
use crate::etl_error;
use crate::metrics::{DISCOGS_RETRY_ATTEMPTS_TOTAL, OPERATION_LABEL};

/// Bounded exponential backoff.
///
/// Retry `n` (zero based) waits `initial_delay * backoff_base^n`, shifted by up to `jitter` in
/// either direction and capped at `max_delay`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_delay: Duration,
    backoff_base: f64,
    max_delay: Duration,
    jitter: f64,
}

impl RetryPolicy {
    pub fn new(
        max_attempts: u32,
        initial_delay: Duration,
        backoff_base: f64,
        max_delay: Duration,
        jitter: f64,
    ) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay,
            backoff_base: backoff_base.max(1.0),
            max_delay,
            jitter: jitter.clamp(0.0, 0.99),
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            config.max_attempts,
            config.initial_delay(),
            config.backoff_base,
            config.max_delay(),
            config.jitter_percent as f64 / 100.0,
        )
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Attempts including the first call.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before retry `retry` without jitter.
    pub fn base_delay(&self, retry: u32) -> Duration {
        let delay_ms =
            self.initial_delay.as_millis() as f64 * self.backoff_base.powi(retry.min(64) as i32);
        Duration::from_millis(delay_ms.min(self.max_delay.as_millis() as f64) as u64)
    }

    /// Delay before retry `retry`, jittered and capped.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let base = self.base_delay(retry);
        if self.jitter == 0.0 {
            return base;
        }

        let factor = 1.0 + rand::rng().random_range(-self.jitter..=self.jitter);
        base.mul_f64(factor).min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

/// Runs `operation` until it succeeds, fails with an error `is_retryable` rejects, or the
/// policy runs out of attempts.
///
/// `operation` receives the one based attempt number. Exhaustion is reported as
/// [`ErrorKind::RetriesExhausted`] with the last error as source.
pub async fn retry_with_backoff<T, F, Fut, P>(
    policy: &RetryPolicy,
    operation_name: &str,
    is_retryable: P,
    mut operation: F,
) -> EtlResult<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = EtlResult<T>>,
    P: Fn(&EtlError) -> bool,
{
    let mut attempt = 1;

    loop {
        let err = match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if !is_retryable(&err) {
            return Err(err);
        }

        if attempt >= policy.max_attempts {
            warn!(
                operation = operation_name,
                attempts = attempt,
                error = %err.description(),
                "giving up after exhausting retry attempts"
            );

            return Err(etl_error!(
                ErrorKind::RetriesExhausted,
                "Operation failed after exhausting retry attempts",
                format!("{operation_name} failed {attempt} times, last error: {}", err.description()),
                source: err
            ));
        }

        let delay = policy.delay_for(attempt - 1);
        counter!(DISCOGS_RETRY_ATTEMPTS_TOTAL, OPERATION_LABEL => operation_name.to_string())
            .increment(1);
        debug!(
            operation = operation_name,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err.description(),
            "retrying after backoff"
        );

        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}
