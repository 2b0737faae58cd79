use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::shared::ValidationError;
use crate::shared::base::ensure_positive;

/// Bounded exponential backoff settings.
///
/// The delay before retry `n` (zero based) is `initial_delay_ms * backoff_base^n`, shifted by a
/// random jitter of up to `jitter_percent` in either direction and capped at `max_delay_ms`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RetryConfig {
    /// Total number of attempts including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Must be >= 1.0.
    #[serde(default = "default_backoff_base")]
    pub backoff_base: f64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Jitter applied to each delay, in percent. Must be < 100.
    #[serde(default = "default_jitter_percent")]
    pub jitter_percent: u8,
}

impl RetryConfig {
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
    pub const DEFAULT_INITIAL_DELAY_MS: u64 = 1000;
    pub const DEFAULT_BACKOFF_BASE: f64 = 2.0;
    pub const DEFAULT_MAX_DELAY_MS: u64 = 60_000;
    pub const DEFAULT_JITTER_PERCENT: u8 = 25;

    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        ensure_positive("retry.max_attempts", self.max_attempts as u64)?;

        if self.backoff_base.is_nan() || self.backoff_base < 1.0 {
            return Err(ValidationError::InvalidFieldValue {
                field: "retry.backoff_base".to_string(),
                constraint: "must be >= 1.0".to_string(),
            });
        }

        if self.jitter_percent >= 100 {
            return Err(ValidationError::InvalidFieldValue {
                field: "retry.jitter_percent".to_string(),
                constraint: "must be less than 100".to_string(),
            });
        }

        if self.max_delay_ms < self.initial_delay_ms {
            return Err(ValidationError::InvalidFieldValue {
                field: "retry.max_delay_ms".to_string(),
                constraint: "must be >= retry.initial_delay_ms".to_string(),
            });
        }

        Ok(())
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            backoff_base: default_backoff_base(),
            max_delay_ms: default_max_delay_ms(),
            jitter_percent: default_jitter_percent(),
        }
    }
}

fn default_max_attempts() -> u32 {
    RetryConfig::DEFAULT_MAX_ATTEMPTS
}

fn default_initial_delay_ms() -> u64 {
    RetryConfig::DEFAULT_INITIAL_DELAY_MS
}

fn default_backoff_base() -> f64 {
    RetryConfig::DEFAULT_BACKOFF_BASE
}

fn default_max_delay_ms() -> u64 {
    RetryConfig::DEFAULT_MAX_DELAY_MS
}

fn default_jitter_percent() -> u8 {
    RetryConfig::DEFAULT_JITTER_PERCENT
}

/// Circuit breaker settings for a single upstream dependency.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip the breaker open.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Time the breaker stays open before a trial call is allowed.
    #[serde(default = "default_recovery_timeout_ms")]
    pub recovery_timeout_ms: u64,
    /// Jitter applied to the recovery timeout, in percent.
    #[serde(default = "default_recovery_jitter_percent")]
    pub recovery_jitter_percent: u8,
    /// Growth of the recovery timeout each time a trial call fails. 1.0 keeps it fixed.
    #[serde(default = "default_recovery_backoff_multiplier")]
    pub recovery_backoff_multiplier: f64,
    #[serde(default = "default_max_recovery_timeout_ms")]
    pub max_recovery_timeout_ms: u64,
}

impl CircuitBreakerConfig {
    pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
    pub const DEFAULT_RECOVERY_TIMEOUT_MS: u64 = 60_000;
    pub const DEFAULT_RECOVERY_JITTER_PERCENT: u8 = 10;
    pub const DEFAULT_RECOVERY_BACKOFF_MULTIPLIER: f64 = 1.0;
    pub const DEFAULT_MAX_RECOVERY_TIMEOUT_MS: u64 = 300_000;

    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }

    pub fn max_recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.max_recovery_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        ensure_positive("circuit_breaker.failure_threshold", self.failure_threshold as u64)?;
        ensure_positive("circuit_breaker.recovery_timeout_ms", self.recovery_timeout_ms)?;

        if self.recovery_jitter_percent >= 100 {
            return Err(ValidationError::InvalidFieldValue {
                field: "circuit_breaker.recovery_jitter_percent".to_string(),
                constraint: "must be less than 100".to_string(),
            });
        }

        if self.recovery_backoff_multiplier.is_nan() || self.recovery_backoff_multiplier < 1.0 {
            return Err(ValidationError::InvalidFieldValue {
                field: "circuit_breaker.recovery_backoff_multiplier".to_string(),
                constraint: "must be >= 1.0".to_string(),
            });
        }

        if self.max_recovery_timeout_ms < self.recovery_timeout_ms {
            return Err(ValidationError::InvalidFieldValue {
                field: "circuit_breaker.max_recovery_timeout_ms".to_string(),
                constraint: "must be >= circuit_breaker.recovery_timeout_ms".to_string(),
            });
        }

        Ok(())
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_ms: default_recovery_timeout_ms(),
            recovery_jitter_percent: default_recovery_jitter_percent(),
            recovery_backoff_multiplier: default_recovery_backoff_multiplier(),
            max_recovery_timeout_ms: default_max_recovery_timeout_ms(),
        }
    }
}

fn default_failure_threshold() -> u32 {
    CircuitBreakerConfig::DEFAULT_FAILURE_THRESHOLD
}

fn default_recovery_timeout_ms() -> u64 {
    CircuitBreakerConfig::DEFAULT_RECOVERY_TIMEOUT_MS
}

fn default_recovery_jitter_percent() -> u8 {
    CircuitBreakerConfig::DEFAULT_RECOVERY_JITTER_PERCENT
}

fn default_recovery_backoff_multiplier() -> f64 {
    CircuitBreakerConfig::DEFAULT_RECOVERY_BACKOFF_MULTIPLIER
}

fn default_max_recovery_timeout_ms() -> u64 {
    CircuitBreakerConfig::DEFAULT_MAX_RECOVERY_TIMEOUT_MS
}

/// Periodic connection health probing.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthCheckConfig {
    #[serde(default = "default_health_interval_ms")]
    pub interval_ms: u64,
    /// Deadline for a single probe.
    #[serde(default = "default_health_timeout_ms")]
    pub timeout_ms: u64,
}

impl HealthCheckConfig {
    pub const DEFAULT_INTERVAL_MS: u64 = 30_000;
    pub const DEFAULT_TIMEOUT_MS: u64 = 5_000;

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        ensure_positive("health_check.interval_ms", self.interval_ms)?;
        ensure_positive("health_check.timeout_ms", self.timeout_ms)
    }
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_health_interval_ms(),
            timeout_ms: default_health_timeout_ms(),
        }
    }
}

fn default_health_interval_ms() -> u64 {
    HealthCheckConfig::DEFAULT_INTERVAL_MS
}

fn default_health_timeout_ms() -> u64 {
    HealthCheckConfig::DEFAULT_TIMEOUT_MS
}

/// Resilience settings applied to one managed connection (bus or sink).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ResilienceConfig {
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub health_check: HealthCheckConfig,
    /// Deadline for establishing a connection. Defaults to 30 seconds.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Deadline for a single operation executed over the connection. Defaults to 60 seconds.
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,
}

impl ResilienceConfig {
    pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 30_000;
    pub const DEFAULT_OPERATION_TIMEOUT_MS: u64 = 60_000;

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        self.retry.validate()?;
        self.circuit_breaker.validate()?;
        self.health_check.validate()?;
        ensure_positive("connect_timeout_ms", self.connect_timeout_ms)?;
        ensure_positive("operation_timeout_ms", self.operation_timeout_ms)
    }
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            health_check: HealthCheckConfig::default(),
            connect_timeout_ms: default_connect_timeout_ms(),
            operation_timeout_ms: default_operation_timeout_ms(),
        }
    }
}

fn default_connect_timeout_ms() -> u64 {
    ResilienceConfig::DEFAULT_CONNECT_TIMEOUT_MS
}

fn default_operation_timeout_ms() -> u64 {
    ResilienceConfig::DEFAULT_OPERATION_TIMEOUT_MS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resilience_defaults() {
        let config: ResilienceConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.jitter_percent, 25);
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.circuit_breaker.recovery_timeout(), Duration::from_secs(60));
        assert_eq!(config.health_check.interval(), Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_backoff_base_below_one_is_rejected() {
        let config = RetryConfig {
            backoff_base: 0.5,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_max_recovery_below_recovery_is_rejected() {
        let config = CircuitBreakerConfig {
            recovery_timeout_ms: 60_000,
            max_recovery_timeout_ms: 1_000,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
