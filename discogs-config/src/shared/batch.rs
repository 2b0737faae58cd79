use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::shared::ValidationError;
use crate::shared::base::ensure_positive;

/// Batch accumulation settings for the loader.
///
/// A batch is flushed as soon as it holds `max_size` records or its oldest record has
/// waited `flush_interval_ms`, whichever happens first.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct BatchConfig {
    /// Maximum number of records in a batch.
    #[serde(default = "default_batch_max_size")]
    pub max_size: usize,
    /// Maximum time, in milliseconds, a record may wait in a batch before it is flushed.
    #[serde(default = "default_batch_flush_interval_ms")]
    pub flush_interval_ms: u64,
}

impl BatchConfig {
    pub const DEFAULT_MAX_SIZE: usize = 100;

    pub const DEFAULT_FLUSH_INTERVAL_MS: u64 = 5000;

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    /// Validates batch configuration settings.
    pub fn validate(&self) -> Result<(), ValidationError> {
        ensure_positive("batch.max_size", self.max_size as u64)?;
        ensure_positive("batch.flush_interval_ms", self.flush_interval_ms)
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_size: default_batch_max_size(),
            flush_interval_ms: default_batch_flush_interval_ms(),
        }
    }
}

fn default_batch_max_size() -> usize {
    BatchConfig::DEFAULT_MAX_SIZE
}

fn default_batch_flush_interval_ms() -> u64 {
    BatchConfig::DEFAULT_FLUSH_INTERVAL_MS
}
