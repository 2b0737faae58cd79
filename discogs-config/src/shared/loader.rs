use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::shared::base::{default_data_types, ensure_positive, validate_data_types};
use crate::shared::{BatchConfig, ValidationError};

/// Settings of a loader consuming records into one sink.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoaderConfig {
    /// Consumer group, for example `graphinator` or `tableinator`.
    pub consumer_group: String,
    #[serde(default = "default_data_types")]
    pub data_types: Vec<String>,
    /// Unacknowledged deliveries held per consumer. Bounds the records in flight.
    #[serde(default = "default_prefetch_count")]
    pub prefetch_count: u16,
    #[serde(default)]
    pub batch: BatchConfig,
    /// Time a consumer stays subscribed after its data type completed.
    #[serde(default = "default_completion_grace_ms")]
    pub completion_grace_ms: u64,
    /// Failed flushes of the same record after which it is reported as a poison message.
    #[serde(default = "default_poison_redelivery_threshold")]
    pub poison_redelivery_threshold: u32,
}

impl LoaderConfig {
    pub const DEFAULT_PREFETCH_COUNT: u16 = 100;
    pub const DEFAULT_COMPLETION_GRACE_MS: u64 = 300_000;
    pub const DEFAULT_POISON_REDELIVERY_THRESHOLD: u32 = 3;

    pub fn completion_grace(&self) -> Duration {
        Duration::from_millis(self.completion_grace_ms)
    }

    /// Validates the loader settings against the pool size of its sink.
    ///
    /// A batch can never hold more records than the bus hands out unacknowledged, so
    /// `batch.max_size` is bounded by `prefetch_count`.
    pub fn validate(&self, max_connections: Option<u32>) -> Result<(), ValidationError> {
        if self.consumer_group.is_empty() {
            return Err(ValidationError::InvalidFieldValue {
                field: "loader.consumer_group".to_string(),
                constraint: "must not be empty".to_string(),
            });
        }
        validate_data_types("loader.data_types", &self.data_types)?;
        ensure_positive("loader.prefetch_count", self.prefetch_count as u64)?;
        ensure_positive("loader.completion_grace_ms", self.completion_grace_ms)?;
        ensure_positive(
            "loader.poison_redelivery_threshold",
            self.poison_redelivery_threshold as u64,
        )?;
        self.batch.validate()?;

        if let Some(max_connections) = max_connections {
            if self.prefetch_count as u32 > max_connections {
                return Err(ValidationError::PrefetchExceedsConnections {
                    prefetch_count: self.prefetch_count,
                    max_connections,
                });
            }
        }

        if self.batch.max_size > self.prefetch_count as usize {
            return Err(ValidationError::BatchExceedsPrefetch {
                max_size: self.batch.max_size,
                prefetch_count: self.prefetch_count,
            });
        }

        Ok(())
    }
}

fn default_prefetch_count() -> u16 {
    LoaderConfig::DEFAULT_PREFETCH_COUNT
}

fn default_completion_grace_ms() -> u64 {
    LoaderConfig::DEFAULT_COMPLETION_GRACE_MS
}

fn default_poison_redelivery_threshold() -> u32 {
    LoaderConfig::DEFAULT_POISON_REDELIVERY_THRESHOLD
}
