use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::shared::ValidationError;
use crate::shared::base::{default_data_types, ensure_positive, validate_data_types};

/// Settings of the dump extractor.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExtractorConfig {
    /// Directory scanned for `discogs_YYYYMMDD_<type>.xml.gz` dumps.
    pub data_dir: PathBuf,
    /// Directory holding one state marker file per data type.
    pub state_dir: PathBuf,
    #[serde(default = "default_data_types")]
    pub data_types: Vec<String>,
    /// Number of published records between two state marker checkpoints.
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: u64,
    /// Idle time after which an unfinished data type is reported as stalled.
    #[serde(default = "default_stall_threshold_ms")]
    pub stall_threshold_ms: u64,
    /// Period of progress reports and stall checks.
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,
    /// Attempts made to publish a single record before the file run fails.
    #[serde(default = "default_publish_max_attempts")]
    pub publish_max_attempts: u32,
    /// Capacity of the channel between the decoder and the publisher.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// Publishes waiting for their broker confirmation at the same time.
    #[serde(default = "default_max_in_flight_publishes")]
    pub max_in_flight_publishes: usize,
    /// Ignores state markers and processes every file from the start.
    #[serde(default)]
    pub force_reprocess: bool,
    /// When set, the data directory is rescanned on this period after a full pass.
    #[serde(default)]
    pub rescan_interval_ms: Option<u64>,
}

impl ExtractorConfig {
    pub const DEFAULT_CHECKPOINT_INTERVAL: u64 = 5000;
    pub const DEFAULT_STALL_THRESHOLD_MS: u64 = 120_000;
    pub const DEFAULT_PROGRESS_INTERVAL_MS: u64 = 30_000;
    pub const DEFAULT_PUBLISH_MAX_ATTEMPTS: u32 = 3;
    pub const DEFAULT_CHANNEL_CAPACITY: usize = 1000;
    pub const DEFAULT_MAX_IN_FLIGHT_PUBLISHES: usize = 100;

    pub fn stall_threshold(&self) -> Duration {
        Duration::from_millis(self.stall_threshold_ms)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn rescan_interval(&self) -> Option<Duration> {
        self.rescan_interval_ms.map(Duration::from_millis)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        validate_data_types("extractor.data_types", &self.data_types)?;
        ensure_positive("extractor.checkpoint_interval", self.checkpoint_interval)?;
        ensure_positive("extractor.stall_threshold_ms", self.stall_threshold_ms)?;
        ensure_positive("extractor.progress_interval_ms", self.progress_interval_ms)?;
        ensure_positive("extractor.publish_max_attempts", self.publish_max_attempts as u64)?;
        ensure_positive("extractor.channel_capacity", self.channel_capacity as u64)?;
        ensure_positive(
            "extractor.max_in_flight_publishes",
            self.max_in_flight_publishes as u64,
        )?;
        if let Some(rescan) = self.rescan_interval_ms {
            ensure_positive("extractor.rescan_interval_ms", rescan)?;
        }

        Ok(())
    }
}

fn default_checkpoint_interval() -> u64 {
    ExtractorConfig::DEFAULT_CHECKPOINT_INTERVAL
}

fn default_stall_threshold_ms() -> u64 {
    ExtractorConfig::DEFAULT_STALL_THRESHOLD_MS
}

fn default_progress_interval_ms() -> u64 {
    ExtractorConfig::DEFAULT_PROGRESS_INTERVAL_MS
}

fn default_publish_max_attempts() -> u32 {
    ExtractorConfig::DEFAULT_PUBLISH_MAX_ATTEMPTS
}

fn default_channel_capacity() -> usize {
    ExtractorConfig::DEFAULT_CHANNEL_CAPACITY
}

fn default_max_in_flight_publishes() -> usize {
    ExtractorConfig::DEFAULT_MAX_IN_FLIGHT_PUBLISHES
}
