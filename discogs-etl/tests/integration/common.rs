use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use discogs_config::shared::{BatchConfig, ExtractorConfig, LoaderConfig};
use discogs_etl::bus::memory::MemoryBus;
use discogs_etl::concurrency::shutdown::ShutdownRx;
use discogs_etl::extractor::Extractor;
use discogs_etl::loader::Loader;
use discogs_etl::resilience::RetryPolicy;
use discogs_etl::sink::Sink;
use discogs_etl::store::FileStateMarkerStore;

pub const GRAPH_GROUP: &str = "graphinator";
pub const TABLE_GROUP: &str = "tableinator";

pub fn fast_retries() -> RetryPolicy {
    RetryPolicy::new(5, Duration::from_millis(1), 2.0, Duration::from_millis(10), 0.0)
}

pub fn extractor_config(data_dir: &Path, data_types: &[&str]) -> ExtractorConfig {
    ExtractorConfig {
        data_dir: data_dir.to_path_buf(),
        state_dir: data_dir.join("state"),
        data_types: data_types.iter().map(|name| name.to_string()).collect(),
        checkpoint_interval: 2,
        stall_threshold_ms: ExtractorConfig::DEFAULT_STALL_THRESHOLD_MS,
        progress_interval_ms: ExtractorConfig::DEFAULT_PROGRESS_INTERVAL_MS,
        publish_max_attempts: 3,
        channel_capacity: 16,
        max_in_flight_publishes: 8,
        force_reprocess: false,
        rescan_interval_ms: None,
    }
}

pub fn loader_config(consumer_group: &str, data_types: &[&str]) -> LoaderConfig {
    LoaderConfig {
        consumer_group: consumer_group.to_string(),
        data_types: data_types.iter().map(|name| name.to_string()).collect(),
        prefetch_count: 10,
        batch: BatchConfig {
            max_size: 10,
            flush_interval_ms: 200,
        },
        completion_grace_ms: 200,
        poison_redelivery_threshold: 3,
    }
}

pub fn create_extractor(
    config: ExtractorConfig,
    bus: &Arc<MemoryBus>,
    shutdown_rx: ShutdownRx,
) -> Extractor<MemoryBus, FileStateMarkerStore> {
    let store = FileStateMarkerStore::new(config.state_dir.clone());
    Extractor::new(config, fast_retries(), bus.clone(), store, shutdown_rx).unwrap()
}

pub async fn start_loader<K: Sink + Clone>(
    config: LoaderConfig,
    bus: &Arc<MemoryBus>,
    sink: K,
    shutdown_rx: ShutdownRx,
) -> Loader<MemoryBus, K> {
    let mut loader = Loader::new(config, bus.clone(), sink, fast_retries(), shutdown_rx).unwrap();
    loader.start().await.unwrap();
    loader
}

/// Waits for a loader whose data types all completed to cancel its consumers.
pub async fn wait_for_loader<K: Sink + Clone>(loader: Loader<MemoryBus, K>) {
    tokio::time::timeout(Duration::from_secs(10), loader.wait())
        .await
        .expect("loader did not stop after the grace period")
        .unwrap();
}
