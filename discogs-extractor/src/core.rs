use std::sync::Arc;

use discogs_config::shared::{ExtractorServiceConfig, ExtractorServiceConfigWithoutSecrets};
use discogs_etl::bus::MessageBus;
use discogs_etl::bus::amqp::AmqpBus;
use discogs_etl::concurrency::shutdown::{ShutdownTx, create_shutdown_channel};
use discogs_etl::extractor::{ExtractionProgress, Extractor};
use discogs_etl::health::ServiceHealth;
use discogs_etl::resilience::RetryPolicy;
use discogs_etl::store::FileStateMarkerStore;
use discogs_telemetry::health::{HealthReporter, start_health_server};
use tokio::signal::unix::{SignalKind, signal};
use tracing::{info, warn};

use crate::error::ExtractorServiceResult;

const SERVICE_NAME: &str = "extractor";

/// Reports the bus connection and the per data type extraction progress.
struct ExtractorHealthReporter {
    bus: Arc<AmqpBus>,
    progress: ExtractionProgress,
}

impl ExtractorHealthReporter {
    fn snapshot(&self) -> ServiceHealth {
        ServiceHealth::new(
            SERVICE_NAME,
            vec![self.bus.health()],
            self.progress.snapshot(),
            Vec::new(),
        )
    }
}

impl HealthReporter for ExtractorHealthReporter {
    fn is_healthy(&self) -> bool {
        self.snapshot().is_healthy()
    }

    fn report(&self) -> serde_json::Value {
        serde_json::to_value(self.snapshot()).unwrap_or_else(|err| {
            serde_json::json!({ "service": SERVICE_NAME, "error": err.to_string() })
        })
    }
}

/// Runs the extractor until every dump is processed, or forever when a rescan interval is set.
pub async fn start_extractor_with_config(
    config: ExtractorServiceConfig,
) -> ExtractorServiceResult<()> {
    info!("starting extractor service");
    log_config(&config);

    let (shutdown_tx, shutdown_rx) = create_shutdown_channel();
    let signal_handle = spawn_signal_listener(shutdown_tx)?;

    let bus = Arc::new(AmqpBus::new(config.amqp.clone()));
    bus.connect().await?;
    let bus_monitor = bus.spawn_health_monitor(shutdown_rx.clone());

    let store = FileStateMarkerStore::new(config.extractor.state_dir.clone());
    let retry_policy = RetryPolicy::from_config(&config.amqp.resilience.retry);
    let rescan_interval = config.extractor.rescan_interval();
    let extractor = Extractor::new(
        config.extractor,
        retry_policy,
        bus.clone(),
        store,
        shutdown_rx,
    )?;

    let health_server = if config.health.enabled {
        let reporter = Arc::new(ExtractorHealthReporter {
            bus: bus.clone(),
            progress: extractor.progress(),
        });
        let server = start_health_server(&config.health, reporter)?;
        Some(tokio::spawn(server))
    } else {
        None
    };

    let result: ExtractorServiceResult<()> = extractor
        .run_periodically(rescan_interval)
        .await
        .map_err(Into::into);

    bus_monitor.abort();
    bus.close().await;
    if let Some(health_server) = health_server {
        health_server.abort();
    }
    signal_handle.abort();

    result
}

/// Flips the shutdown channel on SIGINT or SIGTERM.
fn spawn_signal_listener(
    shutdown_tx: ShutdownTx,
) -> std::io::Result<tokio::task::JoinHandle<()>> {
    let mut sigterm = signal(SignalKind::terminate())?;

    Ok(tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("sigint (ctrl+c) received, shutting down extractor");
            }
            _ = sigterm.recv() => {
                info!("sigterm received, shutting down extractor");
            }
        }

        shutdown_tx.shutdown();
    }))
}

fn log_config(config: &ExtractorServiceConfig) {
    let config: ExtractorServiceConfigWithoutSecrets = config.clone().into();
    match serde_json::to_string(&config) {
        Ok(rendered) => info!(config = %rendered, "extractor configuration"),
        Err(err) => warn!(error = %err, "failed to render extractor configuration"),
    }
}
