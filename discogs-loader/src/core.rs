use std::sync::Arc;

use discogs_config::shared::{
    DestinationConfig, LoaderServiceConfig, LoaderServiceConfigWithoutSecrets,
};
use discogs_destinations::neo4j::Neo4jSink;
use discogs_destinations::postgres::PostgresSink;
use discogs_etl::bus::MessageBus;
use discogs_etl::bus::amqp::AmqpBus;
use discogs_etl::concurrency::shutdown::{ShutdownRx, ShutdownTx, create_shutdown_channel};
use discogs_etl::loader::{Loader, LoaderHealth};
use discogs_etl::resilience::RetryPolicy;
use discogs_etl::sink::Sink;
use discogs_etl::sink::memory::MemorySink;
use discogs_telemetry::health::{HealthReporter, start_health_server};
use tokio::signal::unix::{SignalKind, signal};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::LoaderServiceResult;

struct LoaderHealthReporter<K> {
    health: LoaderHealth<AmqpBus, K>,
}

impl<K: Sink> HealthReporter for LoaderHealthReporter<K> {
    fn is_healthy(&self) -> bool {
        self.health.snapshot().is_healthy()
    }

    fn report(&self) -> serde_json::Value {
        serde_json::to_value(self.health.snapshot())
            .unwrap_or_else(|err| serde_json::json!({ "error": err.to_string() }))
    }
}

/// Runs the loader until every data type completed or shutdown is requested.
pub async fn start_loader_with_config(config: LoaderServiceConfig) -> LoaderServiceResult<()> {
    info!(consumer_group = %config.loader.consumer_group, "starting loader service");
    log_config(&config);

    let (shutdown_tx, shutdown_rx) = create_shutdown_channel();
    let signal_handle = spawn_signal_listener(shutdown_tx)?;

    let bus = Arc::new(AmqpBus::new(config.amqp.clone()));
    bus.connect().await?;
    let mut monitors = vec![bus.spawn_health_monitor(shutdown_rx.clone())];

    let result = match config.destination.clone() {
        DestinationConfig::Memory => {
            warn!("loading into the in-memory sink, records are not persisted");
            run_loader(&config, bus.clone(), MemorySink::new(), shutdown_rx).await
        }
        DestinationConfig::Postgres(sink_config) => {
            let sink = PostgresSink::new(sink_config);
            sink.connect().await?;
            monitors.push(sink.spawn_health_monitor(shutdown_rx.clone()));
            run_loader(&config, bus.clone(), sink, shutdown_rx).await
        }
        DestinationConfig::Neo4j(sink_config) => {
            let sink = Neo4jSink::new(sink_config);
            sink.connect().await?;
            monitors.push(sink.spawn_health_monitor(shutdown_rx.clone()));
            run_loader(&config, bus.clone(), sink, shutdown_rx).await
        }
    };

    for monitor in monitors {
        monitor.abort();
    }
    bus.close().await;
    signal_handle.abort();

    result
}

async fn run_loader<K>(
    config: &LoaderServiceConfig,
    bus: Arc<AmqpBus>,
    sink: K,
    shutdown_rx: ShutdownRx,
) -> LoaderServiceResult<()>
where
    K: Sink + Clone,
{
    let retry_policy = RetryPolicy::from_config(&config.amqp.resilience.retry);
    let mut loader = Loader::new(config.loader.clone(), bus, sink, retry_policy, shutdown_rx)?;
    loader.start().await?;

    let health_server = if config.health.enabled {
        let reporter = Arc::new(LoaderHealthReporter {
            health: loader.health_view(),
        });
        let server = start_health_server(&config.health, reporter)?;
        Some(tokio::spawn(server))
    } else {
        None
    };

    let result = loader.wait().await;

    if let Some(health_server) = health_server {
        health_server.abort();
    }
    result?;

    info!(consumer_group = %config.loader.consumer_group, "loader finished");

    Ok(())
}

/// Flips the shutdown channel on SIGINT or SIGTERM.
fn spawn_signal_listener(shutdown_tx: ShutdownTx) -> std::io::Result<JoinHandle<()>> {
    let mut sigterm = signal(SignalKind::terminate())?;

    Ok(tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("sigint (ctrl+c) received, shutting down loader");
            }
            _ = sigterm.recv() => {
                info!("sigterm received, shutting down loader");
            }
        }

        shutdown_tx.shutdown();
    }))
}

fn log_config(config: &LoaderServiceConfig) {
    let config: LoaderServiceConfigWithoutSecrets = config.clone().into();
    match serde_json::to_string(&config) {
        Ok(rendered) => info!(config = %rendered, "loader configuration"),
        Err(err) => warn!(error = %err, "failed to render loader configuration"),
    }
}
