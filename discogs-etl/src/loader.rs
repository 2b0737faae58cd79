//! Loader orchestrating one consumer worker per data type into a sink.

use std::sync::Arc;

use discogs_config::shared::LoaderConfig;
use tracing::{error, info};

use crate::bus::MessageBus;
use crate::concurrency::shutdown::ShutdownRx;
use crate::error::{ErrorKind, EtlError, EtlResult};
use crate::etl_error;
use crate::health::ServiceHealth;
use crate::resilience::RetryPolicy;
use crate::sink::Sink;
use crate::types::DataType;
use crate::workers::{ConsumerStatus, ConsumerWorker, ConsumerWorkerHandle, ConsumerWorkerState};

#[derive(Debug)]
enum LoaderState {
    NotStarted,
    Started {
        workers: Vec<ConsumerWorkerHandle>,
    },
}

#[derive(Debug)]
pub struct Loader<B, K> {
    config: Arc<LoaderConfig>,
    data_types: Vec<DataType>,
    bus: Arc<B>,
    sink: K,
    retry_policy: RetryPolicy,
    state: LoaderState,
    worker_states: Vec<ConsumerWorkerState>,
    shutdown_rx: ShutdownRx,
}

impl<B, K> Loader<B, K>
where
    B: MessageBus,
    K: Sink + Clone,
{
    pub fn new(
        config: LoaderConfig,
        bus: Arc<B>,
        sink: K,
        retry_policy: RetryPolicy,
        shutdown_rx: ShutdownRx,
    ) -> EtlResult<Self> {
        let data_types = DataType::parse_list(&config.data_types)?;

        Ok(Self {
            config: Arc::new(config),
            data_types,
            bus,
            sink,
            retry_policy,
            state: LoaderState::NotStarted,
            worker_states: Vec::new(),
            shutdown_rx,
        })
    }

    pub fn data_types(&self) -> &[DataType] {
        &self.data_types
    }

    /// Prepares the sink and starts a consumer worker for every data type.
    ///
    /// Fails when more deliveries could be in flight than the sink has connections.
    pub async fn start(&mut self) -> EtlResult<()> {
        if let LoaderState::Started { .. } = self.state {
            return Ok(());
        }

        self.config.validate(self.sink.max_connections()).map_err(|err| {
            etl_error!(
                ErrorKind::ConfigError,
                "Invalid loader configuration",
                err.to_string(),
                source: err
            )
        })?;

        info!(
            consumer_group = %self.config.consumer_group,
            sink = K::name(),
            data_types = ?self.data_types,
            "starting loader"
        );

        self.sink.prepare(&self.data_types).await?;

        let mut workers = Vec::with_capacity(self.data_types.len());
        for data_type in self.data_types.iter().copied() {
            let worker = ConsumerWorker::new(
                data_type,
                self.config.clone(),
                self.bus.clone(),
                self.sink.clone(),
                self.retry_policy.clone(),
                self.shutdown_rx.clone(),
            );
            let handle = worker.start().await?;
            self.worker_states.push(handle.state());
            workers.push(handle);
        }

        self.state = LoaderState::Started { workers };

        Ok(())
    }

    /// Waits for every consumer worker to stop, then releases the sink.
    ///
    /// Workers stop once their data type completed and the grace period elapsed, or on shutdown.
    pub async fn wait(self) -> EtlResult<()> {
        let LoaderState::Started { workers } = self.state else {
            info!("loader was not started, nothing to wait for");

            return Ok(());
        };

        let mut errors = vec![];
        for worker in workers {
            let data_type = worker.data_type();
            if let Err(err) = worker.wait().await {
                error!(%data_type, error = %err, "consumer worker failed");
                errors.push(err);
            }
        }

        if let Err(err) = self.sink.shutdown().await {
            errors.push(err);
        }

        info!(consumer_group = %self.config.consumer_group, "loader stopped");

        if !errors.is_empty() {
            return Err(EtlError::from(errors));
        }

        Ok(())
    }

    pub fn statuses(&self) -> Vec<ConsumerStatus> {
        self.worker_states.iter().map(|state| state.status()).collect()
    }

    pub fn health(&self) -> ServiceHealth {
        self.health_view().snapshot()
    }

    /// Returns a view reporting the loader health, which outlives [`Loader::wait`].
    pub fn health_view(&self) -> LoaderHealth<B, K> {
        LoaderHealth {
            service: self.config.consumer_group.clone(),
            bus: self.bus.clone(),
            sink: self.sink.clone(),
            workers: self.worker_states.clone(),
        }
    }
}

/// Health of a started loader: its bus and sink connections and every consumer worker.
#[derive(Debug)]
pub struct LoaderHealth<B, K> {
    service: String,
    bus: Arc<B>,
    sink: K,
    workers: Vec<ConsumerWorkerState>,
}

impl<B, K> LoaderHealth<B, K>
where
    B: MessageBus,
    K: Sink,
{
    pub fn snapshot(&self) -> ServiceHealth {
        let mut connections = vec![self.bus.health()];
        connections.extend(self.sink.health());
        let consumers = self.workers.iter().map(|state| state.status()).collect();

        ServiceHealth::new(self.service.clone(), connections, Vec::new(), consumers)
    }
}
