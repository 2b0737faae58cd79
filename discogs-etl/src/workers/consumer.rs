use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use discogs_config::shared::LoaderConfig;
use futures::StreamExt;
use metrics::counter;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{Instrument, debug, info, warn};

use crate::bus::{BusConsumer, BusDelivery, MessageBus};
use crate::concurrency::shutdown::ShutdownRx;
use crate::concurrency::timer::DeferredTimer;
use crate::error::{ErrorKind, EtlResult};
use crate::etl_error;
use crate::metrics::{DATA_TYPE_LABEL, DISCOGS_RESUBSCRIBE_FAILURES_TOTAL};
use crate::resilience::{RetryPolicy, retry_with_backoff};
use crate::sink::Sink;
use crate::types::DataType;
use crate::workers::batch::{BatchProcessor, FlushReason};
use crate::workers::lifecycle::{ConsumerLifecycle, ConsumerState};

/// Snapshot of a consumer worker, as reported by the health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ConsumerStatus {
    pub data_type: DataType,
    pub state: ConsumerState,
    pub consumer_tag: Option<String>,
    pub messages_received: u64,
    pub records_loaded: u64,
    pub pending_records: usize,
    pub failed_flushes: u64,
    pub poison_suspects: usize,
    /// `total_processed` of the last `file_complete` message.
    pub file_total: Option<u64>,
    pub last_activity: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Set while consumption is paused after a failed flush.
    pub paused: bool,
}

impl ConsumerStatus {
    fn new(data_type: DataType) -> Self {
        Self {
            data_type,
            state: ConsumerState::Active,
            consumer_tag: None,
            messages_received: 0,
            records_loaded: 0,
            pending_records: 0,
            failed_flushes: 0,
            poison_suspects: 0,
            file_total: None,
            last_activity: None,
            last_error: None,
            paused: false,
        }
    }
}

/// Shared, cloneable view of a consumer worker's status.
#[derive(Debug, Clone)]
pub struct ConsumerWorkerState {
    inner: Arc<Mutex<ConsumerStatus>>,
}

impl ConsumerWorkerState {
    fn new(data_type: DataType) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ConsumerStatus::new(data_type))),
        }
    }

    pub fn status(&self) -> ConsumerStatus {
        self.lock().clone()
    }

    fn update(&self, update: impl FnOnce(&mut ConsumerStatus)) {
        update(&mut self.lock());
    }

    fn lock(&self) -> MutexGuard<'_, ConsumerStatus> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Handle of a running [`ConsumerWorker`].
#[derive(Debug)]
pub struct ConsumerWorkerHandle {
    data_type: DataType,
    state: ConsumerWorkerState,
    handle: Option<JoinHandle<EtlResult<()>>>,
}

impl ConsumerWorkerHandle {
    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn state(&self) -> ConsumerWorkerState {
        self.state.clone()
    }

    /// Waits for the worker to stop, either cancelled after completion or shut down.
    pub async fn wait(mut self) -> EtlResult<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };

        handle.await.map_err(|err| {
            etl_error!(
                ErrorKind::ConsumerWorkerPanic,
                "Consumer worker panicked",
                format!("{}: {err}", self.data_type)
            )
        })??;

        Ok(())
    }
}

/// Worker consuming the queue of one data type into a sink.
#[derive(Debug)]
pub struct ConsumerWorker<B, K> {
    data_type: DataType,
    config: Arc<LoaderConfig>,
    bus: Arc<B>,
    sink: K,
    retry_policy: RetryPolicy,
    shutdown_rx: ShutdownRx,
}

impl<B, K> ConsumerWorker<B, K>
where
    B: MessageBus,
    K: Sink,
{
    pub fn new(
        data_type: DataType,
        config: Arc<LoaderConfig>,
        bus: Arc<B>,
        sink: K,
        retry_policy: RetryPolicy,
        shutdown_rx: ShutdownRx,
    ) -> Self {
        Self {
            data_type,
            config,
            bus,
            sink,
            retry_policy,
            shutdown_rx,
        }
    }

    /// Subscribes to the queue and spawns the consume loop.
    pub async fn start(self) -> EtlResult<ConsumerWorkerHandle> {
        let data_type = self.data_type;
        info!(%data_type, consumer_group = %self.config.consumer_group, "starting consumer worker");

        let state = ConsumerWorkerState::new(data_type);
        let consumer = subscribe(&*self.bus, &self.config, data_type, &self.retry_policy).await?;
        state.update(|status| status.consumer_tag = Some(consumer.tag.clone()));

        let span = tracing::info_span!(
            "consumer_worker",
            data_type = %data_type,
            consumer_group = %self.config.consumer_group
        );
        let consume_loop = ConsumeLoop {
            lifecycle: ConsumerLifecycle::new(data_type, self.config.completion_grace()),
            batch: BatchProcessor::new(
                data_type,
                self.sink,
                self.config.batch.clone(),
                self.config.prefetch_count,
                self.config.poison_redelivery_threshold,
            ),
            data_type,
            config: self.config,
            bus: self.bus,
            retry_policy: self.retry_policy,
            consumer,
            state: state.clone(),
            flush_timer: DeferredTimer::new(),
            grace_timer: DeferredTimer::new(),
            resume_timer: DeferredTimer::new(),
            consecutive_failures: 0,
        };
        let handle = tokio::spawn(consume_loop.run(self.shutdown_rx).instrument(span.or_current()));

        Ok(ConsumerWorkerHandle {
            data_type,
            state,
            handle: Some(handle),
        })
    }
}

async fn subscribe<B: MessageBus>(
    bus: &B,
    config: &LoaderConfig,
    data_type: DataType,
    retry_policy: &RetryPolicy,
) -> EtlResult<BusConsumer> {
    retry_with_backoff(
        retry_policy,
        "consume",
        |err| err.is_transient() || err.kind() == ErrorKind::CircuitOpen,
        |_| bus.consume(&config.consumer_group, data_type, config.prefetch_count),
    )
    .await
}

/// What the consume loop does after handling an event.
enum Step {
    Continue,
    Stop,
}

struct ConsumeLoop<B, K> {
    data_type: DataType,
    config: Arc<LoaderConfig>,
    bus: Arc<B>,
    retry_policy: RetryPolicy,
    consumer: BusConsumer,
    lifecycle: ConsumerLifecycle,
    batch: BatchProcessor<K>,
    state: ConsumerWorkerState,
    flush_timer: DeferredTimer,
    grace_timer: DeferredTimer,
    /// Armed while consumption is paused after a failed flush.
    resume_timer: DeferredTimer,
    consecutive_failures: u32,
}

impl<B, K> ConsumeLoop<B, K>
where
    B: MessageBus,
    K: Sink,
{
    async fn run(mut self, mut shutdown_rx: ShutdownRx) -> EtlResult<()> {
        loop {
            self.flush_timer.set(self.batch.deadline());
            self.grace_timer.set(self.lifecycle.grace_deadline());
            let paused = self.resume_timer.is_armed();

            let step = tokio::select! {
                biased;

                _ = shutdown_rx.changed() => {
                    self.stop(FlushReason::Shutdown).await;
                    Step::Stop
                }

                _ = &mut self.resume_timer => {
                    info!(data_type = %self.data_type, "resuming consumption");
                    self.state.update(|status| status.paused = false);
                    Step::Continue
                }

                _ = &mut self.flush_timer => {
                    self.flush(FlushReason::Interval).await;
                    Step::Continue
                }

                _ = &mut self.grace_timer => self.on_grace_elapsed().await,

                delivery = self.consumer.stream.next(), if !paused => match delivery {
                    Some(Ok(delivery)) => {
                        self.on_delivery(delivery).await;
                        Step::Continue
                    }
                    Some(Err(err)) => {
                        warn!(data_type = %self.data_type, error = %err, "consumer stream failed");
                        self.resubscribe(err.to_string(), &mut shutdown_rx).await?
                    }
                    None => {
                        warn!(data_type = %self.data_type, "consumer stream ended");
                        self.resubscribe("consumer stream ended".to_string(), &mut shutdown_rx)
                            .await?
                    }
                },
            };

            if let Step::Stop = step {
                return Ok(());
            }
        }
    }

    async fn on_delivery(&mut self, delivery: BusDelivery) {
        let BusDelivery {
            message,
            redelivered,
            acker,
        } = delivery;
        self.state.update(|status| {
            status.messages_received += 1;
            status.last_activity = Some(Utc::now());
        });

        if message.data_type != self.data_type {
            warn!(data_type = %self.data_type, received = %message.data_type, "rejecting message of another data type");
            if let Err(err) = acker.nack(false).await {
                warn!(data_type = %self.data_type, error = %err, "failed to reject delivery");
            }
            return;
        }

        if message.is_file_complete() {
            // Records received before the completion are stored before it is acknowledged.
            self.flush(FlushReason::FileComplete).await;
            if let Err(err) = acker.ack().await {
                warn!(data_type = %self.data_type, error = %err, "failed to acknowledge file completion");
            }
            self.lifecycle.on_file_complete(message.total_processed);
            self.state.update(|status| {
                status.file_total = message.total_processed;
                status.state = ConsumerState::CompletionPending;
            });
            return;
        }

        self.lifecycle.on_message();
        match message.into_record() {
            Ok(record) => {
                if redelivered {
                    debug!(data_type = %self.data_type, id = %record.id, "received redelivered record");
                }
                if self.batch.accept(record, acker) {
                    self.flush(FlushReason::Size).await;
                }
            }
            Err(err) => {
                warn!(data_type = %self.data_type, error = %err, "rejecting invalid record message");
                if let Err(err) = acker.nack(false).await {
                    warn!(data_type = %self.data_type, error = %err, "failed to reject delivery");
                }
            }
        }
        self.lifecycle.on_message_accepted();
        self.state.update(|status| status.state = self.lifecycle.state());
        self.publish_pending();
    }

    /// Cancels the consumer once the grace period elapsed with an empty batch.
    async fn on_grace_elapsed(&mut self) -> Step {
        if !self.lifecycle.grace_elapsed(Instant::now()) {
            return Step::Continue;
        }

        if !self.batch.is_empty() {
            if !self.flush(FlushReason::Cancel).await {
                // The requeued records come back first, so the grace period starts over.
                self.lifecycle.on_message();
                self.lifecycle.on_message_accepted();
            }
            return Step::Continue;
        }

        info!(
            data_type = %self.data_type,
            grace_secs = self.config.completion_grace().as_secs(),
            "no messages during the grace period, cancelling consumer"
        );
        if let Err(err) = self.consumer.cancel().await {
            warn!(data_type = %self.data_type, error = %err, "failed to cancel consumer");
        }
        self.lifecycle.cancel();
        self.batch.clear_failures();
        self.publish_pending();
        self.state.update(|status| status.state = ConsumerState::Cancelled);

        Step::Stop
    }

    /// Flushes the pending batch. On failure consumption pauses with backoff.
    async fn flush(&mut self, reason: FlushReason) -> bool {
        if self.batch.is_empty() {
            return true;
        }

        let result = self.batch.flush(reason).await;
        let succeeded = match result {
            Ok(summary) => {
                self.consecutive_failures = 0;
                self.state.update(|status| {
                    status.records_loaded += summary.records as u64;
                    status.last_error = None;
                });
                true
            }
            Err(err) => {
                let delay = self.retry_policy.delay_for(self.consecutive_failures);
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                self.resume_timer.start(delay);
                warn!(
                    data_type = %self.data_type,
                    delay_ms = delay.as_millis() as u64,
                    consecutive_failures = self.consecutive_failures,
                    "pausing consumption after failed flush"
                );
                self.state.update(|status| {
                    status.failed_flushes += 1;
                    status.last_error = Some(err.to_string());
                    status.paused = true;
                });
                false
            }
        };
        self.publish_pending();

        succeeded
    }

    /// Replaces a broken subscription.
    ///
    /// Transient failures are retried with capped backoff for as long as the outage lasts.
    /// The worker reports itself paused meanwhile. Stops early on shutdown.
    async fn resubscribe(
        &mut self,
        reason: String,
        shutdown_rx: &mut ShutdownRx,
    ) -> EtlResult<Step> {
        self.flush(FlushReason::Cancel).await;
        if let Err(err) = self.consumer.cancel().await {
            debug!(data_type = %self.data_type, error = %err, "failed to cancel broken consumer");
        }
        self.state.update(|status| {
            status.paused = true;
            status.last_error = Some(reason);
        });

        let mut failures: u32 = 0;
        let consumer = loop {
            let result = self
                .bus
                .consume(
                    &self.config.consumer_group,
                    self.data_type,
                    self.config.prefetch_count,
                )
                .await;
            let err = match result {
                Ok(consumer) => break consumer,
                Err(err) if err.is_transient() || err.kind() == ErrorKind::CircuitOpen => err,
                Err(err) => {
                    self.state
                        .update(|status| status.last_error = Some(err.to_string()));
                    return Err(err);
                }
            };

            let delay = self.retry_policy.delay_for(failures);
            failures = failures.saturating_add(1);
            counter!(DISCOGS_RESUBSCRIBE_FAILURES_TOTAL, DATA_TYPE_LABEL => self.data_type.as_str())
                .increment(1);
            warn!(
                data_type = %self.data_type,
                error = %err,
                failures,
                delay_ms = delay.as_millis() as u64,
                "failed to resubscribe, retrying"
            );
            self.state
                .update(|status| status.last_error = Some(err.to_string()));

            tokio::select! {
                biased;

                _ = shutdown_rx.changed() => {
                    info!(data_type = %self.data_type, "shutdown requested while resubscribing");
                    return Ok(Step::Stop);
                }

                _ = tokio::time::sleep(delay) => {}
            }
        };

        info!(data_type = %self.data_type, consumer_tag = %consumer.tag, failures, "resubscribed consumer");
        let paused = self.resume_timer.is_armed();
        self.state.update(|status| {
            status.consumer_tag = Some(consumer.tag.clone());
            status.paused = paused;
            if !paused {
                status.last_error = None;
            }
        });
        self.consumer = consumer;

        Ok(Step::Continue)
    }

    async fn stop(&mut self, reason: FlushReason) {
        info!(data_type = %self.data_type, pending = self.batch.len(), "stopping consumer worker");
        self.flush(reason).await;
        if let Err(err) = self.consumer.cancel().await {
            warn!(data_type = %self.data_type, error = %err, "failed to cancel consumer");
        }
        self.batch.clear_failures();
        self.publish_pending();
    }

    fn publish_pending(&self) {
        let pending = self.batch.len();
        let suspects = self.batch.poison_suspects().len();
        self.state.update(|status| {
            status.pending_records = pending;
            status.poison_suspects = suspects;
        });
    }
}
