use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use discogs_config::shared::ExtractorConfig;
use futures::future::{BoxFuture, join_all};
use futures::{FutureExt, StreamExt};
use futures::stream::FuturesOrdered;
use metrics::counter;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::bus::MessageBus;
use crate::concurrency::shutdown::{ShutdownRx, is_shutdown_requested};
use crate::error::{ErrorKind, EtlError, EtlResult};
use crate::etl_error;
use crate::extractor::archive::{DecodeOutcome, RecordSource, XmlDumpReader};
use crate::extractor::discovery::{DumpFile, discover_dumps};
use crate::extractor::progress::{ExtractionProgress, spawn_progress_monitor};
use crate::metrics::{
    DATA_TYPE_LABEL, DISCOGS_CHECKPOINTS_TOTAL, DISCOGS_EXTRACTION_PASS_FAILURES_TOTAL,
    DISCOGS_FILES_COMPLETED_TOTAL, DISCOGS_PUBLISH_FAILURES_TOTAL, DISCOGS_RECORDS_MALFORMED_TOTAL,
    DISCOGS_RECORDS_PUBLISHED_TOTAL,
};
use crate::resilience::{RetryPolicy, retry_with_backoff};
use crate::state::{ProcessingDecision, StateMarker};
use crate::store::StateMarkerStore;
use crate::types::{BusMessage, DataType};

/// How the run over one dump file ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOutcome {
    /// The stored marker shows the file was fully processed already.
    Skipped,
    Completed { records: u64, malformed: u64 },
    /// Shutdown was requested. The marker holds the position to resume from.
    Interrupted { offset: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSummary {
    pub data_type: DataType,
    pub file: String,
    pub outcome: FileOutcome,
}

/// Record of the archive whose publish has settled.
enum Settled {
    Published(String),
    Malformed,
}

enum SourceEvent {
    Decoded(Option<EtlResult<DecodeOutcome>>),
    Settled((Settled, EtlResult<()>)),
}

/// Position of a file run. Mirrors the marker fields between two checkpoints.
#[derive(Debug, Clone, Copy)]
struct Position {
    offset: u64,
    total_records: u64,
    malformed_records: u64,
    since_checkpoint: u64,
}

impl Position {
    fn from_marker(marker: &StateMarker) -> Self {
        Self {
            offset: marker.offset,
            total_records: marker.total_records,
            malformed_records: marker.malformed_records,
            since_checkpoint: 0,
        }
    }
}

/// Streams dump files onto the bus, one concurrent run per data type.
///
/// Progress of every run is checkpointed into a [`StateMarkerStore`], so a restarted
/// extractor resumes where the previous one stopped.
#[derive(Debug)]
pub struct Extractor<B, S> {
    config: Arc<ExtractorConfig>,
    data_types: Vec<DataType>,
    retry_policy: RetryPolicy,
    bus: Arc<B>,
    store: S,
    progress: ExtractionProgress,
    /// Set until the first pass over the data directory started.
    force_reprocess: AtomicBool,
    shutdown_rx: ShutdownRx,
}

impl<B, S> Extractor<B, S>
where
    B: MessageBus,
    S: StateMarkerStore + Send + Sync,
{
    pub fn new(
        config: ExtractorConfig,
        retry_policy: RetryPolicy,
        bus: Arc<B>,
        store: S,
        shutdown_rx: ShutdownRx,
    ) -> EtlResult<Self> {
        let data_types = DataType::parse_list(&config.data_types)?;
        // Publishing is bounded separately from the connection level retries.
        let retry_policy = retry_policy.with_max_attempts(config.publish_max_attempts);

        Ok(Self {
            force_reprocess: AtomicBool::new(config.force_reprocess),
            config: Arc::new(config),
            data_types,
            retry_policy,
            bus,
            store,
            progress: ExtractionProgress::new(),
            shutdown_rx,
        })
    }

    pub fn progress(&self) -> ExtractionProgress {
        self.progress.clone()
    }

    pub fn bus(&self) -> &Arc<B> {
        &self.bus
    }

    /// Runs passes over the data directory until shutdown, or once without `rescan_interval`.
    ///
    /// A failed first pass is returned. Later passes only log their failure and the next
    /// rescan retries, resuming from the stored markers.
    pub async fn run_periodically(&self, rescan_interval: Option<Duration>) -> EtlResult<()> {
        let mut shutdown_rx = self.shutdown_rx.clone();
        let mut first_pass = true;

        loop {
            match self.run().await {
                Ok(summaries) => log_summaries(&summaries),
                Err(err) if first_pass => return Err(err),
                Err(err) => {
                    counter!(DISCOGS_EXTRACTION_PASS_FAILURES_TOTAL).increment(1);
                    error!(error = %err, "extraction pass failed, retrying on the next rescan");
                }
            }
            first_pass = false;

            if is_shutdown_requested(&shutdown_rx) {
                info!("extractor stopped by shutdown");
                return Ok(());
            }

            let Some(rescan_interval) = rescan_interval else {
                info!("all dump files processed");
                return Ok(());
            };

            info!(
                rescan_secs = rescan_interval.as_secs(),
                "waiting before rescanning the data directory"
            );
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    info!("extractor stopped by shutdown");
                    return Ok(());
                }
                _ = tokio::time::sleep(rescan_interval) => {}
            }
        }
    }

    /// Processes the newest dump of every configured data type.
    ///
    /// Files are processed concurrently. Errors of individual files are collected and
    /// returned together once every file run ended. A configured forced reprocess applies
    /// to the first pass that finds dump files only.
    pub async fn run(&self) -> EtlResult<Vec<FileSummary>> {
        let dumps = discover_dumps(&self.config.data_dir, &self.data_types).await?;
        if dumps.is_empty() {
            warn!(data_dir = %self.config.data_dir.display(), "no dump files found");

            return Ok(Vec::new());
        }

        self.bus.declare_topology(&self.data_types).await?;
        let force_reprocess = self.force_reprocess.swap(false, Ordering::SeqCst);

        let monitor = spawn_progress_monitor(
            self.progress.clone(),
            self.config.progress_interval(),
            self.config.stall_threshold(),
            self.shutdown_rx.clone(),
        );

        let results = join_all(
            dumps
                .iter()
                .map(|dump| self.run_dump(dump, force_reprocess)),
        )
        .await;
        monitor.abort();

        let mut summaries = Vec::with_capacity(results.len());
        let mut errors: Vec<EtlError> = Vec::new();
        for (dump, result) in dumps.iter().zip(results) {
            match result {
                Ok(outcome) => summaries.push(FileSummary {
                    data_type: dump.data_type,
                    file: dump.file_name().to_string(),
                    outcome,
                }),
                Err(err) => {
                    error!(data_type = %dump.data_type, file = dump.file_name(), error = %err, "dump file run failed");
                    errors.push(err);
                }
            }
        }

        if !errors.is_empty() {
            return Err(errors.into());
        }

        Ok(summaries)
    }

    /// Decides between skipping, resuming and reprocessing `dump`, then runs it.
    pub async fn process_dump(&self, dump: &DumpFile) -> EtlResult<FileOutcome> {
        self.run_dump(dump, self.force_reprocess.load(Ordering::SeqCst))
            .await
    }

    async fn run_dump(&self, dump: &DumpFile, force_reprocess: bool) -> EtlResult<FileOutcome> {
        let data_type = dump.data_type;
        let decision = self
            .store
            .should_skip(data_type, &dump.identity, force_reprocess)
            .await?;

        let marker = match decision {
            ProcessingDecision::Skip => {
                info!(%data_type, file = dump.file_name(), "dump file already processed, skipping");
                self.progress.mark_completed(data_type);

                return Ok(FileOutcome::Skipped);
            }
            ProcessingDecision::Continue { offset } => {
                match self.store.load(data_type).await? {
                    Some(marker) => {
                        info!(%data_type, file = dump.file_name(), offset, "resuming dump file");
                        marker
                    }
                    None => StateMarker::new(data_type, dump.identity.clone()),
                }
            }
            ProcessingDecision::Reprocess => {
                info!(%data_type, file = dump.file_name(), "processing dump file from the start");
                let marker = StateMarker::new(data_type, dump.identity.clone());
                self.store.save(&marker).await?;
                marker
            }
        };

        let path = dump.path.clone();
        let source = tokio::task::spawn_blocking(move || XmlDumpReader::open(&path, data_type))
            .await
            .map_err(|err| {
                etl_error!(
                    ErrorKind::ExtractorWorkerPanic,
                    "Dump reader panicked while opening the file",
                    source: err
                )
            })??;

        self.process_source(marker, source, dump.file_name()).await
    }

    /// Publishes the records of `source` starting after `marker.offset`.
    ///
    /// Decoding runs on a blocking thread that feeds a bounded channel, so a slow bus
    /// throttles decoding instead of buffering the archive in memory. Up to
    /// `max_in_flight_publishes` records wait for their confirmation at once. The position
    /// only advances over the prefix of records confirmed in archive order.
    pub async fn process_source<R>(
        &self,
        mut marker: StateMarker,
        source: R,
        file: &str,
    ) -> EtlResult<FileOutcome>
    where
        R: RecordSource,
    {
        let data_type = marker.data_type;
        let mut position = Position::from_marker(&marker);
        self.progress.start_file(data_type, file, position.total_records);

        let (tx, mut rx) = mpsc::channel(self.config.channel_capacity);
        let resume_offset = marker.offset;
        let decoder = tokio::task::spawn_blocking(move || decode(source, resume_offset, tx));

        let window = self.config.max_in_flight_publishes.max(1);
        let mut in_flight: FuturesOrdered<BoxFuture<'_, (Settled, EtlResult<()>)>> =
            FuturesOrdered::new();
        let mut decoding = true;
        let mut interrupted = false;
        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            if decoding && is_shutdown_requested(&shutdown_rx) {
                decoding = false;
                interrupted = true;
            }
            if !decoding && in_flight.is_empty() {
                break;
            }

            let event = tokio::select! {
                biased;

                _ = shutdown_rx.changed(), if decoding => {
                    decoding = false;
                    interrupted = true;
                    continue;
                }

                Some(settled) = in_flight.next(), if !in_flight.is_empty() => SourceEvent::Settled(settled),

                next = rx.recv(), if decoding && in_flight.len() < window => SourceEvent::Decoded(next),
            };

            match event {
                SourceEvent::Decoded(Some(Ok(outcome))) => {
                    in_flight.push_back(self.settle(data_type, file, outcome).boxed());
                    continue;
                }
                SourceEvent::Decoded(Some(Err(err))) => {
                    // The marker keeps the last checkpoint, which only covers records that
                    // were decoded from an intact stream.
                    error!(
                        %data_type,
                        file,
                        offset = position.offset,
                        checkpoint = marker.offset,
                        error = %err,
                        "dump file is corrupted, stopping the file run"
                    );

                    return Err(err);
                }
                SourceEvent::Decoded(None) => {
                    decoding = false;
                    continue;
                }
                SourceEvent::Settled((Settled::Published(_), Ok(()))) => {
                    position.offset += 1;
                    position.total_records += 1;
                    position.since_checkpoint += 1;
                    self.progress.record_published(data_type, position.total_records);
                    counter!(DISCOGS_RECORDS_PUBLISHED_TOTAL, DATA_TYPE_LABEL => data_type.as_str())
                        .increment(1);
                }
                SourceEvent::Settled((Settled::Published(record_id), Err(err))) => {
                    counter!(DISCOGS_PUBLISH_FAILURES_TOTAL, DATA_TYPE_LABEL => data_type.as_str())
                        .increment(1);
                    error!(
                        %data_type,
                        file,
                        record_id = %record_id,
                        offset = position.offset,
                        in_flight = in_flight.len(),
                        error = %err,
                        "failed to publish record, stopping the file run"
                    );
                    // Everything before the failed record is on the bus. Publishes after it
                    // are dropped and repeated by the next run.
                    drop(in_flight);
                    self.checkpoint(&mut marker, &mut position).await?;

                    return Err(err);
                }
                SourceEvent::Settled((Settled::Malformed, _)) => {
                    position.offset += 1;
                    position.malformed_records += 1;
                    position.since_checkpoint += 1;
                    self.progress.record_malformed(data_type);
                    counter!(DISCOGS_RECORDS_MALFORMED_TOTAL, DATA_TYPE_LABEL => data_type.as_str())
                        .increment(1);
                }
            }

            if position.since_checkpoint >= self.config.checkpoint_interval {
                self.checkpoint(&mut marker, &mut position).await?;
            }
        }

        if interrupted {
            return self.interrupt(&mut marker, position, file).await;
        }

        decoder.await.map_err(|err| {
            etl_error!(
                ErrorKind::ExtractorWorkerPanic,
                "Dump decoder panicked",
                file,
                source: err
            )
        })?;

        self.finish(marker, position, file).await
    }

    /// Publishes a decoded record. Malformed records settle at once and only keep their
    /// place in the archive order.
    async fn settle(
        &self,
        data_type: DataType,
        file: &str,
        outcome: DecodeOutcome,
    ) -> (Settled, EtlResult<()>) {
        match outcome {
            DecodeOutcome::Record(record) => {
                let record_id = record.id.clone();
                let result = self.publish(&BusMessage::record(record)).await;

                (Settled::Published(record_id), result)
            }
            DecodeOutcome::Malformed { position, reason } => {
                warn!(%data_type, file, record = position, reason = %reason, "skipping malformed record");

                (Settled::Malformed, Ok(()))
            }
        }
    }

    async fn finish(
        &self,
        mut marker: StateMarker,
        mut position: Position,
        file: &str,
    ) -> EtlResult<FileOutcome> {
        let data_type = marker.data_type;

        let completion = BusMessage::file_complete(data_type, position.total_records, file);
        if let Err(err) = self.publish(&completion).await {
            error!(%data_type, file, error = %err, "failed to publish file completion");
            self.checkpoint(&mut marker, &mut position).await?;

            return Err(err);
        }

        marker.advance(
            position.offset,
            position.total_records,
            position.malformed_records,
        )?;
        marker.complete();
        self.store.save(&marker).await?;

        self.progress.mark_completed(data_type);
        counter!(DISCOGS_FILES_COMPLETED_TOTAL, DATA_TYPE_LABEL => data_type.as_str()).increment(1);
        info!(
            %data_type,
            file,
            records = position.total_records,
            malformed = position.malformed_records,
            "dump file completed"
        );

        Ok(FileOutcome::Completed {
            records: position.total_records,
            malformed: position.malformed_records,
        })
    }

    async fn interrupt(
        &self,
        marker: &mut StateMarker,
        mut position: Position,
        file: &str,
    ) -> EtlResult<FileOutcome> {
        self.checkpoint(marker, &mut position).await?;
        info!(data_type = %marker.data_type, file, offset = position.offset, "shutdown requested, dump file run interrupted");

        Ok(FileOutcome::Interrupted {
            offset: position.offset,
        })
    }

    async fn checkpoint(&self, marker: &mut StateMarker, position: &mut Position) -> EtlResult<()> {
        marker.advance(
            position.offset,
            position.total_records,
            position.malformed_records,
        )?;
        self.store.save(marker).await?;
        position.since_checkpoint = 0;

        counter!(DISCOGS_CHECKPOINTS_TOTAL, DATA_TYPE_LABEL => marker.data_type.as_str())
            .increment(1);
        debug!(
            data_type = %marker.data_type,
            offset = marker.offset,
            total_records = marker.total_records,
            "state marker saved"
        );

        Ok(())
    }

    async fn publish(&self, message: &BusMessage) -> EtlResult<()> {
        retry_with_backoff(
            &self.retry_policy,
            "publish",
            |err| err.is_transient() || err.kind() == ErrorKind::CircuitOpen,
            |_| self.bus.publish(message),
        )
        .await
    }
}

fn log_summaries(summaries: &[FileSummary]) {
    for summary in summaries {
        match summary.outcome {
            FileOutcome::Skipped => {
                debug!(data_type = %summary.data_type, file = %summary.file, "dump file already processed")
            }
            FileOutcome::Completed { records, malformed } => info!(
                data_type = %summary.data_type,
                file = %summary.file,
                records,
                malformed,
                "dump file completed"
            ),
            FileOutcome::Interrupted { offset } => warn!(
                data_type = %summary.data_type,
                file = %summary.file,
                offset,
                "dump file interrupted, the next run resumes from the checkpoint"
            ),
        }
    }
}

/// Feeds the outcomes of `source` after the first `offset` records into `tx`.
///
/// Stops at the end of the archive, at the first structural error, or once the receiver
/// is gone.
fn decode<R: RecordSource>(
    mut source: R,
    offset: u64,
    tx: mpsc::Sender<EtlResult<DecodeOutcome>>,
) {
    match source.skip(offset) {
        Ok(skipped) if skipped < offset => {
            let _ = tx.blocking_send(Err(etl_error!(
                ErrorKind::InvalidState,
                "Dump file has fewer records than the resume offset",
                format!("resume offset {offset}, records {skipped}")
            )));
            return;
        }
        Ok(_) => {}
        Err(err) => {
            let _ = tx.blocking_send(Err(err));
            return;
        }
    }

    loop {
        let outcome = match source.next_outcome() {
            Ok(Some(outcome)) => Ok(outcome),
            Ok(None) => return,
            Err(err) => Err(err),
        };
        let failed = outcome.is_err();

        if tx.blocking_send(outcome).is_err() || failed {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, AtomicUsize};

    use discogs_config::shared::RetryConfig;
    use tokio::sync::Semaphore;

    use super::*;
    use crate::bus::memory::MemoryBus;
    use crate::concurrency::shutdown::{ShutdownTx, create_shutdown_channel};
    use crate::state::SourceIdentity;
    use crate::store::MemoryStateMarkerStore;
    use crate::test_utils::archive::{MemoryRecordSource, dump_xml, write_dump};
    use crate::test_utils::record::artist;
    use crate::types::MessageKind;

    fn config(checkpoint_interval: u64) -> ExtractorConfig {
        ExtractorConfig {
            data_dir: PathBuf::from("/unused"),
            state_dir: PathBuf::from("/unused"),
            data_types: vec!["artists".to_string(), "labels".to_string()],
            checkpoint_interval,
            stall_threshold_ms: ExtractorConfig::DEFAULT_STALL_THRESHOLD_MS,
            progress_interval_ms: ExtractorConfig::DEFAULT_PROGRESS_INTERVAL_MS,
            publish_max_attempts: 3,
            channel_capacity: 4,
            max_in_flight_publishes: 8,
            force_reprocess: false,
            rescan_interval_ms: None,
        }
    }

    fn fast_retries() -> RetryPolicy {
        RetryPolicy::new(5, Duration::from_millis(1), 2.0, Duration::from_millis(5), 0.0)
    }

    fn extractor(
        config: ExtractorConfig,
        bus: MemoryBus,
        store: MemoryStateMarkerStore,
        shutdown_rx: ShutdownRx,
    ) -> Extractor<MemoryBus, MemoryStateMarkerStore> {
        Extractor::new(config, fast_retries(), Arc::new(bus), store, shutdown_rx).unwrap()
    }

    fn identity() -> SourceIdentity {
        SourceIdentity::new("discogs_20250101_artists.xml.gz", 512)
    }

    fn records(count: usize) -> MemoryRecordSource {
        MemoryRecordSource::from_records(
            (1..=count).map(|i| artist(&format!("a{i}"), &format!("h{i}"))),
        )
    }

    #[tokio::test]
    async fn test_checkpoints_every_interval_and_completes() {
        let bus = MemoryBus::new(["tableinator"]);
        let store = MemoryStateMarkerStore::new();
        let (_shutdown_tx, shutdown_rx) = create_shutdown_channel();
        let extractor = extractor(config(2), bus.clone(), store.clone(), shutdown_rx);

        let marker = StateMarker::new(DataType::Artists, identity());
        let outcome = extractor
            .process_source(marker, records(5), "discogs_20250101_artists.xml.gz")
            .await
            .unwrap();

        assert_eq!(outcome, FileOutcome::Completed { records: 5, malformed: 0 });

        let offsets: Vec<u64> = store
            .saved_markers(DataType::Artists)
            .await
            .iter()
            .map(|marker| marker.offset)
            .collect();
        assert_eq!(offsets, vec![2, 4, 5]);

        let marker = store.load(DataType::Artists).await.unwrap().unwrap();
        assert!(marker.completed);
        assert_eq!(marker.total_records, 5);

        let published = bus.published_messages();
        assert_eq!(published.len(), 6);
        let completion = published.last().unwrap();
        assert_eq!(completion.kind, MessageKind::FileComplete);
        assert_eq!(completion.total_processed, Some(5));
        assert!(extractor.progress().is_completed(DataType::Artists));
    }

    #[tokio::test]
    async fn test_malformed_records_are_skipped_and_counted() {
        let bus = MemoryBus::new(["graphinator"]);
        let store = MemoryStateMarkerStore::new();
        let (_shutdown_tx, shutdown_rx) = create_shutdown_channel();
        let extractor = extractor(config(100), bus.clone(), store.clone(), shutdown_rx);

        let source = MemoryRecordSource::new()
            .record(artist("a1", "h1"))
            .malformed("record has no id")
            .record(artist("a2", "h2"));
        let outcome = extractor
            .process_source(StateMarker::new(DataType::Artists, identity()), source, "f")
            .await
            .unwrap();

        assert_eq!(outcome, FileOutcome::Completed { records: 2, malformed: 1 });
        let marker = store.load(DataType::Artists).await.unwrap().unwrap();
        assert_eq!(marker.offset, 3);
        assert_eq!(marker.malformed_records, 1);
        assert_eq!(extractor.progress().snapshot()[0].malformed, 1);
    }

    #[tokio::test]
    async fn test_structural_error_keeps_last_checkpoint() {
        let bus = MemoryBus::new(["graphinator"]);
        let store = MemoryStateMarkerStore::new();
        let (_shutdown_tx, shutdown_rx) = create_shutdown_channel();
        let extractor = extractor(config(2), bus.clone(), store.clone(), shutdown_rx);

        let source = MemoryRecordSource::from_records(
            (1..=3).map(|i| artist(&format!("a{i}"), &format!("h{i}"))),
        )
        .corrupted(etl_error!(ErrorKind::ArchiveCorrupted, "Dump file is corrupted"));

        let err = extractor
            .process_source(StateMarker::new(DataType::Artists, identity()), source, "f")
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::ArchiveCorrupted);
        let marker = store.load(DataType::Artists).await.unwrap().unwrap();
        assert_eq!(marker.offset, 2);
        assert!(!marker.completed);
        assert!(
            !bus.published_messages()
                .iter()
                .any(BusMessage::is_file_complete)
        );
    }

    #[tokio::test]
    async fn test_transient_publish_failures_are_retried() {
        let bus = MemoryBus::new(["graphinator"]);
        let store = MemoryStateMarkerStore::new();
        let (_shutdown_tx, shutdown_rx) = create_shutdown_channel();
        let extractor = extractor(config(100), bus.clone(), store.clone(), shutdown_rx);

        bus.fail_next_publishes(2);
        let outcome = extractor
            .process_source(StateMarker::new(DataType::Artists, identity()), records(2), "f")
            .await
            .unwrap();

        assert_eq!(outcome, FileOutcome::Completed { records: 2, malformed: 0 });
        assert_eq!(bus.published_messages().len(), 3);
    }

    /// Rejects every publish of one record id.
    struct RejectingBus {
        inner: MemoryBus,
        rejected_id: &'static str,
    }

    impl MessageBus for RejectingBus {
        fn name(&self) -> &str {
            "rejecting-bus"
        }

        async fn declare_topology(&self, data_types: &[DataType]) -> EtlResult<()> {
            self.inner.declare_topology(data_types).await
        }

        async fn publish(&self, message: &BusMessage) -> EtlResult<()> {
            if let Some(record) = &message.payload {
                if record.id == self.rejected_id {
                    return Err(etl_error!(
                        ErrorKind::BusPublishFailed,
                        "Publish rejected by the bus"
                    ));
                }
            }
            self.inner.publish(message).await
        }

        async fn consume(
            &self,
            consumer_group: &str,
            data_type: DataType,
            prefetch: u16,
        ) -> EtlResult<crate::bus::BusConsumer> {
            self.inner.consume(consumer_group, data_type, prefetch).await
        }

        fn health(&self) -> crate::resilience::ConnectionHealth {
            self.inner.health()
        }
    }

    #[tokio::test]
    async fn test_exhausted_publish_does_not_advance_past_failed_record() {
        let memory_bus = MemoryBus::new(["graphinator"]);
        let bus = Arc::new(RejectingBus {
            inner: memory_bus.clone(),
            rejected_id: "a3",
        });
        let store = MemoryStateMarkerStore::new();
        let (_shutdown_tx, shutdown_rx) = create_shutdown_channel();
        let failing =
            Extractor::new(config(100), fast_retries(), bus, store.clone(), shutdown_rx).unwrap();

        let err = failing
            .process_source(StateMarker::new(DataType::Artists, identity()), records(4), "f")
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::RetriesExhausted);
        let marker = store.load(DataType::Artists).await.unwrap().unwrap();
        assert_eq!(marker.offset, 2);
        assert_eq!(marker.total_records, 2);
        assert!(!marker.completed);
        // Records after the failed one may already be on the bus, it never is.
        let published_before_restart = memory_bus.published_messages().len();
        assert!(
            !memory_bus
                .published_messages()
                .iter()
                .any(|message| message.payload.as_ref().is_some_and(|record| record.id == "a3"))
        );

        // A restart resumes with the failed record.
        let (_restart_tx, restart_rx) = create_shutdown_channel();
        let restarted = extractor(config(100), memory_bus.clone(), store.clone(), restart_rx);
        let outcome = restarted.process_source(marker, records(4), "f").await.unwrap();
        assert_eq!(outcome, FileOutcome::Completed { records: 4, malformed: 0 });
        let ids: Vec<String> = memory_bus.published_messages()[published_before_restart..]
            .iter()
            .filter_map(|message| message.payload.as_ref().map(|record| record.id.clone()))
            .collect();
        assert_eq!(ids, vec!["a3", "a4"]);
    }

    #[tokio::test]
    async fn test_resume_skips_checkpointed_records() {
        let bus = MemoryBus::new(["graphinator"]);
        let store = MemoryStateMarkerStore::new();
        let (_shutdown_tx, shutdown_rx) = create_shutdown_channel();
        let extractor = extractor(config(100), bus.clone(), store.clone(), shutdown_rx);

        let mut marker = StateMarker::new(DataType::Artists, identity());
        marker.advance(3, 3, 0).unwrap();
        let outcome = extractor
            .process_source(marker, records(5), "f")
            .await
            .unwrap();

        assert_eq!(outcome, FileOutcome::Completed { records: 5, malformed: 0 });
        let ids: Vec<String> = bus
            .published_messages()
            .into_iter()
            .filter_map(|message| message.payload.map(|record| record.id))
            .collect();
        assert_eq!(ids, vec!["a4", "a5"]);
    }

    #[tokio::test]
    async fn test_offset_beyond_archive_is_rejected() {
        let bus = MemoryBus::new(["graphinator"]);
        let store = MemoryStateMarkerStore::new();
        let (_shutdown_tx, shutdown_rx) = create_shutdown_channel();
        let extractor = extractor(config(100), bus.clone(), store, shutdown_rx);

        let mut marker = StateMarker::new(DataType::Artists, identity());
        marker.advance(10, 10, 0).unwrap();
        let err = extractor
            .process_source(marker, records(2), "f")
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::InvalidState);
        assert!(bus.published_messages().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_saves_marker() {
        let bus = MemoryBus::new(["graphinator"]);
        let store = MemoryStateMarkerStore::new();
        let (shutdown_tx, shutdown_rx) = create_shutdown_channel();
        let extractor = extractor(config(100), bus.clone(), store.clone(), shutdown_rx);

        shutdown_tx.shutdown();
        let outcome = extractor
            .process_source(StateMarker::new(DataType::Artists, identity()), records(3), "f")
            .await
            .unwrap();

        assert_eq!(outcome, FileOutcome::Interrupted { offset: 0 });
        let marker = store.load(DataType::Artists).await.unwrap().unwrap();
        assert!(!marker.completed);
    }

    #[tokio::test]
    async fn test_run_skips_completed_files_and_processes_new_ones() {
        let dir = tempfile::tempdir().unwrap();
        write_dump(
            dir.path(),
            "discogs_20250101_artists.xml.gz",
            &dump_xml(DataType::Artists, &[("1", "A"), ("2", "B")]),
        );
        write_dump(
            dir.path(),
            "discogs_20250101_labels.xml.gz",
            &dump_xml(DataType::Labels, &[("1", "L")]),
        );

        let mut config = config(100);
        config.data_dir = dir.path().to_path_buf();
        let bus = MemoryBus::new(["graphinator", "tableinator"]);
        let store = MemoryStateMarkerStore::new();
        let (_shutdown_tx, shutdown_rx) = create_shutdown_channel();
        let extractor = extractor(config, bus.clone(), store.clone(), shutdown_rx);

        let summaries = extractor.run().await.unwrap();
        assert_eq!(summaries.len(), 2);
        assert!(
            summaries
                .iter()
                .all(|summary| matches!(summary.outcome, FileOutcome::Completed { .. }))
        );
        assert_eq!(bus.ready_count("tableinator", DataType::Artists), 3);

        let summaries = extractor.run().await.unwrap();
        assert!(
            summaries
                .iter()
                .all(|summary| summary.outcome == FileOutcome::Skipped)
        );
        assert_eq!(bus.published_messages().len(), 5);
    }

    #[tokio::test]
    async fn test_default_retry_policy_is_bounded_by_publish_attempts() {
        let (_shutdown_tx, shutdown_rx) = create_shutdown_channel();
        let extractor = Extractor::new(
            config(100),
            RetryPolicy::from_config(&RetryConfig::default()),
            Arc::new(MemoryBus::new(["graphinator"])),
            MemoryStateMarkerStore::new(),
            shutdown_rx,
        )
        .unwrap();

        assert_eq!(extractor.retry_policy.max_attempts(), 3);
    }

    fn artists_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        write_dump(
            dir.path(),
            "discogs_20250101_artists.xml.gz",
            &dump_xml(DataType::Artists, &[("1", "A"), ("2", "B")]),
        );
        dir
    }

    fn artists_config(dir: &tempfile::TempDir) -> ExtractorConfig {
        let mut config = config(100);
        config.data_dir = dir.path().to_path_buf();
        config.data_types = vec!["artists".to_string()];
        config
    }

    #[tokio::test]
    async fn test_forced_reprocess_applies_to_first_pass_only() {
        let dir = artists_dir();
        let mut config = artists_config(&dir);
        config.force_reprocess = true;
        let bus = MemoryBus::new(["graphinator"]);
        let store = MemoryStateMarkerStore::new();
        let (_shutdown_tx, shutdown_rx) = create_shutdown_channel();
        let extractor = extractor(config, bus.clone(), store, shutdown_rx);

        let summaries = extractor.run().await.unwrap();
        assert_eq!(
            summaries[0].outcome,
            FileOutcome::Completed { records: 2, malformed: 0 }
        );

        for _ in 0..2 {
            let summaries = extractor.run().await.unwrap();
            assert_eq!(summaries[0].outcome, FileOutcome::Skipped);
        }
        assert_eq!(bus.published_messages().len(), 3);
    }

    /// Fails one topology declaration and requests shutdown on the one after it.
    struct FlakyTopologyBus {
        inner: MemoryBus,
        declarations: AtomicU32,
        failing_declaration: u32,
        shutdown_tx: ShutdownTx,
    }

    impl MessageBus for FlakyTopologyBus {
        fn name(&self) -> &str {
            "flaky-topology-bus"
        }

        async fn declare_topology(&self, data_types: &[DataType]) -> EtlResult<()> {
            let declaration = self.declarations.fetch_add(1, Ordering::SeqCst);
            if declaration == self.failing_declaration {
                return Err(etl_error!(
                    ErrorKind::BusConnectionFailed,
                    "Broker unreachable"
                ));
            }
            if declaration == self.failing_declaration + 1 {
                self.shutdown_tx.shutdown();
            }
            self.inner.declare_topology(data_types).await
        }

        async fn publish(&self, message: &BusMessage) -> EtlResult<()> {
            self.inner.publish(message).await
        }

        async fn consume(
            &self,
            consumer_group: &str,
            data_type: DataType,
            prefetch: u16,
        ) -> EtlResult<crate::bus::BusConsumer> {
            self.inner.consume(consumer_group, data_type, prefetch).await
        }

        fn health(&self) -> crate::resilience::ConnectionHealth {
            self.inner.health()
        }
    }

    fn flaky_extractor(
        dir: &tempfile::TempDir,
        memory_bus: &MemoryBus,
        failing_declaration: u32,
    ) -> (
        Arc<FlakyTopologyBus>,
        Extractor<FlakyTopologyBus, MemoryStateMarkerStore>,
    ) {
        let (shutdown_tx, shutdown_rx) = create_shutdown_channel();
        let bus = Arc::new(FlakyTopologyBus {
            inner: memory_bus.clone(),
            declarations: AtomicU32::new(0),
            failing_declaration,
            shutdown_tx,
        });
        let extractor = Extractor::new(
            artists_config(dir),
            fast_retries(),
            bus.clone(),
            MemoryStateMarkerStore::new(),
            shutdown_rx,
        )
        .unwrap();

        (bus, extractor)
    }

    #[tokio::test]
    async fn test_failed_rescan_pass_does_not_stop_periodic_runs() {
        let dir = artists_dir();
        let memory_bus = MemoryBus::new(["graphinator"]);
        let (bus, extractor) = flaky_extractor(&dir, &memory_bus, 1);

        extractor
            .run_periodically(Some(Duration::from_millis(10)))
            .await
            .unwrap();

        // First pass completed, second failed, third ran and saw the shutdown.
        assert_eq!(bus.declarations.load(Ordering::SeqCst), 3);
        assert_eq!(memory_bus.published_messages().len(), 3);
    }

    #[tokio::test]
    async fn test_failed_first_pass_is_returned() {
        let dir = artists_dir();
        let memory_bus = MemoryBus::new(["graphinator"]);
        let (bus, extractor) = flaky_extractor(&dir, &memory_bus, 0);

        let err = extractor
            .run_periodically(Some(Duration::from_millis(10)))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::BusConnectionFailed);
        assert_eq!(bus.declarations.load(Ordering::SeqCst), 1);
        assert!(memory_bus.published_messages().is_empty());
    }

    /// Holds every record publish until its id is released.
    struct GatedBus {
        inner: MemoryBus,
        gates: Mutex<HashMap<String, Arc<Semaphore>>>,
        started: AtomicUsize,
    }

    impl GatedBus {
        fn gate(&self, id: &str) -> Arc<Semaphore> {
            self.gates
                .lock()
                .unwrap()
                .entry(id.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(0)))
                .clone()
        }

        fn release(&self, id: &str) {
            self.gate(id).add_permits(1);
        }

        fn started(&self) -> usize {
            self.started.load(Ordering::SeqCst)
        }
    }

    impl MessageBus for GatedBus {
        fn name(&self) -> &str {
            "gated-bus"
        }

        async fn declare_topology(&self, data_types: &[DataType]) -> EtlResult<()> {
            self.inner.declare_topology(data_types).await
        }

        async fn publish(&self, message: &BusMessage) -> EtlResult<()> {
            if let Some(record) = &message.payload {
                self.started.fetch_add(1, Ordering::SeqCst);
                let gate = self.gate(&record.id);
                let _permit = gate.acquire().await.unwrap();
            }
            self.inner.publish(message).await
        }

        async fn consume(
            &self,
            consumer_group: &str,
            data_type: DataType,
            prefetch: u16,
        ) -> EtlResult<crate::bus::BusConsumer> {
            self.inner.consume(consumer_group, data_type, prefetch).await
        }

        fn health(&self) -> crate::resilience::ConnectionHealth {
            self.inner.health()
        }
    }

    async fn wait_until(condition: impl Fn() -> bool) {
        for _ in 0..1000 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_publishes_are_pipelined_and_checkpoint_the_confirmed_prefix() {
        let bus = Arc::new(GatedBus {
            inner: MemoryBus::new(["graphinator"]),
            gates: Mutex::new(HashMap::new()),
            started: AtomicUsize::new(0),
        });
        let store = MemoryStateMarkerStore::new();
        let (_shutdown_tx, shutdown_rx) = create_shutdown_channel();
        let mut config = config(1);
        config.max_in_flight_publishes = 3;
        let extractor = Arc::new(
            Extractor::new(config, fast_retries(), bus.clone(), store.clone(), shutdown_rx)
                .unwrap(),
        );

        let run = tokio::spawn({
            let extractor = extractor.clone();
            async move {
                extractor
                    .process_source(StateMarker::new(DataType::Artists, identity()), records(4), "f")
                    .await
            }
        });

        wait_until(|| bus.started() == 3).await;

        // Confirmations behind an unconfirmed record do not move the marker.
        bus.release("a2");
        bus.release("a3");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(store.saved_markers(DataType::Artists).await.is_empty());
        assert_eq!(bus.started(), 3);

        bus.release("a1");
        wait_until(|| bus.started() == 4).await;
        bus.release("a4");

        let outcome = run.await.unwrap().unwrap();
        assert_eq!(outcome, FileOutcome::Completed { records: 4, malformed: 0 });
        let offsets: Vec<u64> = store
            .saved_markers(DataType::Artists)
            .await
            .iter()
            .map(|marker| marker.offset)
            .collect();
        assert_eq!(offsets, vec![1, 2, 3, 4, 4]);
    }
}
