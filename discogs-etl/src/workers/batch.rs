use std::collections::HashMap;
use std::fmt;

use discogs_config::shared::BatchConfig;
use metrics::{counter, histogram};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::bus::Acknowledger;
use crate::error::{EtlError, EtlResult};
use crate::metrics::{
    DATA_TYPE_LABEL, DISCOGS_BATCH_FLUSH_DURATION_SECONDS, DISCOGS_BATCH_FLUSH_FAILURES_TOTAL,
    DISCOGS_BATCH_FLUSHES_TOTAL, DISCOGS_BATCH_SIZE, DISCOGS_POISON_MESSAGES_TOTAL,
    DISCOGS_RECORDS_LOADED_TOTAL, ERROR_KIND_LABEL, FLUSH_REASON_LABEL,
};
use crate::sink::{Sink, last_write_wins};
use crate::types::{DataType, ExtractedRecord};

/// Why a batch was flushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    Size,
    Interval,
    FileComplete,
    Shutdown,
    Cancel,
}

impl FlushReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlushReason::Size => "size",
            FlushReason::Interval => "interval",
            FlushReason::FileComplete => "file_complete",
            FlushReason::Shutdown => "shutdown",
            FlushReason::Cancel => "cancel",
        }
    }
}

impl fmt::Display for FlushReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a successful flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushSummary {
    /// Deliveries acknowledged.
    pub messages: usize,
    /// Records written after collapsing duplicate ids.
    pub records: usize,
    /// Records whose stored hash changed.
    pub changed: u64,
}

struct PendingRecord {
    record: ExtractedRecord,
    acker: Box<dyn Acknowledger>,
}

/// Accumulates the records of one data type and writes them to a sink in one transaction.
///
/// A batch is due when it holds `max_size` records or when `flush_interval` elapsed since its
/// first record was accepted. The processor only tracks due-ness; the owning worker decides
/// when to call [`BatchProcessor::flush`].
///
/// Deliveries are acknowledged after the sink committed and rejected with requeue when it
/// failed, so the bus keeps every record until it is stored.
pub struct BatchProcessor<K> {
    data_type: DataType,
    sink: K,
    max_size: usize,
    config: BatchConfig,
    poison_threshold: u32,
    pending: Vec<PendingRecord>,
    first_accepted_at: Option<Instant>,
    failed_attempts: HashMap<String, u32>,
}

impl<K> BatchProcessor<K>
where
    K: Sink,
{
    /// Creates a processor. The effective batch size is capped at `prefetch_count`, since the
    /// bus never hands out more unacknowledged deliveries than that.
    pub fn new(
        data_type: DataType,
        sink: K,
        config: BatchConfig,
        prefetch_count: u16,
        poison_threshold: u32,
    ) -> Self {
        let max_size = config.max_size.min(prefetch_count.max(1) as usize).max(1);
        if max_size < config.max_size {
            info!(
                %data_type,
                configured = config.max_size,
                effective = max_size,
                "batch size capped at prefetch count"
            );
        }

        Self {
            data_type,
            sink,
            max_size,
            config,
            poison_threshold,
            pending: Vec::with_capacity(max_size),
            first_accepted_at: None,
            failed_attempts: HashMap::new(),
        }
    }

    /// Adds a record to the pending batch. Returns `true` once the batch reached its size.
    pub fn accept(&mut self, record: ExtractedRecord, acker: Box<dyn Acknowledger>) -> bool {
        if self.pending.is_empty() {
            self.first_accepted_at = Some(Instant::now());
        }
        self.pending.push(PendingRecord { record, acker });

        self.is_full()
    }

    pub fn is_full(&self) -> bool {
        self.pending.len() >= self.max_size
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Instant at which the pending batch is due by age.
    pub fn deadline(&self) -> Option<Instant> {
        self.first_accepted_at
            .map(|accepted_at| accepted_at + self.config.flush_interval())
    }

    /// Writes the pending batch as one upsert and settles its deliveries.
    ///
    /// On failure every delivery of the batch is requeued and the error is returned.
    pub async fn flush(&mut self, reason: FlushReason) -> EtlResult<FlushSummary> {
        if self.pending.is_empty() {
            return Ok(FlushSummary {
                messages: 0,
                records: 0,
                changed: 0,
            });
        }

        let pending = std::mem::take(&mut self.pending);
        self.first_accepted_at = None;

        let messages = pending.len();
        let mut records = Vec::with_capacity(messages);
        let mut ackers = Vec::with_capacity(messages);
        for PendingRecord { record, acker } in pending {
            records.push(record);
            ackers.push(acker);
        }
        let records = last_write_wins(records);
        let written = records.len();
        let ids: Vec<String> = records.iter().map(|record| record.id.clone()).collect();

        let started = Instant::now();
        let result = self.sink.upsert_batch(self.data_type, records).await;
        histogram!(
            DISCOGS_BATCH_FLUSH_DURATION_SECONDS,
            DATA_TYPE_LABEL => self.data_type.as_str()
        )
        .record(started.elapsed().as_secs_f64());

        match result {
            Ok(changed) => {
                for acker in ackers {
                    // An unacknowledged delivery is redelivered and rewritten idempotently.
                    if let Err(err) = acker.ack().await {
                        warn!(data_type = %self.data_type, error = %err, "failed to acknowledge delivery");
                    }
                }
                for id in &ids {
                    self.failed_attempts.remove(id);
                }

                counter!(
                    DISCOGS_BATCH_FLUSHES_TOTAL,
                    DATA_TYPE_LABEL => self.data_type.as_str(),
                    FLUSH_REASON_LABEL => reason.as_str()
                )
                .increment(1);
                counter!(DISCOGS_RECORDS_LOADED_TOTAL, DATA_TYPE_LABEL => self.data_type.as_str())
                    .increment(written as u64);
                histogram!(DISCOGS_BATCH_SIZE, DATA_TYPE_LABEL => self.data_type.as_str())
                    .record(written as f64);

                debug!(
                    data_type = %self.data_type,
                    sink = K::name(),
                    %reason,
                    messages,
                    batch_size = written,
                    changed,
                    "flushed batch"
                );

                Ok(FlushSummary {
                    messages,
                    records: written,
                    changed,
                })
            }
            Err(err) => {
                self.requeue(ackers, &ids, &err).await;
                Err(err)
            }
        }
    }

    async fn requeue(&mut self, ackers: Vec<Box<dyn Acknowledger>>, ids: &[String], err: &EtlError) {
        counter!(
            DISCOGS_BATCH_FLUSH_FAILURES_TOTAL,
            DATA_TYPE_LABEL => self.data_type.as_str(),
            ERROR_KIND_LABEL => format!("{:?}", err.kind())
        )
        .increment(1);
        error!(
            data_type = %self.data_type,
            sink = K::name(),
            messages = ackers.len(),
            error = %err,
            "batch flush failed, requeueing messages"
        );

        for acker in ackers {
            if let Err(err) = acker.nack(true).await {
                warn!(data_type = %self.data_type, error = %err, "failed to requeue delivery");
            }
        }

        for id in ids {
            let attempts = self.failed_attempts.entry(id.clone()).or_insert(0);
            *attempts += 1;
            if *attempts >= self.poison_threshold {
                if *attempts == self.poison_threshold {
                    counter!(DISCOGS_POISON_MESSAGES_TOTAL, DATA_TYPE_LABEL => self.data_type.as_str())
                        .increment(1);
                }
                warn!(
                    data_type = %self.data_type,
                    id = %id,
                    attempts = *attempts,
                    "record keeps failing to load, possible poison message"
                );
            }
        }
    }

    /// Failed flush attempts of a record since it was last stored.
    pub fn failed_attempts(&self, id: &str) -> u32 {
        self.failed_attempts.get(id).copied().unwrap_or(0)
    }

    /// Drops the failure counts of records that will not be redelivered to this processor.
    pub fn clear_failures(&mut self) {
        self.failed_attempts.clear();
    }

    /// Ids that reached the poison threshold.
    pub fn poison_suspects(&self) -> Vec<String> {
        let mut suspects: Vec<String> = self
            .failed_attempts
            .iter()
            .filter(|(_, attempts)| **attempts >= self.poison_threshold)
            .map(|(id, _)| id.clone())
            .collect();
        suspects.sort();

        suspects
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::error::ErrorKind;
    use crate::sink::memory::MemorySink;
    use crate::test_utils::ack::{AckLog, AckOutcome};
    use crate::test_utils::record::artist;
    use crate::test_utils::test_sink_wrapper::TestSinkWrapper;

    fn processor(
        sink: TestSinkWrapper<MemorySink>,
        max_size: usize,
        prefetch_count: u16,
    ) -> BatchProcessor<TestSinkWrapper<MemorySink>> {
        let config = BatchConfig {
            max_size,
            flush_interval_ms: 5000,
        };
        BatchProcessor::new(DataType::Artists, sink, config, prefetch_count, 2)
    }

    #[tokio::test]
    async fn test_full_batch_is_reported_at_max_size() {
        let sink = TestSinkWrapper::wrap(MemorySink::new());
        let mut batch = processor(sink, 3, 10);
        let log = AckLog::new();

        assert!(!batch.accept(artist("a1", "h1"), log.acker(1)));
        assert!(!batch.accept(artist("a2", "h2"), log.acker(2)));
        assert!(batch.accept(artist("a3", "h3"), log.acker(3)));
        assert_eq!(batch.len(), 3);
    }

    #[tokio::test]
    async fn test_batch_size_is_capped_by_prefetch() {
        let sink = TestSinkWrapper::wrap(MemorySink::new());
        let batch = processor(sink, 100, 20);

        assert_eq!(batch.max_size(), 20);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_follows_first_accepted_record() {
        let sink = TestSinkWrapper::wrap(MemorySink::new());
        let mut batch = processor(sink, 100, 100);
        let log = AckLog::new();
        assert_eq!(batch.deadline(), None);

        let first = Instant::now();
        batch.accept(artist("a1", "h1"), log.acker(1));
        tokio::time::advance(Duration::from_secs(2)).await;
        batch.accept(artist("a2", "h2"), log.acker(2));

        assert_eq!(batch.deadline(), Some(first + Duration::from_secs(5)));

        batch.flush(FlushReason::Interval).await.unwrap();
        assert_eq!(batch.deadline(), None);
    }

    #[tokio::test]
    async fn test_flush_collapses_duplicates_and_acks_every_delivery() {
        let memory = MemorySink::new();
        let sink = TestSinkWrapper::wrap(memory.clone());
        let mut batch = processor(sink.clone(), 100, 100);
        let log = AckLog::new();

        batch.accept(artist("a1", "h1"), log.acker(1));
        batch.accept(artist("a2", "h2"), log.acker(2));
        batch.accept(artist("a1", "h3"), log.acker(3));

        let summary = batch.flush(FlushReason::Size).await.unwrap();

        assert_eq!(summary.messages, 3);
        assert_eq!(summary.records, 2);
        assert_eq!(log.count(AckOutcome::Ack), 3);
        assert!(batch.is_empty());
        assert_eq!(sink.committed_batches().await.len(), 1);
        assert_eq!(memory.record(DataType::Artists, "a1").await.unwrap().hash, "h3");
    }

    #[tokio::test]
    async fn test_failed_flush_requeues_whole_batch() {
        let memory = MemorySink::new();
        let sink = TestSinkWrapper::wrap(memory.clone());
        let mut batch = processor(sink.clone(), 100, 100);
        let log = AckLog::new();

        sink.fail_next_upserts(1, ErrorKind::SinkConnectionFailed).await;
        batch.accept(artist("a1", "h1"), log.acker(1));
        batch.accept(artist("a2", "h2"), log.acker(2));

        let err = batch.flush(FlushReason::Size).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::SinkConnectionFailed);
        assert_eq!(log.count(AckOutcome::Nack { requeue: true }), 2);
        assert_eq!(log.count(AckOutcome::Ack), 0);
        assert!(batch.is_empty());
        assert!(memory.records(DataType::Artists).await.is_empty());
        assert_eq!(batch.failed_attempts("a1"), 1);
    }

    #[tokio::test]
    async fn test_repeated_failures_flag_poison_suspects_until_stored() {
        let sink = TestSinkWrapper::wrap(MemorySink::new());
        let mut batch = processor(sink.clone(), 100, 100);
        let log = AckLog::new();

        sink.fail_next_upserts(2, ErrorKind::SinkQueryFailed).await;
        for tag in 0..2 {
            batch.accept(artist("bad", "h1"), log.acker(tag));
            assert!(batch.flush(FlushReason::Interval).await.is_err());
        }
        assert_eq!(batch.poison_suspects(), vec!["bad".to_string()]);

        batch.accept(artist("bad", "h1"), log.acker(2));
        batch.flush(FlushReason::Interval).await.unwrap();
        assert!(batch.poison_suspects().is_empty());
        assert_eq!(batch.failed_attempts("bad"), 0);
    }

    #[tokio::test]
    async fn test_empty_flush_does_not_reach_sink() {
        let sink = TestSinkWrapper::wrap(MemorySink::new());
        let mut batch = processor(sink.clone(), 100, 100);

        let summary = batch.flush(FlushReason::Shutdown).await.unwrap();
        assert_eq!(summary.messages, 0);
        assert_eq!(sink.upsert_calls().await, 0);
    }

    #[tokio::test]
    async fn test_clear_failures_drops_suspects_of_unreturned_records() {
        let sink = TestSinkWrapper::wrap(MemorySink::new());
        let mut batch = processor(sink.clone(), 100, 100);
        let log = AckLog::new();

        sink.fail_next_upserts(2, ErrorKind::SinkQueryFailed).await;
        for tag in 0..2 {
            batch.accept(artist("gone", "h1"), log.acker(tag));
            assert!(batch.flush(FlushReason::Cancel).await.is_err());
        }
        assert_eq!(batch.poison_suspects(), vec!["gone".to_string()]);

        batch.clear_failures();
        assert!(batch.poison_suspects().is_empty());
        assert_eq!(batch.failed_attempts("gone"), 0);
    }
}
