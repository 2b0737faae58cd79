use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};

use crate::error::{ErrorKind, EtlResult};
use crate::etl_error;
use crate::resilience::ConnectionHealth;
use crate::sink::Sink;
use crate::test_utils::notify::TimedNotify;
use crate::types::{DataType, ExtractedRecord};

type BatchCondition = Box<dyn Fn(&[(DataType, Vec<ExtractedRecord>)]) -> bool + Send + Sync>;

struct Inner<K> {
    wrapped_sink: K,
    committed_batches: Vec<(DataType, Vec<ExtractedRecord>)>,
    upsert_calls: u64,
    failures: VecDeque<ErrorKind>,
    conditions: Vec<(BatchCondition, Arc<Notify>)>,
    shutdown_called: bool,
}

impl<K> Inner<K> {
    fn check_conditions(&mut self) {
        let batches = &self.committed_batches;
        self.conditions.retain(|(condition, notify)| {
            let satisfied = condition(batches);
            if satisfied {
                notify.notify_one();
            }
            !satisfied
        });
    }
}

/// Wraps a [`Sink`], records committed batches and injects failures.
#[derive(Clone)]
pub struct TestSinkWrapper<K> {
    inner: Arc<Mutex<Inner<K>>>,
}

impl<K> TestSinkWrapper<K> {
    pub fn wrap(sink: K) -> Self {
        let inner = Inner {
            wrapped_sink: sink,
            committed_batches: Vec::new(),
            upsert_calls: 0,
            failures: VecDeque::new(),
            conditions: Vec::new(),
            shutdown_called: false,
        };

        Self {
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    /// Makes the next `count` upserts fail with `kind` without reaching the wrapped sink.
    pub async fn fail_next_upserts(&self, count: usize, kind: ErrorKind) {
        let mut inner = self.inner.lock().await;
        inner.failures.extend(std::iter::repeat_n(kind, count));
    }

    /// Batches the wrapped sink committed, in commit order.
    pub async fn committed_batches(&self) -> Vec<(DataType, Vec<ExtractedRecord>)> {
        self.inner.lock().await.committed_batches.clone()
    }

    /// Upsert calls including failed ones.
    pub async fn upsert_calls(&self) -> u64 {
        self.inner.lock().await.upsert_calls
    }

    pub async fn shutdown_called(&self) -> bool {
        self.inner.lock().await.shutdown_called
    }

    /// Notifies once the committed batches satisfy `condition`.
    pub async fn notify_on_batches<F>(&self, condition: F) -> TimedNotify
    where
        F: Fn(&[(DataType, Vec<ExtractedRecord>)]) -> bool + Send + Sync + 'static,
    {
        let notify = Arc::new(Notify::new());
        let mut inner = self.inner.lock().await;
        inner.conditions.push((Box::new(condition), notify.clone()));
        inner.check_conditions();

        TimedNotify::new(notify)
    }

    /// Notifies once `count` records of `data_type` were committed, duplicates included.
    pub async fn wait_for_records(&self, data_type: DataType, count: usize) -> TimedNotify {
        self.notify_on_batches(move |batches| {
            let committed: usize = batches
                .iter()
                .filter(|(batch_type, _)| *batch_type == data_type)
                .map(|(_, records)| records.len())
                .sum();
            committed >= count
        })
        .await
    }
}

impl<K> Sink for TestSinkWrapper<K>
where
    K: Sink + Clone,
{
    fn name() -> &'static str {
        K::name()
    }

    async fn prepare(&self, data_types: &[DataType]) -> EtlResult<()> {
        let sink = self.inner.lock().await.wrapped_sink.clone();
        sink.prepare(data_types).await
    }

    async fn upsert_batch(&self, data_type: DataType, records: Vec<ExtractedRecord>) -> EtlResult<u64> {
        let sink = {
            let mut inner = self.inner.lock().await;
            inner.upsert_calls += 1;
            if let Some(kind) = inner.failures.pop_front() {
                return Err(etl_error!(kind, "Injected sink failure"));
            }
            inner.wrapped_sink.clone()
        };

        let changed = sink.upsert_batch(data_type, records.clone()).await?;

        let mut inner = self.inner.lock().await;
        inner.committed_batches.push((data_type, records));
        inner.check_conditions();

        Ok(changed)
    }

    fn max_connections(&self) -> Option<u32> {
        self.inner
            .try_lock()
            .ok()
            .and_then(|inner| inner.wrapped_sink.max_connections())
    }

    fn health(&self) -> Option<ConnectionHealth> {
        None
    }

    async fn shutdown(&self) -> EtlResult<()> {
        let sink = {
            let mut inner = self.inner.lock().await;
            inner.shutdown_called = true;
            inner.wrapped_sink.clone()
        };

        sink.shutdown().await
    }
}
