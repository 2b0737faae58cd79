use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use crate::error::EtlResult;
use crate::sink::{Sink, last_write_wins};
use crate::types::{DataType, ExtractedRecord};

#[derive(Debug, Default)]
struct Inner {
    records: BTreeMap<(DataType, String), ExtractedRecord>,
    prepared: Vec<DataType>,
    batches: u64,
    writes: u64,
}

/// In-memory sink for tests and local runs.
///
/// Stored state is keyed by `(data_type, id)` exactly like the database sinks.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    inner: Arc<Mutex<Inner>>,
    max_connections: Option<u32>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the sink report a connection pool of `max_connections`.
    pub fn with_max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = Some(max_connections);
        self
    }

    /// Stored records of `data_type`, ordered by id.
    pub async fn records(&self, data_type: DataType) -> Vec<ExtractedRecord> {
        let inner = self.inner.lock().await;
        inner
            .records
            .iter()
            .filter(|((stored_type, _), _)| *stored_type == data_type)
            .map(|(_, record)| record.clone())
            .collect()
    }

    pub async fn record(&self, data_type: DataType, id: &str) -> Option<ExtractedRecord> {
        let inner = self.inner.lock().await;
        inner.records.get(&(data_type, id.to_string())).cloned()
    }

    /// Number of committed batches.
    pub async fn batch_count(&self) -> u64 {
        self.inner.lock().await.batches
    }

    /// Number of writes that changed a stored hash.
    pub async fn write_count(&self) -> u64 {
        self.inner.lock().await.writes
    }

    pub async fn prepared_data_types(&self) -> Vec<DataType> {
        self.inner.lock().await.prepared.clone()
    }
}

impl Sink for MemorySink {
    fn name() -> &'static str {
        "memory"
    }

    async fn prepare(&self, data_types: &[DataType]) -> EtlResult<()> {
        let mut inner = self.inner.lock().await;
        for data_type in data_types {
            if !inner.prepared.contains(data_type) {
                inner.prepared.push(*data_type);
            }
        }

        Ok(())
    }

    fn max_connections(&self) -> Option<u32> {
        self.max_connections
    }

    async fn upsert_batch(&self, data_type: DataType, records: Vec<ExtractedRecord>) -> EtlResult<u64> {
        let mut inner = self.inner.lock().await;

        let mut changed = 0;
        for record in last_write_wins(records) {
            let key = (data_type, record.id.clone());
            let unchanged = inner
                .records
                .get(&key)
                .is_some_and(|stored| stored.hash == record.hash);
            if !unchanged {
                inner.records.insert(key, record);
                changed += 1;
            }
        }
        inner.batches += 1;
        inner.writes += changed;

        debug!(%data_type, changed, "memory sink committed batch");

        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ArtistRecord;

    fn record(id: &str, hash: &str) -> ExtractedRecord {
        ExtractedRecord::new(ArtistRecord::new(id, "name"))
            .unwrap()
            .with_hash(hash)
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent() {
        let sink = MemorySink::new();
        let batch = vec![record("a1", "h1"), record("a2", "h2")];

        assert_eq!(sink.upsert_batch(DataType::Artists, batch.clone()).await.unwrap(), 2);
        let before = sink.records(DataType::Artists).await;
        assert_eq!(sink.upsert_batch(DataType::Artists, batch).await.unwrap(), 0);

        assert_eq!(sink.records(DataType::Artists).await, before);
        assert_eq!(sink.write_count().await, 2);
    }

    #[tokio::test]
    async fn test_new_hash_replaces_stored_record() {
        let sink = MemorySink::new();
        sink.upsert_batch(DataType::Artists, vec![record("a1", "h1")]).await.unwrap();
        sink.upsert_batch(DataType::Artists, vec![record("a1", "h2")]).await.unwrap();

        let stored = sink.record(DataType::Artists, "a1").await.unwrap();
        assert_eq!(stored.hash, "h2");
        assert_eq!(sink.records(DataType::Artists).await.len(), 1);
    }
}
