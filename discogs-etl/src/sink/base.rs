use std::collections::HashMap;
use std::future::Future;

use crate::error::EtlResult;
use crate::resilience::ConnectionHealth;
use crate::types::{DataType, ExtractedRecord};

/// Storage that loaded records are upserted into.
///
/// Graph and relational sinks expose the same contract: records are keyed by
/// `(data_type, id)`, a write replaces the stored hash and payload, and writing a record whose
/// hash is already stored changes nothing. This makes redelivered batches harmless.
pub trait Sink: Send + Sync + 'static {
    /// Returns the name of the sink.
    fn name() -> &'static str;

    /// Creates the tables, constraints or indexes the sink needs for `data_types`.
    ///
    /// Must be idempotent, it runs on every loader start.
    fn prepare(&self, data_types: &[DataType]) -> impl Future<Output = EtlResult<()>> + Send;

    /// Upserts `records` of `data_type` in one transaction.
    ///
    /// Either every record is written or none is. Returns the number of records whose stored
    /// hash changed.
    fn upsert_batch(
        &self,
        data_type: DataType,
        records: Vec<ExtractedRecord>,
    ) -> impl Future<Output = EtlResult<u64>> + Send;

    /// Size of the connection pool writes are spread over, for sinks that hold one.
    ///
    /// A loader never holds more unacknowledged deliveries than this.
    fn max_connections(&self) -> Option<u32> {
        None
    }

    /// Health of the sink connection, for sinks that hold one.
    fn health(&self) -> Option<ConnectionHealth> {
        None
    }

    /// Releases connections. The default implementation is a no-op.
    fn shutdown(&self) -> impl Future<Output = EtlResult<()>> + Send {
        async { Ok(()) }
    }
}

/// Collapses records sharing an id to the one that came last, keeping first occurrence order.
pub fn last_write_wins(records: Vec<ExtractedRecord>) -> Vec<ExtractedRecord> {
    let mut positions: HashMap<String, usize> = HashMap::with_capacity(records.len());
    let mut deduplicated: Vec<ExtractedRecord> = Vec::with_capacity(records.len());

    for record in records {
        match positions.get(&record.id) {
            Some(&position) => deduplicated[position] = record,
            None => {
                positions.insert(record.id.clone(), deduplicated.len());
                deduplicated.push(record);
            }
        }
    }

    deduplicated
}
