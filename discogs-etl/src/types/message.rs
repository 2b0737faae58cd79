use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::bail;
use crate::error::{ErrorKind, EtlResult};
use crate::types::{DataType, ExtractedRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Record,
    /// Terminates the stream of a data type for one dump file.
    FileComplete,
}

/// Envelope published on the bus.
///
/// Serialized as `{type, data_type, payload, timestamp, total_processed, file}`. Record
/// messages carry the record as `payload`, completion messages carry `total_processed` and
/// `file`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusMessage {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub data_type: DataType,
    #[serde(default)]
    pub payload: Option<ExtractedRecord>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub total_processed: Option<u64>,
    #[serde(default)]
    pub file: Option<String>,
}

impl BusMessage {
    pub fn record(record: ExtractedRecord) -> Self {
        Self {
            kind: MessageKind::Record,
            data_type: record.data_type,
            payload: Some(record),
            timestamp: Utc::now(),
            total_processed: None,
            file: None,
        }
    }

    pub fn file_complete(data_type: DataType, total_processed: u64, file: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::FileComplete,
            data_type,
            payload: None,
            timestamp: Utc::now(),
            total_processed: Some(total_processed),
            file: Some(file.into()),
        }
    }

    pub fn is_file_complete(&self) -> bool {
        self.kind == MessageKind::FileComplete
    }

    /// Takes the record out of a record message.
    pub fn into_record(self) -> EtlResult<ExtractedRecord> {
        match (self.kind, self.payload) {
            (MessageKind::Record, Some(record)) => Ok(record),
            (MessageKind::Record, None) => {
                bail!(ErrorKind::InvalidData, "Record message without payload")
            }
            (MessageKind::FileComplete, _) => bail!(
                ErrorKind::InvalidState,
                "Completion message does not carry a record"
            ),
        }
    }

    pub fn to_bytes(&self) -> EtlResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> EtlResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
