use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, EtlError, EtlResult};
use crate::{bail, etl_error};
use crate::types::DataType;

/// Identity of a dump file. A marker only applies to the file it was written for.
///
/// Persisted as the string `{file_name}:{size_bytes}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct SourceIdentity {
    pub file_name: String,
    pub size_bytes: u64,
}

impl SourceIdentity {
    pub fn new(file_name: impl Into<String>, size_bytes: u64) -> Self {
        Self {
            file_name: file_name.into(),
            size_bytes,
        }
    }
}

impl From<SourceIdentity> for String {
    fn from(value: SourceIdentity) -> Self {
        format!("{}:{}", value.file_name, value.size_bytes)
    }
}

impl TryFrom<String> for SourceIdentity {
    type Error = EtlError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let Some((file_name, size_bytes)) = value.rsplit_once(':') else {
            bail!(
                ErrorKind::StateMarkerCorrupted,
                "Source identity has no size",
                value
            );
        };
        let size_bytes = size_bytes.parse::<u64>().map_err(|err| {
            etl_error!(
                ErrorKind::StateMarkerCorrupted,
                "Source identity has an invalid size",
                value.clone(),
                source: err
            )
        })?;

        Ok(SourceIdentity::new(file_name, size_bytes))
    }
}

impl fmt::Display for SourceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} bytes)", self.file_name, self.size_bytes)
    }
}

/// What to do with a dump file given its stored marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingDecision {
    /// The file was fully processed already.
    Skip,
    /// Resume the file after the first `offset` archive records.
    Continue { offset: u64 },
    /// Process the file from the start.
    Reprocess,
}

/// Progress of one data type through one dump file.
///
/// `offset` counts archive records consumed, published and malformed alike, and never
/// decreases within a run. `total_records` counts records published to the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateMarker {
    pub data_type: DataType,
    pub offset: u64,
    pub total_records: u64,
    #[serde(default)]
    pub malformed_records: u64,
    pub completed: bool,
    pub last_checkpoint: DateTime<Utc>,
    pub source_identity: SourceIdentity,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl StateMarker {
    /// Creates the marker of a run starting at the beginning of `source_identity`.
    pub fn new(data_type: DataType, source_identity: SourceIdentity) -> Self {
        let now = Utc::now();
        Self {
            data_type,
            offset: 0,
            total_records: 0,
            malformed_records: 0,
            completed: false,
            last_checkpoint: now,
            source_identity,
            started_at: Some(now),
            completed_at: None,
        }
    }

    /// Records progress of the current run.
    ///
    /// Fails without modifying the marker if `offset` moves backwards or the marker is
    /// already completed.
    pub fn advance(&mut self, offset: u64, total_records: u64, malformed_records: u64) -> EtlResult<()> {
        if self.completed {
            bail!(
                ErrorKind::InvalidState,
                "State marker is already completed",
                format!("{} at offset {}", self.data_type, self.offset)
            );
        }

        if offset < self.offset {
            bail!(
                ErrorKind::InvalidState,
                "State marker offset cannot move backwards",
                format!("{}: {} -> {}", self.data_type, self.offset, offset)
            );
        }

        self.offset = offset;
        self.total_records = total_records;
        self.malformed_records = malformed_records;
        self.last_checkpoint = Utc::now();

        Ok(())
    }

    pub fn complete(&mut self) {
        let now = Utc::now();
        self.completed = true;
        self.last_checkpoint = now;
        self.completed_at = Some(now);
    }

    /// Decides how to process `source_identity` given the stored marker, if any.
    pub fn decide(
        marker: Option<&StateMarker>,
        source_identity: &SourceIdentity,
        force_reprocess: bool,
    ) -> ProcessingDecision {
        if force_reprocess {
            return ProcessingDecision::Reprocess;
        }

        match marker {
            Some(marker) if marker.source_identity != *source_identity => {
                ProcessingDecision::Reprocess
            }
            Some(marker) if marker.completed => ProcessingDecision::Skip,
            Some(marker) => ProcessingDecision::Continue {
                offset: marker.offset,
            },
            None => ProcessingDecision::Reprocess,
        }
    }
}
