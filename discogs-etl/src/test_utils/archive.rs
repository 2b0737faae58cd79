use std::collections::VecDeque;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use flate2::Compression;
use flate2::write::GzEncoder;

use crate::error::{EtlError, EtlResult};
use crate::extractor::{DecodeOutcome, RecordSource};
use crate::types::{DataType, ExtractedRecord};

/// Gzip compresses `xml`.
pub fn gzip(xml: &str) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
    encoder.write_all(xml.as_bytes()).unwrap();
    encoder.finish().unwrap()
}

/// Writes a gzip compressed dump named `file_name` into `dir`.
pub fn write_dump(dir: &Path, file_name: &str, xml: &str) -> PathBuf {
    let path = dir.join(file_name);
    fs::write(&path, gzip(xml)).unwrap();
    path
}

/// Dump document of `data_type` with one `<id>`/`<name>` record per entry.
///
/// Masters and releases get a `<title>` instead of a `<name>`.
pub fn dump_xml(data_type: DataType, records: &[(&str, &str)]) -> String {
    let element = data_type.record_element();
    let name_tag = match data_type {
        DataType::Artists | DataType::Labels => "name",
        DataType::Masters | DataType::Releases => "title",
    };

    let mut xml = format!("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<{data_type}>\n");
    for (id, name) in records {
        xml.push_str(&format!(
            "  <{element}><id>{id}</id><{name_tag}>{name}</{name_tag}></{element}>\n"
        ));
    }
    xml.push_str(&format!("</{data_type}>\n"));

    xml
}

/// In-memory [`RecordSource`] replaying a scripted sequence of outcomes.
///
/// An `Err` entry stops the source like structural corruption does.
#[derive(Debug, Default)]
pub struct MemoryRecordSource {
    outcomes: VecDeque<EtlResult<DecodeOutcome>>,
}

impl MemoryRecordSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(records: impl IntoIterator<Item = ExtractedRecord>) -> Self {
        let mut source = Self::new();
        for record in records {
            source = source.record(record);
        }
        source
    }

    pub fn record(mut self, record: ExtractedRecord) -> Self {
        self.outcomes.push_back(Ok(DecodeOutcome::Record(record)));
        self
    }

    pub fn malformed(mut self, reason: &str) -> Self {
        let position = self.outcomes.len() as u64 + 1;
        self.outcomes.push_back(Ok(DecodeOutcome::Malformed {
            position,
            reason: reason.to_string(),
        }));
        self
    }

    pub fn corrupted(mut self, err: EtlError) -> Self {
        self.outcomes.push_back(Err(err));
        self
    }
}

impl RecordSource for MemoryRecordSource {
    fn next_outcome(&mut self) -> EtlResult<Option<DecodeOutcome>> {
        self.outcomes.pop_front().transpose()
    }
}
