use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use flate2::read::GzDecoder;
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use serde_json::{Map, Value};

use crate::error::{ErrorKind, EtlError, EtlResult};
use crate::etl_error;
use crate::extractor::convert::convert_record;
use crate::types::{DataType, ExtractedRecord};

/// One archive record, decoded or not.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodeOutcome {
    Record(ExtractedRecord),
    /// The record could not be decoded. Processing continues with the next record.
    Malformed { position: u64, reason: String },
}

/// Lazy sequence of the records of one archive.
///
/// Implementations are blocking and run on a dedicated thread. An `Err` is structural
/// corruption: the rest of the archive cannot be trusted and the caller stops reading.
pub trait RecordSource: Send + 'static {
    /// Decodes the next record, or returns `None` at the end of the archive.
    fn next_outcome(&mut self) -> EtlResult<Option<DecodeOutcome>>;

    /// Skips up to `count` records without decoding them. Returns how many were skipped.
    fn skip(&mut self, count: u64) -> EtlResult<u64> {
        let mut skipped = 0;
        while skipped < count {
            if self.next_outcome()?.is_none() {
                break;
            }
            skipped += 1;
        }

        Ok(skipped)
    }
}

/// Raw XML element of one record.
#[derive(Debug, Default)]
struct Element {
    name: String,
    attributes: Vec<(String, String)>,
    text: String,
    children: Vec<Element>,
}

impl Element {
    fn open(start: &BytesStart<'_>) -> Result<Self, quick_xml::Error> {
        let mut attributes = Vec::new();
        for attribute in start.attributes() {
            let attribute = attribute?;
            let key = String::from_utf8_lossy(attribute.key.as_ref()).into_owned();
            let value = attribute.unescape_value()?.into_owned();
            attributes.push((key, value));
        }

        Ok(Self {
            name: String::from_utf8_lossy(start.name().as_ref()).into_owned(),
            attributes,
            ..Default::default()
        })
    }

    /// Converts the element to JSON.
    ///
    /// Attributes become `@name` keys and text becomes `#text`, or the bare string for
    /// text-only elements. Repeated children are collected into arrays.
    fn into_json(self) -> Value {
        if self.attributes.is_empty() && self.children.is_empty() {
            return Value::String(self.text);
        }

        let mut object = Map::new();
        for (key, value) in self.attributes {
            object.insert(format!("@{key}"), Value::String(value));
        }
        if !self.text.is_empty() {
            object.insert("#text".to_string(), Value::String(self.text));
        }
        for child in self.children {
            let name = child.name.clone();
            let value = child.into_json();
            match object.get_mut(&name) {
                Some(Value::Array(values)) => values.push(value),
                Some(existing) => {
                    let first = existing.take();
                    *existing = Value::Array(vec![first, value]);
                }
                None => {
                    object.insert(name, value);
                }
            }
        }

        Value::Object(object)
    }
}

/// Streaming reader of a Discogs XML dump.
///
/// Every child element of the document root is one record. Memory use is bounded by the
/// largest single record.
pub struct XmlDumpReader<R> {
    reader: Reader<R>,
    data_type: DataType,
    source_name: String,
    buf: Vec<u8>,
    in_root: bool,
    finished: bool,
    position: u64,
}

impl XmlDumpReader<BufReader<GzDecoder<BufReader<File>>>> {
    /// Opens a gzip compressed dump file.
    pub fn open(path: &Path, data_type: DataType) -> EtlResult<Self> {
        let file = File::open(path).map_err(|err| {
            let kind = match err.kind() {
                std::io::ErrorKind::NotFound => ErrorKind::ArchiveNotFound,
                _ => ErrorKind::IoError,
            };
            etl_error!(kind, "Failed to open dump file", path.display(), source: err)
        })?;
        let decoder = GzDecoder::new(BufReader::new(file));

        Ok(Self::new(
            BufReader::new(decoder),
            data_type,
            path.display().to_string(),
        ))
    }
}

impl<R: BufRead> XmlDumpReader<R> {
    pub fn new(reader: R, data_type: DataType, source_name: impl Into<String>) -> Self {
        let mut reader = Reader::from_reader(reader);
        reader.config_mut().trim_text(true);

        Self {
            reader,
            data_type,
            source_name: source_name.into(),
            buf: Vec::new(),
            in_root: false,
            finished: false,
            position: 0,
        }
    }

    /// Records read so far, decoded or malformed.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Reads the next complete record element.
    fn next_element(&mut self) -> EtlResult<Option<Element>> {
        if self.finished {
            return Ok(None);
        }

        let mut stack: Vec<Element> = Vec::new();
        loop {
            self.buf.clear();
            let event = match self.reader.read_event_into(&mut self.buf) {
                Ok(event) => event,
                Err(err) => return Err(corrupted(&self.source_name, err)),
            };

            match event {
                Event::Start(start) => {
                    if !self.in_root {
                        self.in_root = true;
                        continue;
                    }
                    let element =
                        Element::open(&start).map_err(|err| corrupted(&self.source_name, err))?;
                    stack.push(element);
                }
                Event::Empty(start) => {
                    if !self.in_root {
                        self.finished = true;
                        return Ok(None);
                    }
                    let element =
                        Element::open(&start).map_err(|err| corrupted(&self.source_name, err))?;
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(element),
                        None => {
                            self.position += 1;
                            return Ok(Some(element));
                        }
                    }
                }
                Event::End(_) => match stack.pop() {
                    Some(element) => match stack.last_mut() {
                        Some(parent) => parent.children.push(element),
                        None => {
                            self.position += 1;
                            return Ok(Some(element));
                        }
                    },
                    None => {
                        self.in_root = false;
                        self.finished = true;
                        return Ok(None);
                    }
                },
                Event::Text(text) => {
                    if let Some(current) = stack.last_mut() {
                        let text = text
                            .unescape()
                            .map_err(|err| corrupted(&self.source_name, err))?;
                        current.text.push_str(&text);
                    }
                }
                Event::CData(data) => {
                    if let Some(current) = stack.last_mut() {
                        current.text.push_str(&String::from_utf8_lossy(&data));
                    }
                }
                Event::Eof => {
                    if self.in_root || !stack.is_empty() {
                        return Err(etl_error!(
                            ErrorKind::ArchiveCorrupted,
                            "Dump file ended inside the document",
                            format!("{} after {} records", self.source_name, self.position)
                        ));
                    }
                    self.finished = true;
                    return Ok(None);
                }
                _ => {}
            }
        }
    }

    fn decode(&self, element: Element, position: u64) -> DecodeOutcome {
        let expected = self.data_type.record_element();
        if element.name != expected {
            return DecodeOutcome::Malformed {
                position,
                reason: format!("expected <{expected}>, found <{}>", element.name),
            };
        }

        let Value::Object(attributes) = element.into_json() else {
            return DecodeOutcome::Malformed {
                position,
                reason: "record has neither attributes nor children".to_string(),
            };
        };

        let record = convert_record(self.data_type, attributes)
            .and_then(|payload| ExtractedRecord::new(payload).map_err(|err| err.to_string()));
        match record {
            Ok(record) => DecodeOutcome::Record(record),
            Err(reason) => DecodeOutcome::Malformed { position, reason },
        }
    }
}

impl<R> RecordSource for XmlDumpReader<R>
where
    R: BufRead + Send + 'static,
{
    fn next_outcome(&mut self) -> EtlResult<Option<DecodeOutcome>> {
        let Some(element) = self.next_element()? else {
            return Ok(None);
        };

        Ok(Some(self.decode(element, self.position)))
    }

    fn skip(&mut self, count: u64) -> EtlResult<u64> {
        let mut skipped = 0;
        while skipped < count && self.next_element()?.is_some() {
            skipped += 1;
        }

        Ok(skipped)
    }
}

fn corrupted(source_name: &str, err: quick_xml::Error) -> EtlError {
    etl_error!(
        ErrorKind::ArchiveCorrupted,
        "Dump file is corrupted",
        source_name,
        source: err
    )
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::test_utils::archive::{gzip, write_dump};

    fn reader(xml: &str, data_type: DataType) -> XmlDumpReader<Cursor<Vec<u8>>> {
        XmlDumpReader::new(Cursor::new(xml.as_bytes().to_vec()), data_type, "test.xml")
    }

    fn collect(mut source: impl RecordSource) -> EtlResult<Vec<DecodeOutcome>> {
        let mut outcomes = Vec::new();
        while let Some(outcome) = source.next_outcome()? {
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    #[test]
    fn test_decodes_artists_and_skips_malformed() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
            <artists>
              <artist><id>1</id><name>The Persuader</name><realname>Jesper Dahlb&#228;ck</realname>
                <namevariations><name>Persuader</name><name>The Presuader</name></namevariations>
                <aliases><name id="239">Dick Track</name></aliases>
              </artist>
              <artist><name>No identifier</name></artist>
              <artist><id>2</id><name>Mr. James Barth &amp; A.D.</name></artist>
            </artists>"#;

        let outcomes = collect(reader(xml, DataType::Artists)).unwrap();
        assert_eq!(outcomes.len(), 3);

        let DecodeOutcome::Record(first) = &outcomes[0] else {
            panic!("expected a record");
        };
        assert_eq!(first.id, "1");
        let crate::types::RecordPayload::Artist(artist) = &first.payload else {
            panic!("expected an artist");
        };
        assert_eq!(artist.real_name.as_deref(), Some("Jesper Dahlbäck"));
        assert_eq!(artist.name_variations, vec!["Persuader", "The Presuader"]);
        assert_eq!(artist.aliases[0].id.as_deref(), Some("239"));

        assert!(matches!(outcomes[1], DecodeOutcome::Malformed { position: 2, .. }));
        let DecodeOutcome::Record(third) = &outcomes[2] else {
            panic!("expected a record");
        };
        assert_eq!(third.payload.display_name(), "Mr. James Barth & A.D.");
    }

    #[test]
    fn test_mismatched_tags_are_structural() {
        let xml = "<artists><artist><id>1</id><name>A</name></artist><artist><id>2</name></artist></artists>";
        let mut source = reader(xml, DataType::Artists);

        assert!(matches!(source.next_outcome().unwrap(), Some(DecodeOutcome::Record(_))));
        let err = source.next_outcome().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ArchiveCorrupted);
    }

    #[test]
    fn test_truncated_document_is_structural() {
        let xml = "<artists><artist><id>1</id><name>A</name></artist><artist><id>2</id>";
        let mut source = reader(xml, DataType::Artists);

        assert!(source.next_outcome().unwrap().is_some());
        assert_eq!(source.next_outcome().unwrap_err().kind(), ErrorKind::ArchiveCorrupted);
    }

    #[test]
    fn test_skip_resumes_after_offset() {
        let xml = "<labels><label><id>1</id><name>A</name></label><label><id>2</id><name>B</name></label><label><id>3</id><name>C</name></label></labels>";
        let mut source = reader(xml, DataType::Labels);

        assert_eq!(source.skip(2).unwrap(), 2);
        let Some(DecodeOutcome::Record(record)) = source.next_outcome().unwrap() else {
            panic!("expected a record");
        };
        assert_eq!(record.id, "3");
        assert!(source.next_outcome().unwrap().is_none());
        assert_eq!(source.skip(5).unwrap(), 0);
    }

    #[test]
    fn test_reads_gzip_dump_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_dump(
            dir.path(),
            "discogs_20250101_masters.xml.gz",
            r#"<masters><master id="18500"><main_release>155102</main_release><title>New Soil</title><year>2001</year></master></masters>"#,
        );

        let outcomes = collect(XmlDumpReader::open(&path, DataType::Masters).unwrap()).unwrap();
        assert_eq!(outcomes.len(), 1);
        let DecodeOutcome::Record(record) = &outcomes[0] else {
            panic!("expected a record");
        };
        assert_eq!(record.id, "18500");
    }

    #[test]
    fn test_invalid_gzip_is_structural() {
        let mut bytes = gzip("<artists><artist><id>1</id><name>A</name></artist></artists>");
        let middle = bytes.len() / 2;
        bytes.truncate(middle);
        let mut source = XmlDumpReader::new(
            BufReader::new(GzDecoder::new(Cursor::new(bytes))),
            DataType::Artists,
            "broken.xml.gz",
        );

        let err = loop {
            match source.next_outcome() {
                Ok(Some(_)) => continue,
                Ok(None) => panic!("truncated archive decoded without error"),
                Err(err) => break err,
            }
        };
        assert_eq!(err.kind(), ErrorKind::ArchiveCorrupted);
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = XmlDumpReader::open(&dir.path().join("missing.xml.gz"), DataType::Artists)
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::ArchiveNotFound);
    }
}
