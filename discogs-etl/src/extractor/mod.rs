//! Streaming extraction of Discogs dumps onto the message bus.

mod archive;
mod convert;
mod discovery;
mod pipeline;
mod progress;

pub use archive::{DecodeOutcome, RecordSource, XmlDumpReader};
pub use convert::convert_record;
pub use discovery::{DumpFile, discover_dumps, parse_dump_file_name};
pub use pipeline::{Extractor, FileOutcome, FileSummary};
pub use progress::{DataTypeProgress, ExtractionProgress, spawn_progress_monitor};
