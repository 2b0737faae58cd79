//! Core data types flowing through the pipeline.

mod data_type;
mod message;
mod record;

pub use data_type::DataType;
pub use message::{BusMessage, MessageKind};
pub use record::{
    ArtistRecord, EntityRef, ExtractedRecord, LabelRecord, LabelRef, MasterRecord, RecordPayload,
    ReleaseRecord, Track, content_hash,
};
