use crate::types::{ArtistRecord, ExtractedRecord};

/// Artist record with an explicit hash, as used by deduplication tests.
pub fn artist(id: &str, hash: &str) -> ExtractedRecord {
    ExtractedRecord::new(ArtistRecord::new(id, format!("Artist {id}")))
        .unwrap()
        .with_hash(hash)
}
