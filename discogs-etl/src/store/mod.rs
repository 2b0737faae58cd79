//! Storage of [`crate::state::StateMarker`]s.

mod base;
mod file;
mod memory;

pub use base::StateMarkerStore;
pub use file::FileStateMarkerStore;
pub use memory::MemoryStateMarkerStore;
