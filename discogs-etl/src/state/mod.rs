//! Persistent extraction progress.

mod marker;

pub use marker::{ProcessingDecision, SourceIdentity, StateMarker};
