//! Coordination primitives shared by the extractor and loader workers.

pub mod shutdown;
pub mod timer;
