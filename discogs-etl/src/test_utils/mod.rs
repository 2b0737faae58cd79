//! Helpers for tests of the pipeline and of crates building on it.

pub mod ack;
pub mod archive;
pub mod notify;
pub mod record;
pub mod test_sink_wrapper;
