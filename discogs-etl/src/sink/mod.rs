mod base;
pub mod memory;

pub use base::{Sink, last_write_wins};
