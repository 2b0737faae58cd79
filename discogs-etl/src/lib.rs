//! Resilient ingestion pipeline for the Discogs data dumps.
//!
//! The [`extractor`] streams compressed XML dumps, publishes one message per record to a
//! durable [`bus`] and checkpoints its progress in a [`store`]. Loaders consume the bus with
//! one [`workers::consumer::ConsumerWorker`] per data type and upsert batches into a [`sink`].

pub mod bus;
pub mod concurrency;
pub mod error;
pub mod extractor;
pub mod health;
pub mod loader;
mod macros;
pub mod metrics;
pub mod resilience;
pub mod sink;
pub mod state;
pub mod store;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod types;
pub mod workers;
