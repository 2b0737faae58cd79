//! Loader workers: batching, consumer lifecycle and the consume loop.

pub mod batch;
pub mod consumer;
pub mod lifecycle;

pub use batch::{BatchProcessor, FlushReason, FlushSummary};
pub use consumer::{ConsumerStatus, ConsumerWorker, ConsumerWorkerHandle, ConsumerWorkerState};
pub use lifecycle::{ConsumerLifecycle, ConsumerState};
