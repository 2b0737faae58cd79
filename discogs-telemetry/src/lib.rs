//! Logging, metrics and health endpoints shared by the discogs services.

pub mod health;
pub mod metrics;
pub mod tracing;
