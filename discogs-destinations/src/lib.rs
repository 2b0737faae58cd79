//! Sinks the loader writes record batches to.
//!
//! Both sinks upsert by `(data_type, id)` and only rewrite a record when its content hash
//! changed, so redelivered batches leave the stores untouched.

#[cfg(any(feature = "postgres", feature = "neo4j"))]
mod metrics;
#[cfg(feature = "neo4j")]
pub mod neo4j;
#[cfg(feature = "postgres")]
pub mod postgres;
