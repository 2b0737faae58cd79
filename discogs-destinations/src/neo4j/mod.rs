mod core;
mod error;

pub use core::{Neo4jConnector, Neo4jSink};
pub use error::neo4j_error_to_etl_error;
