mod core;
mod error;

pub use core::{PostgresConnector, PostgresSink};
pub use error::pg_error_to_etl_error;
