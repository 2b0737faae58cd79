//! Loader service binary.
//!
//! Consumes the record queues of one consumer group and upserts batches into the configured
//! sink, either the Neo4j graph or the Postgres tables.

use discogs_telemetry::tracing::init_tracing;
use tracing::error;

use crate::config::load_loader_config;
use crate::core::start_loader_with_config;

mod config;
mod core;
mod error;

fn main() -> anyhow::Result<()> {
    let config = load_loader_config()?;

    let _log_flusher = init_tracing(env!("CARGO_BIN_NAME"))?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async {
            if let Err(err) = start_loader_with_config(config).await {
                error!(category = err.category(), error = %err, "loader failed");
                return Err(err);
            }

            Ok(())
        })?;

    Ok(())
}
