//! Extractor service binary.
//!
//! Discovers the Discogs dump files, publishes their records to the message bus and keeps a
//! state marker per data type so a restart resumes where the previous run stopped.

use clap::Parser;
use discogs_telemetry::tracing::init_tracing;
use tracing::error;

use crate::config::load_extractor_config;
use crate::core::start_extractor_with_config;

mod config;
mod core;
mod error;

#[derive(Parser)]
#[command(name = "discogs-extractor", about = "Publishes Discogs dump records to the message bus")]
struct Args {
    /// Process every dump from the start, ignoring completed state markers.
    #[arg(long)]
    force_reprocess: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = load_extractor_config()?;
    if args.force_reprocess {
        config.extractor.force_reprocess = true;
    }

    let _log_flusher = init_tracing(env!("CARGO_BIN_NAME"))?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async {
            if let Err(err) = start_extractor_with_config(config).await {
                error!(category = err.category(), error = %err, "extractor failed");
                return Err(err);
            }

            Ok(())
        })?;

    Ok(())
}
