use discogs_config::load_config;
use discogs_config::shared::ExtractorServiceConfig;

use crate::error::{ExtractorServiceError, ExtractorServiceResult};

/// Loads and validates the extractor configuration.
pub fn load_extractor_config() -> ExtractorServiceResult<ExtractorServiceConfig> {
    let config =
        load_config::<ExtractorServiceConfig>().map_err(ExtractorServiceError::config)?;
    config.validate().map_err(ExtractorServiceError::config)?;

    Ok(config)
}
