use discogs_config::load_config;
use discogs_config::shared::LoaderServiceConfig;

use crate::error::{LoaderServiceError, LoaderServiceResult};

/// Loads and validates the loader configuration, including prefetch against the pool size.
pub fn load_loader_config() -> LoaderServiceResult<LoaderServiceConfig> {
    let config = load_config::<LoaderServiceConfig>().map_err(LoaderServiceError::config)?;
    config.validate().map_err(LoaderServiceError::config)?;

    Ok(config)
}
