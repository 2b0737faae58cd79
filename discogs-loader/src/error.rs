use std::error::Error;

use discogs_etl::error::EtlError;
use discogs_telemetry::health::HealthServerError;
use thiserror::Error;

pub type LoaderServiceResult<T> = Result<T, LoaderServiceError>;

#[derive(Debug, Error)]
pub enum LoaderServiceError {
    #[error(transparent)]
    Etl(#[from] EtlError),

    #[error("configuration error: {0}")]
    Config(Box<dyn Error + Send + Sync>),

    #[error("health server error: {0}")]
    HealthServer(#[from] HealthServerError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl LoaderServiceError {
    /// Short label used when logging the error.
    pub fn category(&self) -> &'static str {
        match self {
            LoaderServiceError::Etl(_) => "loader error",
            LoaderServiceError::Config(_) => "configuration error",
            LoaderServiceError::HealthServer(_) => "health server error",
            LoaderServiceError::Io(_) => "i/o error",
        }
    }

    pub fn config<E: Error + Send + Sync + 'static>(err: E) -> Self {
        LoaderServiceError::Config(Box::new(err))
    }
}
