use std::error::Error;

use discogs_etl::error::EtlError;
use discogs_telemetry::health::HealthServerError;
use thiserror::Error;

pub type ExtractorServiceResult<T> = Result<T, ExtractorServiceError>;

#[derive(Debug, Error)]
pub enum ExtractorServiceError {
    #[error(transparent)]
    Etl(#[from] EtlError),

    #[error("configuration error: {0}")]
    Config(Box<dyn Error + Send + Sync>),

    #[error("health server error: {0}")]
    HealthServer(#[from] HealthServerError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl ExtractorServiceError {
    /// Short label used when logging the error.
    pub fn category(&self) -> &'static str {
        match self {
            ExtractorServiceError::Etl(_) => "extraction error",
            ExtractorServiceError::Config(_) => "configuration error",
            ExtractorServiceError::HealthServer(_) => "health server error",
            ExtractorServiceError::Io(_) => "i/o error",
        }
    }

    pub fn config<E: Error + Send + Sync + 'static>(err: E) -> Self {
        ExtractorServiceError::Config(Box::new(err))
    }
}
