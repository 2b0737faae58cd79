use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// A field holds a value outside of its accepted range.
    #[error("Invalid value for `{field}`: {constraint}")]
    InvalidFieldValue { field: String, constraint: String },
    /// The loader would hold more unacknowledged deliveries than the sink pool can serve.
    #[error(
        "`loader.prefetch_count` ({prefetch_count}) must not exceed the destination pool size ({max_connections})"
    )]
    PrefetchExceedsConnections {
        prefetch_count: u16,
        max_connections: u32,
    },
    #[error(
        "`loader.batch.max_size` ({max_size}) must not exceed `loader.prefetch_count` ({prefetch_count})"
    )]
    BatchExceedsPrefetch { max_size: usize, prefetch_count: u16 },
    /// No data types were configured.
    #[error("`{0}` must list at least one data type")]
    NoDataTypes(String),
    /// A data type name is not one of artists, labels, masters or releases.
    #[error("`{0}` is not a supported data type")]
    UnknownDataType(String),
}

pub(crate) fn ensure_positive(field: &str, value: u64) -> Result<(), ValidationError> {
    if value == 0 {
        return Err(ValidationError::InvalidFieldValue {
            field: field.to_string(),
            constraint: "must be greater than 0".to_string(),
        });
    }

    Ok(())
}

pub(crate) const KNOWN_DATA_TYPES: &[&str] = &["artists", "labels", "masters", "releases"];

pub(crate) fn validate_data_types(field: &str, data_types: &[String]) -> Result<(), ValidationError> {
    if data_types.is_empty() {
        return Err(ValidationError::NoDataTypes(field.to_string()));
    }

    for data_type in data_types {
        if !KNOWN_DATA_TYPES.contains(&data_type.as_str()) {
            return Err(ValidationError::UnknownDataType(data_type.clone()));
        }
    }

    Ok(())
}

pub(crate) fn default_data_types() -> Vec<String> {
    KNOWN_DATA_TYPES.iter().map(|s| s.to_string()).collect()
}
