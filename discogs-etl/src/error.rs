//! Error types and result definitions for the ingestion pipeline.
//!
//! [`EtlError`] carries a classification ([`ErrorKind`]), a static description, optional dynamic
//! detail, an optional source error and the callsite where it was created. Worker failures are
//! aggregated into a single error so callers see every failed data type at once.

use std::backtrace::{Backtrace, BacktraceStatus};
use std::borrow::Cow;
use std::error;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::panic::Location;
use std::sync::Arc;

/// Result type used across the pipeline.
pub type EtlResult<T> = Result<T, EtlError>;

#[derive(Debug, Clone)]
struct ErrorPayload {
    kind: ErrorKind,
    description: Cow<'static, str>,
    detail: Option<Cow<'static, str>>,
    source: Option<Arc<dyn error::Error + Send + Sync>>,
    location: &'static Location<'static>,
    backtrace: Arc<Backtrace>,
}

/// Main error type of the pipeline.
///
/// Either a single classified error or an aggregate of several errors, typically one per
/// failed worker.
#[derive(Debug, Clone)]
pub struct EtlError {
    repr: ErrorRepr,
}

#[derive(Debug, Clone)]
enum ErrorRepr {
    Single(ErrorPayload),
    Many {
        errors: Vec<EtlError>,
        location: &'static Location<'static>,
    },
}

/// Classification of pipeline failures.
///
/// The kind decides how a failure is handled: transient kinds are retried and counted by
/// circuit breakers, the others fail the operation immediately.
#[derive(PartialEq, Eq, Copy, Clone, Debug, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    // Connection Errors
    BusConnectionFailed,
    SinkConnectionFailed,

    // Bus & Sink Operation Errors
    BusPublishFailed,
    BusPublishNacked,
    BusConsumeFailed,
    BusProtocolError,
    SinkQueryFailed,
    SinkTransactionConflict,

    // Resilience Errors
    OperationTimedOut,
    CircuitOpen,
    RetriesExhausted,

    // Source Archive Errors
    MalformedRecord,
    ArchiveCorrupted,
    ArchiveNotFound,

    // Data & Transformation Errors
    ConversionError,
    InvalidData,
    ValidationError,

    // Configuration Errors
    ConfigError,

    // IO & Serialization Errors
    IoError,
    SerializationError,
    DeserializationError,

    // State & Workflow Errors
    InvalidState,
    StateMarkerCorrupted,
    ExtractorWorkerPanic,
    ConsumerWorkerPanic,

    // Unknown / Uncategorized
    Unknown,
}

impl ErrorKind {
    /// Returns `true` for failures that may succeed when the operation is retried later.
    ///
    /// Only transient failures count towards tripping a circuit breaker.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ErrorKind::BusConnectionFailed
                | ErrorKind::SinkConnectionFailed
                | ErrorKind::BusPublishFailed
                | ErrorKind::BusPublishNacked
                | ErrorKind::BusConsumeFailed
                | ErrorKind::SinkTransactionConflict
                | ErrorKind::OperationTimedOut
                | ErrorKind::IoError
        )
    }
}

impl EtlError {
    /// Returns the [`ErrorKind`] of this error, or of the first aggregated error.
    pub fn kind(&self) -> ErrorKind {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.kind,
            ErrorRepr::Many { ref errors, .. } => errors
                .first()
                .map(|err| err.kind())
                .unwrap_or(ErrorKind::Unknown),
        }
    }

    /// Returns every [`ErrorKind`] contained in this error, flattening aggregates.
    pub fn kinds(&self) -> Vec<ErrorKind> {
        match self.repr {
            ErrorRepr::Single(ref payload) => vec![payload.kind],
            ErrorRepr::Many { ref errors, .. } => errors.iter().flat_map(|err| err.kinds()).collect(),
        }
    }

    /// Returns `true` if every contained error is transient.
    pub fn is_transient(&self) -> bool {
        let kinds = self.kinds();
        !kinds.is_empty() && kinds.iter().all(ErrorKind::is_transient)
    }

    pub fn description(&self) -> &str {
        match self.repr {
            ErrorRepr::Single(ref payload) => &payload.description,
            ErrorRepr::Many { .. } => "multiple errors",
        }
    }

    /// Returns the dynamic detail, or the first detail found in an aggregate.
    pub fn detail(&self) -> Option<&str> {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.detail.as_deref(),
            ErrorRepr::Many { ref errors, .. } => errors.iter().find_map(|e| e.detail()),
        }
    }

    pub fn backtrace(&self) -> Option<&Backtrace> {
        match self.repr {
            ErrorRepr::Single(ref payload) => Some(payload.backtrace.as_ref()),
            ErrorRepr::Many { .. } => None,
        }
    }

    pub fn location(&self) -> &'static Location<'static> {
        match self.repr {
            ErrorRepr::Single(ref payload) => payload.location,
            ErrorRepr::Many { location, .. } => location,
        }
    }

    /// Attaches the originating error, exposed through [`error::Error::source`].
    ///
    /// Aggregates ignore the call since they forward their first error as source.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: error::Error + Send + Sync + 'static,
    {
        if let ErrorRepr::Single(ref mut payload) = self.repr {
            payload.source = Some(Arc::new(source));
        }
        self
    }

    #[track_caller]
    fn from_components(
        kind: ErrorKind,
        description: Cow<'static, str>,
        detail: Option<Cow<'static, str>>,
        source: Option<Arc<dyn error::Error + Send + Sync>>,
    ) -> Self {
        EtlError {
            repr: ErrorRepr::Single(ErrorPayload {
                kind,
                description,
                detail,
                source,
                location: Location::caller(),
                backtrace: Arc::new(Backtrace::capture()),
            }),
        }
    }

    #[track_caller]
    fn from_source<E>(kind: ErrorKind, description: &'static str, err: E) -> Self
    where
        E: error::Error + Send + Sync + 'static,
    {
        let detail = err.to_string();
        EtlError::from_components(
            kind,
            Cow::Borrowed(description),
            Some(Cow::Owned(detail)),
            Some(Arc::new(err)),
        )
    }
}

impl PartialEq for EtlError {
    fn eq(&self, other: &EtlError) -> bool {
        match (&self.repr, &other.repr) {
            (ErrorRepr::Single(a), ErrorRepr::Single(b)) => a.kind == b.kind,
            (ErrorRepr::Many { errors: a, .. }, ErrorRepr::Many { errors: b, .. }) => a == b,
            _ => false,
        }
    }
}

impl Eq for EtlError {}

impl Hash for EtlError {
    /// Hashes the kind and static description only, so repeated occurrences of the same
    /// failure group together regardless of detail or callsite.
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(&self.repr).hash(state);
        match &self.repr {
            ErrorRepr::Single(payload) => {
                payload.kind.hash(state);
                payload.description.hash(state);
            }
            ErrorRepr::Many { errors, .. } => {
                errors.len().hash(state);
                for error in errors {
                    error.hash(state);
                }
            }
        }
    }
}

impl fmt::Display for EtlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.repr {
            ErrorRepr::Single(payload) => {
                write!(f, "[{:?}] {} @ {}", payload.kind, payload.description, payload.location)?;
                if let Some(detail) = &payload.detail {
                    write!(f, ": {detail}")?;
                }
                if payload.backtrace.status() == BacktraceStatus::Captured {
                    write!(f, "\n{}", payload.backtrace)?;
                }

                Ok(())
            }
            ErrorRepr::Many { errors, location } => {
                write!(f, "[Many] {} error(s) aggregated @ {location}", errors.len())?;
                for (position, error) in errors.iter().enumerate() {
                    let rendered = error.to_string();
                    write!(f, "\n  {}. {}", position + 1, rendered.replace('\n', "\n     "))?;
                }

                Ok(())
            }
        }
    }
}

impl error::Error for EtlError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match &self.repr {
            ErrorRepr::Single(payload) => payload
                .source
                .as_deref()
                .map(|source| source as &(dyn error::Error + 'static)),
            ErrorRepr::Many { errors, .. } => {
                errors.first().map(|error| error as &(dyn error::Error + 'static))
            }
        }
    }
}

impl From<(ErrorKind, &'static str)> for EtlError {
    #[track_caller]
    fn from((kind, desc): (ErrorKind, &'static str)) -> EtlError {
        EtlError::from_components(kind, Cow::Borrowed(desc), None, None)
    }
}

impl<D> From<(ErrorKind, &'static str, D)> for EtlError
where
    D: Into<Cow<'static, str>>,
{
    #[track_caller]
    fn from((kind, desc, detail): (ErrorKind, &'static str, D)) -> EtlError {
        EtlError::from_components(kind, Cow::Borrowed(desc), Some(detail.into()), None)
    }
}

/// Aggregates errors. A single error is returned as is.
impl<E> From<Vec<E>> for EtlError
where
    E: Into<EtlError>,
{
    #[track_caller]
    fn from(errors: Vec<E>) -> EtlError {
        let location = Location::caller();
        let mut errors: Vec<EtlError> = errors.into_iter().map(Into::into).collect();

        if errors.len() == 1 {
            if let Some(error) = errors.pop() {
                return error;
            }
        }

        EtlError {
            repr: ErrorRepr::Many { errors, location },
        }
    }
}

impl From<std::io::Error> for EtlError {
    #[track_caller]
    fn from(err: std::io::Error) -> EtlError {
        EtlError::from_source(ErrorKind::IoError, "I/O operation failed", err)
    }
}

/// Maps JSON failures by category, I/O failures stay retryable.
impl From<serde_json::Error> for EtlError {
    #[track_caller]
    fn from(err: serde_json::Error) -> EtlError {
        let (kind, description) = match err.classify() {
            serde_json::error::Category::Io => (ErrorKind::IoError, "JSON I/O operation failed"),
            serde_json::error::Category::Syntax
            | serde_json::error::Category::Data
            | serde_json::error::Category::Eof => {
                (ErrorKind::DeserializationError, "JSON deserialization failed")
            }
        };

        EtlError::from_source(kind, description, err)
    }
}

impl From<std::str::Utf8Error> for EtlError {
    #[track_caller]
    fn from(err: std::str::Utf8Error) -> EtlError {
        EtlError::from_source(ErrorKind::ConversionError, "UTF-8 conversion failed", err)
    }
}

impl From<std::string::FromUtf8Error> for EtlError {
    #[track_caller]
    fn from(err: std::string::FromUtf8Error) -> EtlError {
        EtlError::from_source(ErrorKind::ConversionError, "UTF-8 string conversion failed", err)
    }
}

impl From<std::num::ParseIntError> for EtlError {
    #[track_caller]
    fn from(err: std::num::ParseIntError) -> EtlError {
        EtlError::from_source(ErrorKind::ConversionError, "Integer parsing failed", err)
    }
}

impl From<chrono::ParseError> for EtlError {
    #[track_caller]
    fn from(err: chrono::ParseError) -> EtlError {
        EtlError::from_source(ErrorKind::ConversionError, "Datetime parsing failed", err)
    }
}

impl From<tokio::time::error::Elapsed> for EtlError {
    #[track_caller]
    fn from(err: tokio::time::error::Elapsed) -> EtlError {
        EtlError::from_source(ErrorKind::OperationTimedOut, "Operation timed out", err)
    }
}

/// Structural decoder failures. Per-record attribute and escape problems are classified by
/// the archive reader itself as [`ErrorKind::MalformedRecord`].
impl From<quick_xml::Error> for EtlError {
    #[track_caller]
    fn from(err: quick_xml::Error) -> EtlError {
        let (kind, description) = match &err {
            quick_xml::Error::Io(_) => (ErrorKind::IoError, "Dump archive read failed"),
            _ => (ErrorKind::ArchiveCorrupted, "Dump archive is not well formed XML"),
        };

        EtlError::from_source(kind, description, err)
    }
}

/// Maps AMQP client failures. Connection and channel level failures are transient, protocol
/// level failures such as a mismatching queue declaration are not.
impl From<lapin::Error> for EtlError {
    #[track_caller]
    fn from(err: lapin::Error) -> EtlError {
        let (kind, description) = match &err {
            lapin::Error::IOError(..)
            | lapin::Error::InvalidConnectionState(..)
            | lapin::Error::InvalidChannelState(..)
            | lapin::Error::InvalidChannel(..)
            | lapin::Error::ChannelsLimitReached => {
                (ErrorKind::BusConnectionFailed, "AMQP connection failed")
            }
            lapin::Error::ProtocolError(..) => (ErrorKind::BusProtocolError, "AMQP protocol error"),
            lapin::Error::ParsingError(..) | lapin::Error::SerialisationError(..) => {
                (ErrorKind::BusProtocolError, "AMQP frame could not be processed")
            }
            _ => (ErrorKind::BusConnectionFailed, "AMQP operation failed"),
        };

        EtlError::from_source(kind, description, err)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::etl_error;

    #[test]
    fn test_single_error_accessors() {
        let err = etl_error!(ErrorKind::SinkQueryFailed, "Upsert failed", "artists batch of 3");

        assert_eq!(err.kind(), ErrorKind::SinkQueryFailed);
        assert_eq!(err.description(), "Upsert failed");
        assert_eq!(err.detail(), Some("artists batch of 3"));
        assert!(!err.is_transient());
        assert!(err.to_string().starts_with("[SinkQueryFailed] Upsert failed @"));
    }

    #[test]
    fn test_aggregate_of_one_is_unwrapped() {
        let err: EtlError = vec![etl_error!(ErrorKind::CircuitOpen, "Circuit open")].into();
        assert_eq!(err.kind(), ErrorKind::CircuitOpen);
        assert!(err.backtrace().is_some());
    }

    #[test]
    fn test_aggregate_transience_requires_every_error() {
        let all_transient: EtlError = vec![
            etl_error!(ErrorKind::BusConnectionFailed, "Bus down"),
            etl_error!(ErrorKind::OperationTimedOut, "Timed out"),
        ]
        .into();
        assert!(all_transient.is_transient());
        assert_eq!(
            all_transient.kinds(),
            vec![ErrorKind::BusConnectionFailed, ErrorKind::OperationTimedOut]
        );

        let mixed: EtlError = vec![
            etl_error!(ErrorKind::BusConnectionFailed, "Bus down"),
            etl_error!(ErrorKind::ArchiveCorrupted, "Truncated archive"),
        ]
        .into();
        assert!(!mixed.is_transient());
        assert!(mixed.to_string().starts_with("[Many] 2 error(s) aggregated"));
    }

    #[test]
    fn test_hash_ignores_detail() {
        let mut set = HashSet::new();
        set.insert(etl_error!(ErrorKind::MalformedRecord, "Record skipped", "id 1"));
        set.insert(etl_error!(ErrorKind::MalformedRecord, "Record skipped", "id 2"));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_io_error_conversion_keeps_source() {
        let err: EtlError = std::io::Error::other("disk gone").into();
        assert_eq!(err.kind(), ErrorKind::IoError);
        assert!(err.is_transient());
        assert!(error::Error::source(&err).is_some());
    }

    #[test]
    fn test_json_syntax_error_is_deserialization_error() {
        let err: EtlError = serde_json::from_str::<serde_json::Value>("{").unwrap_err().into();
        assert_eq!(err.kind(), ErrorKind::DeserializationError);
    }
}
