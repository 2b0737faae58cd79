use discogs_etl::error::{ErrorKind, EtlError};
use discogs_etl::etl_error;

/// SQLSTATE of a transaction aborted by a serialization failure.
const SERIALIZATION_FAILURE: &str = "40001";
/// SQLSTATE of a transaction aborted to break a deadlock.
const DEADLOCK_DETECTED: &str = "40P01";

/// Maps a [`sqlx::Error`] to an [`EtlError`].
///
/// Connection and pool failures and aborted transactions are transient, the batch is retried.
/// Every other database error is a rejected query.
pub fn pg_error_to_etl_error(err: sqlx::Error) -> EtlError {
    let (kind, description) = match &err {
        sqlx::Error::Io(_) | sqlx::Error::Tls(_) | sqlx::Error::WorkerCrashed => (
            ErrorKind::SinkConnectionFailed,
            "Postgres connection failed",
        ),
        sqlx::Error::PoolTimedOut => (
            ErrorKind::OperationTimedOut,
            "Timed out acquiring a Postgres connection",
        ),
        sqlx::Error::PoolClosed => (
            ErrorKind::SinkConnectionFailed,
            "Postgres connection pool is closed",
        ),
        sqlx::Error::Database(db_err) => match db_err.code().as_deref() {
            Some(SERIALIZATION_FAILURE) | Some(DEADLOCK_DETECTED) => (
                ErrorKind::SinkTransactionConflict,
                "Postgres transaction was aborted by a conflict",
            ),
            _ => (ErrorKind::SinkQueryFailed, "Postgres rejected the query"),
        },
        sqlx::Error::Configuration(_) => (ErrorKind::ConfigError, "Invalid Postgres configuration"),
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => (
            ErrorKind::ConversionError,
            "Failed to decode a Postgres value",
        ),
        _ => (ErrorKind::SinkQueryFailed, "Postgres operation failed"),
    };

    etl_error!(kind, description, err.to_string(), source: err)
}
