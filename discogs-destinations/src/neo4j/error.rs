use discogs_etl::error::{ErrorKind, EtlError};
use discogs_etl::etl_error;

/// Prefix of the status codes Neo4j marks as safe to retry, such as deadlocks.
const TRANSIENT_STATUS_PREFIX: &str = "Neo.TransientError";

/// Maps a [`neo4rs::Error`] to an [`EtlError`].
///
/// Lost connections and server side transient errors are retried. Rejected queries and
/// authentication failures are not.
pub fn neo4j_error_to_etl_error(err: neo4rs::Error) -> EtlError {
    let (kind, description) = match &err {
        neo4rs::Error::IOError { .. } | neo4rs::Error::ConnectionError => {
            (ErrorKind::SinkConnectionFailed, "Neo4j connection failed")
        }
        neo4rs::Error::AuthenticationError(_) => {
            (ErrorKind::ConfigError, "Neo4j rejected the credentials")
        }
        neo4rs::Error::UnsupportedScheme(_) | neo4rs::Error::UrlParseError(_) => {
            (ErrorKind::ConfigError, "Invalid Neo4j uri")
        }
        neo4rs::Error::Neo4j(_) if err.to_string().contains(TRANSIENT_STATUS_PREFIX) => (
            ErrorKind::SinkTransactionConflict,
            "Neo4j aborted the transaction with a transient error",
        ),
        neo4rs::Error::Neo4j(_) => (ErrorKind::SinkQueryFailed, "Neo4j rejected the query"),
        _ => (ErrorKind::SinkQueryFailed, "Neo4j operation failed"),
    };

    etl_error!(kind, description, err.to_string(), source: err)
}
