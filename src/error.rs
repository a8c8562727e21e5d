//! Error taxonomy for the mapping layer.
//!
//! Schema and query errors are raised eagerly at the offending call and are
//! never silently swallowed. Wire errors carry the original `redis` error as
//! their source. Migration failures are final once the configured failure
//! policy has been exhausted.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum OmError {
    /// Invalid record or field configuration, detected at registration.
    #[error("schema error: {0}")]
    Schema(String),

    /// A query was constructed or combined improperly.
    #[error("query error: {0}")]
    Query(String),

    /// `get()` on a missing key, or `first()` of an empty result set.
    #[error("no record found")]
    NotFound,

    /// A stored value failed to deserialize into the record type.
    #[error("validation error: {0}")]
    Validation(#[source] serde_json::Error),

    /// Wire-level failure, after transient-error retries were exhausted.
    #[error("connection error: {0}")]
    Connection(#[source] redis::RedisError),

    /// Wire-level timeout.
    #[error("operation timed out: {0}")]
    Timeout(#[source] redis::RedisError),

    /// Fingerprint/file inconsistency, dependency cycles, unreversible
    /// rollback, or an exceeded error threshold.
    #[error("migration error: {0}")]
    Migration(String),

    /// The server lacks a required module (RediSearch or RedisJSON).
    #[error(
        "server capability missing: {0}. Install Redis Stack or load the \
         search/JSON modules before creating indexes."
    )]
    Capability(String),

    /// Search indexes only work against logical database 0.
    #[error("search indexes require database 0, but the connection URL selects database {0}")]
    DatabaseNumber(i64),
}

impl From<redis::RedisError> for OmError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_timeout() {
            OmError::Timeout(err)
        } else {
            OmError::Connection(err)
        }
    }
}

impl From<serde_json::Error> for OmError {
    fn from(err: serde_json::Error) -> Self {
        OmError::Validation(err)
    }
}

pub type Result<T> = std::result::Result<T, OmError>;

/// True when a server reply indicates the search module is absent, as opposed
/// to an ordinary command failure.
pub(crate) fn is_module_missing(err: &redis::RedisError) -> bool {
    let msg = err.to_string().to_lowercase();
    msg.contains("unknown command") || msg.contains("module command")
}

/// True when FT.DROPINDEX complained about a nonexistent index.
pub(crate) fn is_unknown_index(err: &redis::RedisError) -> bool {
    let msg = err.to_string().to_lowercase();
    msg.contains("unknown index") || msg.contains("no such index") || msg.contains("unknown: index")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redis_errors_map_to_connection() {
        let err = redis::RedisError::from((redis::ErrorKind::IoError, "boom"));
        match OmError::from(err) {
            OmError::Connection(_) => {}
            other => panic!("expected Connection, got {other:?}"),
        }
    }

    #[test]
    fn unknown_index_detection() {
        let err = redis::RedisError::from((
            redis::ErrorKind::ResponseError,
            "response",
            "Unknown Index name".to_string(),
        ));
        assert!(is_unknown_index(&err));
        assert!(!is_module_missing(&err));
    }
}
