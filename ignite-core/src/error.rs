//! Error kinds shared across the core: store, repositories, allocator, and
//! the lease state machine all return `Result<T>` from this module.
use thiserror::Error;

/// Top-level error type for ignite-core operations.
#[derive(Debug, Error)]
pub enum IgniteError {
    /// Bad input from an external caller: invalid IP, missing required
    /// field. Never logged as an error by callers -- surfaced directly.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A server or lease id/mac/ip lookup came back empty.
    #[error("not found: {0}")]
    NotFound(String),

    /// Unique constraint violation (server IP, lease reservation on an IP
    /// already in use).
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Underlying KV or filesystem failure.
    #[error("store error during {op}: {source}")]
    Store {
        op: String,
        #[source]
        source: redb::Error,
    },

    /// Bind failure, send failure, or socket closed unexpectedly.
    #[error("network error: {0}")]
    Network(String),

    /// An operation (typically `Stop`) did not complete within its deadline.
    #[error("timed out waiting for {0}")]
    Timeout(String),

    /// Filesystem failure outside of redb itself (e.g. creating the parent
    /// directory for the database file).
    #[error("io error during {op}: {source}")]
    Io {
        op: String,
        #[source]
        source: std::io::Error,
    },

    /// A state machine transition would violate an invariant (e.g.
    /// unreserving a lease that isn't reserved).
    #[error("conflict: {0}")]
    Conflict(String),

    /// A record read back from the store didn't deserialize, or one about
    /// to be written didn't serialize.
    #[error("codec error during {op}: {source}")]
    Codec {
        op: String,
        #[source]
        source: serde_json::Error,
    },
}

impl From<serde_json::Error> for IgniteError {
    fn from(source: serde_json::Error) -> Self {
        IgniteError::Codec {
            op: "unspecified".into(),
            source,
        }
    }
}

impl IgniteError {
    pub fn store(op: impl Into<String>, source: impl Into<redb::Error>) -> Self {
        IgniteError::Store {
            op: op.into(),
            source: source.into(),
        }
    }
}

/// Allows `?` to convert a bare redb error with no operation context; prefer
/// `.map_err(|e| IgniteError::store("op name", e))` at call sites where the
/// operation name matters.
impl From<redb::Error> for IgniteError {
    fn from(source: redb::Error) -> Self {
        IgniteError::Store {
            op: "unspecified".into(),
            source,
        }
    }
}

impl From<redb::TableError> for IgniteError {
    fn from(source: redb::TableError) -> Self {
        IgniteError::from(redb::Error::from(source))
    }
}

impl From<redb::TransactionError> for IgniteError {
    fn from(source: redb::TransactionError) -> Self {
        IgniteError::from(redb::Error::from(source))
    }
}

impl From<redb::CommitError> for IgniteError {
    fn from(source: redb::CommitError) -> Self {
        IgniteError::from(redb::Error::from(source))
    }
}

impl From<redb::StorageError> for IgniteError {
    fn from(source: redb::StorageError) -> Self {
        IgniteError::from(redb::Error::from(source))
    }
}

impl From<redb::DatabaseError> for IgniteError {
    fn from(source: redb::DatabaseError) -> Self {
        IgniteError::from(redb::Error::from(source))
    }
}

/// Shorthand result alias used throughout ignite-core.
pub type Result<T> = std::result::Result<T, IgniteError>;
