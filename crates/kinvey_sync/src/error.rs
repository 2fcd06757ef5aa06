//! Error types for the sync engine.

use kinvey_cache::CacheError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Structured error names the backend reports in its `error` field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerErrorKind {
    /// Delta set is not enabled for the collection.
    MissingConfiguration,
    /// The `since` value predates delta-set activation.
    ParameterValueOutOfRange,
    /// The result would exceed the server's result-set limit.
    ResultSetSizeExceeded,
    /// No entity with the requested id.
    EntityNotFound,
    /// The active credentials may not perform this request.
    InsufficientCredentials,
    /// Any other named error.
    Other(String),
}

impl ServerErrorKind {
    /// Maps a backend error name onto a kind.
    pub fn from_name(name: &str) -> Self {
        match name {
            "MissingConfiguration" => Self::MissingConfiguration,
            "ParameterValueOutOfRange" => Self::ParameterValueOutOfRange,
            "ResultSetSizeExceeded" => Self::ResultSetSizeExceeded,
            "EntityNotFound" => Self::EntityNotFound,
            "InsufficientCredentials" => Self::InsufficientCredentials,
            other => Self::Other(other.to_string()),
        }
    }

    /// The backend's name for this kind.
    pub fn as_str(&self) -> &str {
        match self {
            Self::MissingConfiguration => "MissingConfiguration",
            Self::ParameterValueOutOfRange => "ParameterValueOutOfRange",
            Self::ResultSetSizeExceeded => "ResultSetSizeExceeded",
            Self::EntityNotFound => "EntityNotFound",
            Self::InsufficientCredentials => "InsufficientCredentials",
            Self::Other(name) => name,
        }
    }
}

impl std::fmt::Display for ServerErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Network or transport error.
    #[error("network error: {message}")]
    Network {
        /// Error message.
        message: String,
        /// Whether the caller may retry.
        retryable: bool,
    },

    /// A network call did not finish within the configured timeout.
    #[error("operation timed out")]
    Timeout,

    /// The backend rejected the request with a named error.
    #[error("server error {kind}: {description}")]
    Server {
        /// Error name.
        kind: ServerErrorKind,
        /// Human-readable description.
        description: String,
        /// Extra diagnostics from the backend.
        debug: Option<String>,
    },

    /// Local cache failure.
    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    /// Invalid arguments or options, rejected before any I/O.
    #[error("validation error: {0}")]
    Validation(String),

    /// The call is not allowed in the current state.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// The operation is not available for this store type.
    #[error("{operation} is not supported by {store_type} stores")]
    InvalidStoreType {
        /// Operation name.
        operation: &'static str,
        /// Store type name.
        store_type: &'static str,
    },

    /// Pull was refused because local changes are waiting to be pushed.
    #[error(
        "You must push all pending sync items before new data is pulled. Call push() on the data \
         store instance to push pending items, or purge() to remove them. ({count} pending)"
    )]
    PendingChanges {
        /// Number of pending operations.
        count: usize,
    },

    /// Another pull of the same query is still running.
    #[error("a pull of the same query is already running on collection {collection}")]
    PullInProgress {
        /// Collection name.
        collection: String,
    },

    /// Pending changes of the collection are already being pushed.
    #[error("a push is already running on collection {collection}")]
    PushInProgress {
        /// Collection name.
        collection: String,
    },

    /// No entity with the requested id.
    #[error("entity {id} not found in collection {collection}")]
    EntityNotFound {
        /// Collection name.
        collection: String,
        /// Entity id.
        id: String,
    },

    /// A response could not be understood.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl SyncError {
    /// Creates a retryable network error.
    pub fn network_retryable(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable network error.
    pub fn network_fatal(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
            retryable: false,
        }
    }

    /// Creates a server error.
    pub fn server(kind: ServerErrorKind, description: impl Into<String>) -> Self {
        Self::Server {
            kind,
            description: description.into(),
            debug: None,
        }
    }

    /// Returns true if the caller can retry the operation.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Network { retryable, .. } => *retryable,
            SyncError::Timeout
            | SyncError::PullInProgress { .. }
            | SyncError::PushInProgress { .. } => true,
            _ => false,
        }
    }

    /// The server error kind, if this is a server error.
    pub fn server_kind(&self) -> Option<&ServerErrorKind> {
        match self {
            SyncError::Server { kind, .. } => Some(kind),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(SyncError::network_retryable("connection reset").is_retryable());
        assert!(!SyncError::network_fatal("bad certificate").is_retryable());
        assert!(SyncError::Timeout.is_retryable());
        assert!(SyncError::PushInProgress {
            collection: "books".into()
        }
        .is_retryable());
        assert!(!SyncError::Validation("bad".into()).is_retryable());
        assert!(!SyncError::server(ServerErrorKind::ResultSetSizeExceeded, "too many").is_retryable());
    }

    #[test]
    fn server_kind_names_round_trip() {
        for name in [
            "MissingConfiguration",
            "ParameterValueOutOfRange",
            "ResultSetSizeExceeded",
            "EntityNotFound",
            "InsufficientCredentials",
            "KinveyInternalErrorRetry",
        ] {
            assert_eq!(ServerErrorKind::from_name(name).as_str(), name);
        }
        assert_eq!(
            ServerErrorKind::from_name("Whatever"),
            ServerErrorKind::Other("Whatever".into())
        );
    }

    #[test]
    fn error_display() {
        let err = SyncError::PendingChanges { count: 2 };
        assert!(err.to_string().starts_with("You must push all pending sync items"));

        let err = SyncError::InvalidStoreType {
            operation: "pull",
            store_type: "network",
        };
        assert_eq!(err.to_string(), "pull is not supported by network stores");

        let err = SyncError::server(ServerErrorKind::MissingConfiguration, "delta set off");
        assert_eq!(err.server_kind(), Some(&ServerErrorKind::MissingConfiguration));
    }
}
