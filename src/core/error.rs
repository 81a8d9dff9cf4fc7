//! Error types for weightsync.

use thiserror::Error;

/// Result type alias for weightsync operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in weightsync operations.
#[derive(Error, Debug)]
pub enum Error {
    // Communicator lifecycle errors
    #[error("Weight update group already initialized. Call close_communicator first.")]
    AlreadyInitialized,

    #[error("Communicator not initialized. Call init_communicator first.")]
    NotInitialized,

    #[error("Rendezvous failed: {0}")]
    RendezvousFailure(String),

    #[error("Collective operation failed: {0}")]
    Collective(String),

    // Request validation errors
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Unsupported dtype: {0}")]
    UnsupportedDtype(String),

    #[error("Shape mismatch for {name}: expected {expected}, got {actual}")]
    ShapeMismatch {
        name: String,
        expected: String,
        actual: String,
    },

    #[error("Unknown parameter: {0}")]
    UnknownParameter(String),

    // Engine errors
    #[error("Engine error: {0}")]
    Engine(String),

    #[error("{failed} of {total} workers failed: {first}")]
    WorkerFailures {
        failed: usize,
        total: usize,
        first: Box<Error>,
    },

    #[error("Server is shutting down")]
    ShuttingDown,

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // Serialization errors
    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the request itself was at fault.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Error::InvalidRequest(_)
                | Error::UnsupportedDtype(_)
                | Error::ShapeMismatch { .. }
                | Error::UnknownParameter(_)
        )
    }

    /// The innermost error, unwrapping aggregated worker failures.
    pub fn root(&self) -> &Error {
        match self {
            Error::WorkerFailures { first, .. } => first.root(),
            other => other,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::SerializationError(err.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Http(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_error_classification() {
        assert!(Error::InvalidRequest("empty name".into()).is_client_error());
        assert!(Error::UnsupportedDtype("complex64".into()).is_client_error());
        assert!(!Error::NotInitialized.is_client_error());
        assert!(!Error::Collective("peer gone".into()).is_client_error());
    }

    #[test]
    fn test_root_unwraps_worker_failures() {
        let err = Error::WorkerFailures {
            failed: 2,
            total: 2,
            first: Box::new(Error::NotInitialized),
        };
        assert!(matches!(err.root(), Error::NotInitialized));
        assert!(err.to_string().starts_with("2 of 2 workers failed"));
    }
}
