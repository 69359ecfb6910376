//! Error types for the aggregate metrics migration

use crate::schema::Bucket;
use std::fmt;
use std::path::PathBuf;

/// Result type alias for migration operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the aggregate metrics migration
#[derive(Debug)]
pub enum Error {
    /// IO errors
    Io(std::io::Error),
    /// Serialization errors
    Serialization(String),
    /// Configuration errors
    Config(String),
    /// Transient storage failure (read or write), retried by the caller
    Storage(String),
    /// Statement referenced a table that does not exist (or was dropped)
    TableNotFound(String),
    /// Statement was bound with the wrong number or type of values
    InvalidStatement(String),
    /// Index scan failed; the candidate key set for the bucket is unknown
    Scan { bucket: Bucket, message: String },
    /// Migration log could not be read or closed
    MigrationLog { path: PathBuf, message: String },
    /// Task processing was aborted
    Aborted(String),
    /// The run finished with outstanding work in one or more buckets
    Incomplete { outstanding: Vec<(Bucket, u64)> },
    /// Query time range is outside every retention window
    OutOfRange(String),
    /// No server operation is registered under this name
    UnknownOperation(String),
    /// Invalid argument
    InvalidArgument(String),
    /// Internal error
    Internal(String),
}

impl Error {
    /// Whether the error is a per-request failure that the migration retries.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Storage(_) | Error::Io(_))
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "IO error: {}", e),
            Error::Serialization(msg) => write!(f, "Serialization error: {}", msg),
            Error::Config(msg) => write!(f, "Configuration error: {}", msg),
            Error::Storage(msg) => write!(f, "Storage error: {}", msg),
            Error::TableNotFound(table) => write!(f, "Table not found: {}", table),
            Error::InvalidStatement(msg) => write!(f, "Invalid statement: {}", msg),
            Error::Scan { bucket, message } => {
                write!(f, "Index scan of {} data failed: {}", bucket, message)
            }
            Error::MigrationLog { path, message } => {
                write!(f, "Migration log {} failed: {}", path.display(), message)
            }
            Error::Aborted(msg) => write!(f, "Aborted: {}", msg),
            Error::Incomplete { outstanding } => {
                write!(f, "Migration did not complete, remaining schedules: ")?;
                for (i, (bucket, remaining)) in outstanding.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}={}", bucket, remaining)?;
                }
                write!(f, ". The migration has to be run again to finish.")
            }
            Error::OutOfRange(msg) => write!(f, "Out of range: {}", msg),
            Error::UnknownOperation(name) => write!(f, "Unknown server operation: {}", name),
            Error::InvalidArgument(msg) => write!(f, "Invalid argument: {}", msg),
            Error::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(e: tokio::task::JoinError) -> Self {
        Error::Internal(format!("task failed: {}", e))
    }
}
