//! Error taxonomy for the knowledge store.
//!
//! Every variant maps to a stable [`KbError::code`] string that travels over the
//! daemon protocol, so clients can tell "no knowledge yet" apart from "store
//! unreachable" without parsing messages.

use std::path::PathBuf;

/// Result alias used throughout the library.
pub type KbResult<T> = std::result::Result<T, KbError>;

#[derive(Debug, thiserror::Error)]
pub enum KbError {
    /// The project has no fact log yet.
    #[error("knowledge store not initialized at {}", .0.display())]
    NotInitialized(PathBuf),

    /// Disk or socket I/O failed.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A persisted artifact could not be parsed.
    #[error("corrupt data at line {line}: {message}")]
    Corrupt { line: usize, message: String },

    /// A malformed request or an invalid fact payload.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The embedding provider failed.
    #[error("embedding failed: {0}")]
    Embedding(String),

    /// The persisted vector cache is unusable.
    #[error("index database error: {0}")]
    IndexDb(#[from] rusqlite::Error),

    /// A long-running operation was abandoned because the daemon is stopping.
    #[error("operation cancelled")]
    Cancelled,

    /// The daemon did not reach `Ready` in time.
    #[error("daemon failed to start: {message}\n--- startup log ---\n{log}")]
    DaemonStartup { message: String, log: String },

    /// No live daemon answered on the endpoint.
    #[error("daemon unreachable at {}: {reason}", .socket.display())]
    DaemonUnreachable { socket: PathBuf, reason: String },

    /// The daemon answered with an error response.
    #[error("daemon error ({code}): {message}")]
    Remote { code: String, message: String },
}

impl KbError {
    /// Stable machine-readable error code.
    pub fn code(&self) -> &str {
        match self {
            Self::NotInitialized(_) => "not_initialized",
            Self::Io(_) => "io",
            Self::Corrupt { .. } => "corrupt",
            Self::Protocol(_) => "protocol",
            Self::Embedding(_) => "embedding",
            Self::IndexDb(_) => "index_db",
            Self::Cancelled => "cancelled",
            Self::DaemonStartup { .. } => "daemon_startup",
            Self::DaemonUnreachable { .. } => "daemon_unreachable",
            Self::Remote { code, .. } => code,
        }
    }
}

impl From<serde_json::Error> for KbError {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol(err.to_string())
    }
}
