//! Error types for the state stores.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Unrecoverable storage failures. Lookup misses are not errors.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("I/O error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("database error: {0}")]
    Sqlite(#[from] sqlx::Error),

    #[error("password configured for {} but SQLite was built without SQLCipher", .path.display())]
    EncryptionUnavailable { path: PathBuf },

    #[error("corrupt storage at {}: {reason}", .path.display())]
    Corrupt { path: PathBuf, reason: String },

    #[error("unparsable ledger entry at {}: {reason}", .path.display())]
    Parse { path: PathBuf, reason: String },
}

impl StateError {
    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> StateError {
        let path = path.into();
        move |source| StateError::Io { path, source }
    }
}
