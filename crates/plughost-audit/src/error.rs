//! Audit logger error types.

use std::path::PathBuf;

/// Errors from audit log operations.
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    /// The audit directory could not be created.
    #[error("failed to create audit directory {path}: {source}")]
    DirCreate {
        /// Directory that could not be created.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Writing an entry to the current log file failed.
    #[error("failed to write audit entry to {path}: {source}")]
    Write {
        /// File that failed the write.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Rotating to a new log file failed.
    #[error("failed to rotate audit log for plugin {plugin_name}: {source}")]
    Rotate {
        /// Plugin whose log failed to rotate.
        plugin_name: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// Result type for audit logger operations.
pub type AuditResult<T> = Result<T, AuditError>;
