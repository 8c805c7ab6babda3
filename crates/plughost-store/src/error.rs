//! Secure store error types.

use std::path::PathBuf;

use thiserror::Error;

/// Errors produced by the secure credential store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The dual-layer lock could not be acquired before `timeoutMs` elapsed.
    #[error("lock acquisition timed out after {0:?} for {1}")]
    LockTimeout(std::time::Duration, PathBuf),

    /// Underlying I/O error.
    #[error("I/O error on {path}: {source}")]
    Io {
        /// The path the operation touched.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The stored payload is not valid JSON (neither encrypted blob nor legacy
    /// plaintext).
    #[error("malformed store payload at {0}")]
    MalformedPayload(PathBuf),

    /// Key derivation input was empty (no hostname/username resolvable).
    #[error("could not resolve machine identity for key derivation")]
    NoMachineIdentity,
}

/// Result type for secure store operations.
pub type StoreResult<T> = Result<T, StoreError>;
