//! Integrity verification error types.

use thiserror::Error;

/// Errors that can occur while verifying plugin integrity.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// The integrity field was neither a 128-hex legacy hash nor a recognized PKI object.
    #[error("unrecognized integrity format")]
    UnrecognizedFormat,

    /// The legacy content hash did not match the file contents.
    #[error("content hash mismatch")]
    HashMismatch,

    /// Signature verification failed against the supplied public key.
    #[error("signature verification failed")]
    SignatureVerificationFailed,

    /// The `publicKey` field could not be parsed.
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    /// The `signature` field could not be decoded.
    #[error("invalid signature encoding: {0}")]
    InvalidSignatureEncoding(String),

    /// Invalid key length.
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Expected length in bytes.
        expected: usize,
        /// Actual length in bytes.
        actual: usize,
    },

    /// An unsupported or unknown PKI algorithm tag.
    #[error("unsupported signature algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// I/O error reading the entry file.
    #[error("I/O error: {0}")]
    IoError(String),
}

/// Result type for cryptographic operations.
pub type CryptoResult<T> = Result<T, CryptoError>;
