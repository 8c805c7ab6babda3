//! Integrity verification primitives for the plugin host (C3 Signature Verifier).
//!
//! Two integrity formats are admitted on a plugin manifest, and the format is detected
//! from shape rather than declared: a 128-character lowercase hex string is the legacy
//! SHA-512 content hash; an object carrying `algorithm`/`signature`/`publicKey` is a PKI
//! descriptor (`ed25519-sha256` or `rsa-sha256`). See [`verifier::verify_integrity`] for
//! the entry point used by the sandbox manager.

pub mod error;
pub mod hash;
pub mod keypair;
pub mod signature;
pub mod verifier;

pub use error::{CryptoError, CryptoResult};
pub use hash::LegacyHash;
pub use keypair::Ed25519KeyPair;
pub use signature::{Signature, SignatureAlgorithm};
pub use verifier::{parse_integrity, verify_integrity, IntegrityVerdict, PkiIntegrity, RawIntegrity, SignatureAlgorithmKind};
