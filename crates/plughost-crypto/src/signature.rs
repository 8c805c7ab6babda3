//! PKI signature formats recognized by the manifest `integrity` object.

use serde::{Deserialize, Serialize};

/// A detached signature, tagged by the algorithm that produced it.
#[derive(Debug, Clone)]
pub enum Signature {
    /// `ed25519-sha256`: raw Ed25519 over the file contents (no prehashing despite the
    /// algorithm name — the `-sha256` suffix names the digest used inside the curve's
    /// own signing scheme, not an outer prehash).
    Ed25519([u8; 64]),
    /// `rsa-sha256`: RSASSA-PKCS1-v1_5 with SHA-256.
    Rsa(Vec<u8>),
}

/// The algorithm tag as it appears on the wire (`manifest.integrity.algorithm`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignatureAlgorithm {
    /// Ed25519 over SHA-256-named digest convention.
    Ed25519Sha256,
    /// RSASSA-PKCS1-v1_5 with SHA-256.
    RsaSha256,
}

impl SignatureAlgorithm {
    /// Parse the wire tag, rejecting anything not in the closed set.
    #[must_use]
    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            "ed25519-sha256" => Some(Self::Ed25519Sha256),
            "rsa-sha256" => Some(Self::RsaSha256),
            _ => None,
        }
    }
}
