//! Integrity verdict: detect the manifest's `integrity` field format and verify it.
//!
//! The format is *detected*, never declared by a separate tag: a 128-character lowercase
//! hex string is the legacy SHA-512 content hash; anything else is parsed as a PKI
//! descriptor. Verification fails closed — an unrecognized shape, a hash mismatch, or a
//! signature failure all reject; there is no partial-success verdict.

use base64::Engine;
use rsa::pkcs1v15::{Signature as RsaSignature, VerifyingKey as RsaVerifyingKey};
use rsa::pkcs8::DecodePublicKey;
use rsa::signature::Verifier;
use rsa::RsaPublicKey;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::{CryptoError, CryptoResult};
use crate::hash::LegacyHash;
use crate::keypair::verify_ed25519;
use crate::signature::SignatureAlgorithm;

/// The PKI shape of `manifest.integrity` when it is not a legacy hex hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PkiIntegrity {
    /// Signing algorithm tag.
    pub algorithm: String,
    /// Base64-encoded detached signature.
    pub signature: String,
    /// PEM-encoded public key.
    pub public_key: String,
    /// Optional author attribution, carried but not verified.
    #[serde(default)]
    pub author: Option<String>,
    /// Optional signing timestamp, carried but not verified.
    #[serde(default)]
    pub timestamp: Option<i64>,
}

/// The two shapes a manifest's `integrity` field can take, as a raw JSON value.
///
/// Deserialized loosely (untagged) so detection can run on the parsed shape rather than
/// needing the caller to pre-classify it.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RawIntegrity {
    /// A bare string — legacy format if it parses as 128 lowercase hex, otherwise
    /// rejected at verification time.
    Legacy(String),
    /// The PKI object shape.
    Pki(PkiIntegrity),
}

/// A successful verdict, carrying which format matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrityVerdict {
    /// Legacy SHA-512 content hash matched.
    Legacy,
    /// PKI signature verified.
    Pki(SignatureAlgorithmKind),
}

/// Mirror of [`SignatureAlgorithm`] surfaced in the verdict for logging/audit purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureAlgorithmKind {
    /// Ed25519.
    Ed25519,
    /// RSA.
    Rsa,
}

/// Verify a manifest's `integrity` field against the plugin entry file's raw bytes.
///
/// Fails closed: an unrecognized format, a content-hash mismatch, or a signature failure
/// all return an error. There is no partial-success outcome.
///
/// # Errors
///
/// See [`CryptoError`] variants.
pub fn verify_integrity(integrity: &RawIntegrity, entry_bytes: &[u8]) -> CryptoResult<IntegrityVerdict> {
    match integrity {
        RawIntegrity::Legacy(s) => {
            let hash =
                LegacyHash::parse(s).ok_or(CryptoError::UnrecognizedFormat)?;
            hash.verify(entry_bytes)?;
            Ok(IntegrityVerdict::Legacy)
        },
        RawIntegrity::Pki(pki) => verify_pki(pki, entry_bytes),
    }
}

fn verify_pki(pki: &PkiIntegrity, entry_bytes: &[u8]) -> CryptoResult<IntegrityVerdict> {
    let algorithm = SignatureAlgorithm::parse(&pki.algorithm)
        .ok_or_else(|| CryptoError::UnsupportedAlgorithm(pki.algorithm.clone()))?;

    let signature_bytes = base64::engine::general_purpose::STANDARD
        .decode(&pki.signature)
        .map_err(|e| CryptoError::InvalidSignatureEncoding(e.to_string()))?;

    match algorithm {
        SignatureAlgorithm::Ed25519Sha256 => {
            if signature_bytes.len() != 64 {
                return Err(CryptoError::InvalidKeyLength {
                    expected: 64,
                    actual: signature_bytes.len(),
                });
            }
            let mut sig = [0u8; 64];
            sig.copy_from_slice(&signature_bytes);
            verify_ed25519(&pki.public_key, entry_bytes, &sig)?;
            Ok(IntegrityVerdict::Pki(SignatureAlgorithmKind::Ed25519))
        },
        SignatureAlgorithm::RsaSha256 => {
            let public_key = RsaPublicKey::from_public_key_pem(&pki.public_key)
                .map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))?;
            let verifying_key = RsaVerifyingKey::<Sha256>::new(public_key);
            let signature = RsaSignature::try_from(signature_bytes.as_slice())
                .map_err(|e| CryptoError::InvalidSignatureEncoding(e.to_string()))?;
            verifying_key
                .verify(entry_bytes, &signature)
                .map_err(|_| CryptoError::SignatureVerificationFailed)?;
            Ok(IntegrityVerdict::Pki(SignatureAlgorithmKind::Rsa))
        },
    }
}

/// Parse a manifest `integrity` field from its raw JSON representation, detecting the
/// legacy-vs-PKI shape. Used by callers that receive integrity as `serde_json::Value`.
///
/// # Errors
///
/// Returns [`CryptoError::UnrecognizedFormat`] if the value is neither a string nor an
/// object matching [`PkiIntegrity`]'s shape.
pub fn parse_integrity(value: &serde_json::Value) -> CryptoResult<RawIntegrity> {
    serde_json::from_value(value.clone()).map_err(|_| CryptoError::UnrecognizedFormat)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keypair::Ed25519KeyPair;

    #[test]
    fn legacy_round_trip() {
        let entry = b"export const a=1;";
        let hash = LegacyHash::hash(entry);
        let integrity = RawIntegrity::Legacy(hash.to_hex());
        assert_eq!(
            verify_integrity(&integrity, entry).unwrap(),
            IntegrityVerdict::Legacy
        );
    }

    #[test]
    fn legacy_rejects_tamper() {
        let hash = LegacyHash::hash(b"export const a=1;");
        let integrity = RawIntegrity::Legacy(hash.to_hex());
        assert!(verify_integrity(&integrity, b"export const a=2;").is_err());
    }

    #[test]
    fn ed25519_pki_round_trip() {
        let keypair = Ed25519KeyPair::generate();
        let entry = b"export default function() {}";
        let crate::signature::Signature::Ed25519(sig_bytes) = keypair.sign(entry) else {
            unreachable!()
        };
        let integrity = RawIntegrity::Pki(PkiIntegrity {
            algorithm: "ed25519-sha256".into(),
            signature: base64::engine::general_purpose::STANDARD.encode(sig_bytes),
            public_key: keypair.public_key_pem(),
            author: None,
            timestamp: None,
        });
        assert_eq!(
            verify_integrity(&integrity, entry).unwrap(),
            IntegrityVerdict::Pki(SignatureAlgorithmKind::Ed25519)
        );
    }

    #[test]
    fn unrecognized_format_rejects() {
        let bad = serde_json::json!(12345);
        assert!(parse_integrity(&bad).is_err());
    }

    #[test]
    fn unsupported_algorithm_rejects() {
        let integrity = RawIntegrity::Pki(PkiIntegrity {
            algorithm: "dsa-sha1".into(),
            signature: "AAAA".into(),
            public_key: "garbage".into(),
            author: None,
            timestamp: None,
        });
        assert!(verify_integrity(&integrity, b"x").is_err());
    }
}
