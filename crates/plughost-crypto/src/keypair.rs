//! Ed25519 key pairs, used for the PKI integrity format's `ed25519-sha256` algorithm.

use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{CryptoError, CryptoResult};
use crate::signature::Signature;

/// An Ed25519 key pair. The secret key is zeroized on drop.
#[derive(ZeroizeOnDrop)]
pub struct Ed25519KeyPair {
    #[zeroize(skip)] // VerifyingKey doesn't implement Zeroize
    verifying_key: VerifyingKey,
    signing_key: SigningKey,
}

impl Ed25519KeyPair {
    /// Generate a new random key pair.
    #[must_use]
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let verifying_key = signing_key.verifying_key();
        Self {
            verifying_key,
            signing_key,
        }
    }

    /// Create from a 32-byte secret key.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKeyLength`] if `bytes` is not exactly 32 bytes.
    pub fn from_secret_key(bytes: &[u8]) -> CryptoResult<Self> {
        if bytes.len() != 32 {
            return Err(CryptoError::InvalidKeyLength {
                expected: 32,
                actual: bytes.len(),
            });
        }
        let mut secret = [0u8; 32];
        secret.copy_from_slice(bytes);
        let signing_key = SigningKey::from_bytes(&secret);
        let verifying_key = signing_key.verifying_key();
        secret.zeroize();
        Ok(Self {
            verifying_key,
            signing_key,
        })
    }

    /// The raw 32-byte public key.
    #[must_use]
    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.verifying_key.to_bytes()
    }

    /// PEM-encode the public key, matching the manifest's `publicKey` field format.
    #[must_use]
    pub fn public_key_pem(&self) -> String {
        // Ed25519 SubjectPublicKeyInfo DER prefix for raw 32-byte keys (RFC 8410).
        const SPKI_PREFIX: [u8; 12] = [
            0x30, 0x2a, 0x30, 0x05, 0x06, 0x03, 0x2b, 0x65, 0x70, 0x03, 0x21, 0x00,
        ];
        let mut der = Vec::with_capacity(SPKI_PREFIX.len() + 32);
        der.extend_from_slice(&SPKI_PREFIX);
        der.extend_from_slice(&self.public_key_bytes());
        pem_encode("PUBLIC KEY", &der)
    }

    /// Sign a detached message (raw Ed25519 primitive, no prehashing).
    #[must_use]
    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature::Ed25519(self.signing_key.sign(message).to_bytes())
    }
}

/// Verify a raw Ed25519 signature against a PEM-encoded (or raw 32-byte DER-wrapped)
/// public key.
///
/// # Errors
///
/// Returns [`CryptoError::InvalidPublicKey`] if the key cannot be parsed, or
/// [`CryptoError::SignatureVerificationFailed`] if verification fails.
pub fn verify_ed25519(public_key_pem: &str, message: &[u8], signature: &[u8; 64]) -> CryptoResult<()> {
    use ed25519_dalek::Verifier;

    let der = pem_decode(public_key_pem)
        .ok_or_else(|| CryptoError::InvalidPublicKey("not valid PEM".into()))?;
    // Raw key is the last 32 bytes of the SPKI DER structure.
    if der.len() < 32 {
        return Err(CryptoError::InvalidPublicKey("DER payload too short".into()));
    }
    let raw = &der[der.len() - 32..];
    let mut key_bytes = [0u8; 32];
    key_bytes.copy_from_slice(raw);
    let verifying_key = VerifyingKey::from_bytes(&key_bytes)
        .map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))?;
    let sig = ed25519_dalek::Signature::from_bytes(signature);
    verifying_key
        .verify(message, &sig)
        .map_err(|_| CryptoError::SignatureVerificationFailed)
}

fn pem_encode(label: &str, der: &[u8]) -> String {
    use base64::Engine;
    let b64 = base64::engine::general_purpose::STANDARD.encode(der);
    let mut out = format!("-----BEGIN {label}-----\n");
    for chunk in b64.as_bytes().chunks(64) {
        out.push_str(std::str::from_utf8(chunk).unwrap_or_default());
        out.push('\n');
    }
    out.push_str(&format!("-----END {label}-----\n"));
    out
}

fn pem_decode(pem: &str) -> Option<Vec<u8>> {
    use base64::Engine;
    let body: String = pem
        .lines()
        .filter(|l| !l.starts_with("-----"))
        .collect::<Vec<_>>()
        .join("");
    base64::engine::general_purpose::STANDARD
        .decode(body.trim())
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify_round_trip() {
        let keypair = Ed25519KeyPair::generate();
        let message = b"important data";
        let Signature::Ed25519(sig) = keypair.sign(message) else {
            unreachable!()
        };
        assert!(verify_ed25519(&keypair.public_key_pem(), message, &sig).is_ok());
    }

    #[test]
    fn verify_rejects_tampered_message() {
        let keypair = Ed25519KeyPair::generate();
        let Signature::Ed25519(sig) = keypair.sign(b"original") else {
            unreachable!()
        };
        assert!(verify_ed25519(&keypair.public_key_pem(), b"tampered", &sig).is_err());
    }

    #[test]
    fn from_secret_key_rejects_wrong_length() {
        assert!(Ed25519KeyPair::from_secret_key(&[0u8; 16]).is_err());
    }
}
