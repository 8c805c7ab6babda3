//! Legacy SHA-512 content hash (the "128 lowercase hex characters" integrity format).

use sha2::{Digest, Sha512};
use std::fmt;

use crate::error::{CryptoError, CryptoResult};

/// A SHA-512 content hash, encoded as 128 lowercase hex characters on the wire.
///
/// This is the "legacy" integrity format: a plugin manifest's `integrity` field that is
/// exactly 128 lowercase hex characters is interpreted as the SHA-512 digest of the
/// plugin's entry file.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct LegacyHash([u8; 64]);

impl LegacyHash {
    /// Hash the given bytes.
    #[must_use]
    pub fn hash(data: &[u8]) -> Self {
        let digest = Sha512::digest(data);
        let mut bytes = [0u8; 64];
        bytes.copy_from_slice(&digest);
        Self(bytes)
    }

    /// Parse a hash from its 128-lowercase-hex-character wire form.
    ///
    /// Returns `None` if the string is not exactly 128 characters or is not lowercase
    /// hex — callers use this to *detect* the legacy format before attempting PKI
    /// parsing, so a non-match must not be an error.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        if s.len() != 128 || !s.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()) {
            return None;
        }
        let bytes = hex::decode(s).ok()?;
        let mut out = [0u8; 64];
        out.copy_from_slice(&bytes);
        Some(Self(out))
    }

    /// Encode as the 128-lowercase-hex-character wire form.
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Verify that this hash matches the hash of `data`.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::HashMismatch`] if the digests differ.
    pub fn verify(&self, data: &[u8]) -> CryptoResult<()> {
        if *self == Self::hash(data) {
            Ok(())
        } else {
            Err(CryptoError::HashMismatch)
        }
    }
}

impl fmt::Debug for LegacyHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LegacyHash({}…)", &self.to_hex()[..16])
    }
}

impl fmt::Display for LegacyHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let hash = LegacyHash::hash(b"export const a=1;");
        let hex = hash.to_hex();
        assert_eq!(hex.len(), 128);
        assert_eq!(LegacyHash::parse(&hex), Some(hash));
    }

    #[test]
    fn verify_matches() {
        let hash = LegacyHash::hash(b"export const a=1;");
        assert!(hash.verify(b"export const a=1;").is_ok());
    }

    #[test]
    fn verify_rejects_one_byte_change() {
        let hash = LegacyHash::hash(b"export const a=1;");
        assert!(hash.verify(b"export const a=2;").is_err());
    }

    #[test]
    fn parse_rejects_wrong_length() {
        assert!(LegacyHash::parse("abc").is_none());
        assert!(LegacyHash::parse(&"a".repeat(127)).is_none());
        assert!(LegacyHash::parse(&"a".repeat(129)).is_none());
    }

    #[test]
    fn parse_rejects_uppercase() {
        let hash = LegacyHash::hash(b"data");
        let upper = hash.to_hex().to_uppercase();
        assert!(LegacyHash::parse(&upper).is_none());
    }

    #[test]
    fn parse_rejects_non_hex() {
        assert!(LegacyHash::parse(&"g".repeat(128)).is_none());
    }
}
