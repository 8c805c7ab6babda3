//! On-disk encrypted blob format: `{iv, tag, salt, ciphertext}`, all printable.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::Engine;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};
use crate::key::{derive_key, MachineIdentity};

/// 96-bit GCM nonce.
const IV_LEN: usize = 12;
/// Random per-write salt length.
const SALT_LEN: usize = 16;

/// The on-disk JSON shape of an encrypted secret: `{iv: hex, tag: hex, salt: hex, data:
/// base64}` per the external-interfaces section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedBlob {
    /// Hex-encoded 96-bit nonce.
    pub iv: String,
    /// Hex-encoded 16-byte GCM authentication tag.
    pub tag: String,
    /// Hex-encoded 16-byte PBKDF2 salt.
    pub salt: String,
    /// Base64-encoded ciphertext (tag-stripped; the tag travels separately in `tag`).
    pub data: String,
}

impl EncryptedBlob {
    /// Encrypt `plaintext` under a key derived from `identity` and `salt_suffix`,
    /// generating a fresh random salt and nonce.
    #[must_use]
    pub fn seal(plaintext: &[u8], identity: &MachineIdentity, salt_suffix: &str) -> Self {
        let mut salt = [0u8; SALT_LEN];
        rand::thread_rng().fill_bytes(&mut salt);
        let mut iv = [0u8; IV_LEN];
        rand::thread_rng().fill_bytes(&mut iv);

        let key_bytes = derive_key(identity, salt_suffix, &salt);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_bytes));
        let nonce = Nonce::from_slice(&iv);

        // aes-gcm appends the 16-byte tag to the ciphertext; split it back out so the
        // wire format matches the spec's separate `tag` field.
        let sealed = cipher
            .encrypt(nonce, Payload { msg: plaintext, aad: &[] })
            .expect("AES-256-GCM encryption does not fail for in-memory payloads");
        let tag_offset = sealed.len() - 16;
        let (ciphertext, tag) = sealed.split_at(tag_offset);

        Self {
            iv: hex::encode(iv),
            tag: hex::encode(tag),
            salt: hex::encode(salt),
            data: base64::engine::general_purpose::STANDARD.encode(ciphertext),
        }
    }

    /// Decrypt this blob using the given machine identity and salt suffix.
    ///
    /// Returns `Ok(None)` on authentication-tag failure (the spec treats a corrupt or
    /// foreign-machine ciphertext as "missing", not as a hard error) — callers are
    /// expected to then delete the ciphertext.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the hex/base64 encodings themselves are malformed
    /// (a structurally broken file, distinct from an auth-tag mismatch).
    pub fn open(&self, identity: &MachineIdentity, salt_suffix: &str) -> StoreResult<Option<Vec<u8>>> {
        let iv = hex::decode(&self.iv).map_err(|_| StoreError::MalformedPayload(salt_suffix.into()))?;
        let tag = hex::decode(&self.tag).map_err(|_| StoreError::MalformedPayload(salt_suffix.into()))?;
        let salt = hex::decode(&self.salt).map_err(|_| StoreError::MalformedPayload(salt_suffix.into()))?;
        let ciphertext = base64::engine::general_purpose::STANDARD
            .decode(&self.data)
            .map_err(|_| StoreError::MalformedPayload(salt_suffix.into()))?;

        if iv.len() != IV_LEN || tag.len() != 16 || salt.len() != SALT_LEN {
            return Err(StoreError::MalformedPayload(salt_suffix.into()));
        }

        let key_bytes = derive_key(identity, salt_suffix, &salt);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_bytes));
        let nonce = Nonce::from_slice(&iv);

        let mut sealed = ciphertext;
        sealed.extend_from_slice(&tag);

        match cipher.decrypt(nonce, Payload { msg: &sealed, aad: &[] }) {
            Ok(plaintext) => Ok(Some(plaintext)),
            Err(_) => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_round_trip() {
        let identity = MachineIdentity::new("host-a", "alice");
        let blob = EncryptedBlob::seal(b"{\"apiKey\":\"sk-abc\"}", &identity, "creds.enc.json");
        let opened = blob.open(&identity, "creds.enc.json").unwrap();
        assert_eq!(opened, Some(b"{\"apiKey\":\"sk-abc\"}".to_vec()));
    }

    #[test]
    fn wrong_identity_returns_none() {
        let writer = MachineIdentity::new("host-a", "alice");
        let reader = MachineIdentity::new("host-b", "mallory");
        let blob = EncryptedBlob::seal(b"secret", &writer, "creds.enc.json");
        assert_eq!(blob.open(&reader, "creds.enc.json").unwrap(), None);
    }

    #[test]
    fn tampered_tag_returns_none() {
        let identity = MachineIdentity::new("host-a", "alice");
        let mut blob = EncryptedBlob::seal(b"secret", &identity, "k");
        blob.tag = hex::encode([0u8; 16]);
        assert_eq!(blob.open(&identity, "k").unwrap(), None);
    }
}
