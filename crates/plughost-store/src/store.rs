//! Secure credential store (C1): `read`, `write`, `delete`, `readSecure`, `writeSecure`.

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::warn;

use crate::blob::EncryptedBlob;
use crate::error::{StoreError, StoreResult};
use crate::key::MachineIdentity;
use crate::lock::{self, DEFAULT_RETRY, DEFAULT_STALE, DEFAULT_TIMEOUT};

/// A machine-bound, dual-locked secure store rooted at a directory.
///
/// Plain `read`/`write`/`delete` operate on JSON files as-is (used for non-secret plugin
/// state); `readSecure`/`writeSecure` additionally encrypt the payload at rest.
pub struct SecureStore {
    root: PathBuf,
    identity: MachineIdentity,
    timeout: Duration,
    retry: Duration,
    stale: Duration,
}

impl SecureStore {
    /// Open a store rooted at `root`, resolving the machine identity from the
    /// environment.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NoMachineIdentity`] if neither hostname nor username can be
    /// resolved.
    pub fn open(root: impl Into<PathBuf>) -> StoreResult<Self> {
        Ok(Self {
            root: root.into(),
            identity: MachineIdentity::current()?,
            timeout: DEFAULT_TIMEOUT,
            retry: DEFAULT_RETRY,
            stale: DEFAULT_STALE,
        })
    }

    /// Open a store with an explicit machine identity (tests, or cross-machine
    /// simulation).
    #[must_use]
    pub fn with_identity(root: impl Into<PathBuf>, identity: MachineIdentity) -> Self {
        Self {
            root: root.into(),
            identity,
            timeout: DEFAULT_TIMEOUT,
            retry: DEFAULT_RETRY,
            stale: DEFAULT_STALE,
        }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    /// Read a plaintext JSON value. Returns `None` if the key does not exist.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] on I/O failure or malformed JSON.
    pub fn read(&self, key: &str) -> StoreResult<Option<serde_json::Value>> {
        let path = self.path_for(key);
        match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|_| StoreError::MalformedPayload(path)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::Io { path, source: e }),
        }
    }

    /// Write a plaintext JSON value atomically, under the dual-layer lock.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] on lock timeout or I/O failure.
    pub fn write(&self, key: &str, value: &serde_json::Value) -> StoreResult<()> {
        let path = self.path_for(key);
        let _guard = lock::acquire(&path, self.timeout, self.retry, self.stale)?;
        let bytes = serde_json::to_vec_pretty(value).unwrap_or_default();
        atomic_write(&path, &bytes)
    }

    /// Delete a key (secure or plain), under the dual-layer lock. A missing key is not
    /// an error.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] on lock timeout.
    pub fn delete(&self, key: &str) -> StoreResult<()> {
        let path = self.path_for(key);
        let _guard = lock::acquire(&path, self.timeout, self.retry, self.stale)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::Io { path, source: e }),
        }
    }

    /// Read and decrypt a secure value.
    ///
    /// If the on-disk payload is legacy plaintext JSON (no `iv`/`tag`/`salt`/`data`
    /// shape), it is transparently migrated: re-encrypted and written back under the
    /// lock, then the plaintext value is returned.
    ///
    /// Returns `Ok(None)` if the key does not exist, or if the stored ciphertext fails
    /// authentication (corrupt or written on a different machine) — that case is
    /// treated as absent data, not an error, after deleting the bad ciphertext.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] on lock timeout or structurally malformed payloads.
    pub fn read_secure(&self, key: &str) -> StoreResult<Option<serde_json::Value>> {
        let path = self.path_for(key);
        let bytes = match std::fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::Io { path, source: e }),
        };

        let value: serde_json::Value =
            serde_json::from_slice(&bytes).map_err(|_| StoreError::MalformedPayload(path.clone()))?;

        if let Ok(blob) = serde_json::from_value::<EncryptedBlob>(value.clone()) {
            return match blob.open(&self.identity, key)? {
                Some(plaintext) => {
                    let parsed = serde_json::from_slice(&plaintext)
                        .map_err(|_| StoreError::MalformedPayload(path.clone()))?;
                    Ok(Some(parsed))
                },
                None => {
                    warn!(key, "secure store: authentication failed, treating as absent and deleting ciphertext");
                    let _guard = lock::acquire(&path, self.timeout, self.retry, self.stale)?;
                    let _ = std::fs::remove_file(&path);
                    Ok(None)
                },
            };
        }

        // Legacy plaintext JSON: migrate in place.
        warn!(key, "secure store: migrating legacy plaintext payload to encrypted form");
        self.write_secure(key, &value)?;
        Ok(Some(value))
    }

    /// Encrypt and write a secure value atomically, under the dual-layer lock.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] on lock timeout or I/O failure.
    pub fn write_secure(&self, key: &str, value: &serde_json::Value) -> StoreResult<()> {
        let path = self.path_for(key);
        let _guard = lock::acquire(&path, self.timeout, self.retry, self.stale)?;
        let plaintext = serde_json::to_vec(value).unwrap_or_default();
        let blob = EncryptedBlob::seal(&plaintext, &self.identity, key);
        let bytes = serde_json::to_vec_pretty(&blob).unwrap_or_default();
        atomic_write(&path, &bytes)
    }
}

/// Write-through-temp-file-then-rename, then owner-only permissions. A concurrent reader
/// observes either the previous file or the fully-written new one, never a partial write.
fn atomic_write(path: &Path, bytes: &[u8]) -> StoreResult<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent).map_err(|e| StoreError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;

    let mut tmp = tempfile::NamedTempFile::new_in(parent).map_err(|e| StoreError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    tmp.write_all(bytes).map_err(|e| StoreError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    tmp.as_file().sync_all().map_err(|e| StoreError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;

    set_owner_only(tmp.path());

    tmp.persist(path).map_err(|e| StoreError::Io {
        path: path.to_path_buf(),
        source: e.error,
    })?;
    Ok(())
}

#[cfg(unix)]
fn set_owner_only(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600));
}

#[cfg(not(unix))]
fn set_owner_only(_path: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(dir: &Path) -> SecureStore {
        SecureStore::with_identity(dir, MachineIdentity::new("host-a", "alice"))
    }

    #[test]
    fn write_secure_then_read_secure_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let value = serde_json::json!({"apiKey": "sk-abc"});
        store.write_secure("creds.enc.json", &value).unwrap();
        let read_back = store.read_secure("creds.enc.json").unwrap();
        assert_eq!(read_back, Some(value));
    }

    #[test]
    fn read_secure_on_different_machine_returns_none_and_deletes() {
        let dir = tempfile::tempdir().unwrap();
        let writer = store(dir.path());
        writer
            .write_secure("creds.enc.json", &serde_json::json!({"apiKey": "sk-abc"}))
            .unwrap();

        let reader = SecureStore::with_identity(dir.path(), MachineIdentity::new("host-b", "mallory"));
        let read_back = reader.read_secure("creds.enc.json").unwrap();
        assert_eq!(read_back, None);
        assert!(!dir.path().join("creds.enc.json").exists());
    }

    #[test]
    fn read_secure_migrates_legacy_plaintext() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let path = dir.path().join("legacy.json");
        std::fs::write(&path, serde_json::to_vec(&serde_json::json!({"token": "t"})).unwrap()).unwrap();

        let read_back = store.read_secure("legacy.json").unwrap();
        assert_eq!(read_back, Some(serde_json::json!({"token": "t"})));

        // Now on disk as an encrypted blob.
        let bytes = std::fs::read(&path).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert!(value.get("iv").is_some());
    }

    #[test]
    fn delete_missing_key_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        store.delete("nope.json").unwrap();
    }

    #[test]
    fn plain_write_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let value = serde_json::json!({"setting": true});
        store.write("config.json", &value).unwrap();
        assert_eq!(store.read("config.json").unwrap(), Some(value));
    }
}
