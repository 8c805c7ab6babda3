//! Machine-bound key derivation: `PBKDF2-HMAC-SHA-512` over `hostname | username | saltSuffix`.

use hmac::Hmac;
use sha2::Sha512;

use crate::error::{StoreError, StoreResult};

/// PBKDF2 iteration count, fixed per spec.
const PBKDF2_ITERATIONS: u32 = 100_000;

/// Derived key length in bytes (AES-256 key).
const KEY_LEN: usize = 32;

/// The machine identity inputs the key is bound to.
#[derive(Debug, Clone)]
pub struct MachineIdentity {
    hostname: String,
    username: String,
}

impl MachineIdentity {
    /// Resolve the current machine's hostname and username.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NoMachineIdentity`] if neither can be resolved from the
    /// environment.
    pub fn current() -> StoreResult<Self> {
        let hostname = hostname_from_env();
        let username = username_from_env();
        if hostname.is_empty() && username.is_empty() {
            return Err(StoreError::NoMachineIdentity);
        }
        Ok(Self { hostname, username })
    }

    /// Construct an explicit identity (used in tests to pin derivation to known values).
    #[must_use]
    pub fn new(hostname: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            username: username.into(),
        }
    }
}

fn hostname_from_env() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| {
            std::fs::read_to_string("/etc/hostname")
                .map(|s| s.trim().to_string())
                .unwrap_or_default()
        })
}

fn username_from_env() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_default()
}

/// Derive a 32-byte AES-256-GCM key from the machine identity and a per-write salt.
///
/// `salt_suffix` is an additional caller-chosen disambiguator (e.g. the store file's
/// logical key name) mixed into the PBKDF2 salt alongside the random per-write salt, so
/// two different secrets on the same machine never share a derivation even if the random
/// salt collided.
#[must_use]
pub fn derive_key(identity: &MachineIdentity, salt_suffix: &str, random_salt: &[u8]) -> [u8; KEY_LEN] {
    let password = format!("{}|{}|{}", identity.hostname, identity.username, salt_suffix);
    let mut salt = Vec::with_capacity(random_salt.len() + salt_suffix.len());
    salt.extend_from_slice(random_salt);
    salt.extend_from_slice(salt_suffix.as_bytes());

    let mut key = [0u8; KEY_LEN];
    pbkdf2::pbkdf2::<Hmac<Sha512>>(password.as_bytes(), &salt, PBKDF2_ITERATIONS, &mut key)
        .expect("HMAC can be initialized with any key length");
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derivation_is_deterministic() {
        let identity = MachineIdentity::new("host-a", "alice");
        let salt = [1u8; 16];
        let k1 = derive_key(&identity, "creds.enc.json", &salt);
        let k2 = derive_key(&identity, "creds.enc.json", &salt);
        assert_eq!(k1, k2);
    }

    #[test]
    fn different_machine_differs() {
        let salt = [1u8; 16];
        let a = derive_key(&MachineIdentity::new("host-a", "alice"), "k", &salt);
        let b = derive_key(&MachineIdentity::new("host-b", "alice"), "k", &salt);
        assert_ne!(a, b);
    }

    #[test]
    fn different_salt_suffix_differs() {
        let identity = MachineIdentity::new("host-a", "alice");
        let salt = [1u8; 16];
        let a = derive_key(&identity, "key-one", &salt);
        let b = derive_key(&identity, "key-two", &salt);
        assert_ne!(a, b);
    }
}
