//! Secure credential store (C1): machine-bound AES-256-GCM encryption with a dual-layer
//! lock (in-process mutex + exclusive on-disk lock file) guarding every mutating
//! operation. Used by plugins (through the host) for credential persistence.

pub mod blob;
pub mod error;
pub mod key;
pub mod lock;
pub mod store;

pub use blob::EncryptedBlob;
pub use error::{StoreError, StoreResult};
pub use key::MachineIdentity;
pub use store::SecureStore;
