//! # knock-vault
//!
//! The only place device secrets are read. Nothing here caches: every
//! `resolve` goes back to the store, so rotated secrets take effect on the
//! next connect.

pub mod error;
pub mod store;
pub mod vault;

pub use error::{StoreError, VaultError};
pub use store::{InMemorySecretStore, JsonFileSecretStore, SecretStore};
pub use vault::CredentialVault;
