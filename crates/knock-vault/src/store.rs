//! Secret store boundary and the two stores shipped with the crate.
//!
//! A stored secret is an opaque blob; [`crate::CredentialVault`] decodes it
//! as `{"username": "...", "password": "..."}`.

use crate::error::StoreError;
use async_trait::async_trait;
use knock_core::Protocol;
use secrecy::SecretString;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;

#[async_trait]
pub trait SecretStore: Send + Sync {
    /// The blob stored for `device_id` and `protocol`, if any.
    async fn get(&self, device_id: &str, protocol: Protocol) -> Result<Option<SecretString>, StoreError>;
}

/// Process-local store, for embedding and tests.
#[derive(Default)]
pub struct InMemorySecretStore {
    entries: RwLock<HashMap<(String, Protocol), String>>,
}

impl InMemorySecretStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a raw blob, replacing any previous one.
    pub fn insert_blob(&self, device_id: &str, protocol: Protocol, blob: impl Into<String>) {
        self.entries
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert((device_id.to_string(), protocol), blob.into());
    }

    pub fn insert(&self, device_id: &str, protocol: Protocol, username: &str, password: &str) {
        let blob = serde_json::json!({ "username": username, "password": password }).to_string();
        self.insert_blob(device_id, protocol, blob);
    }

    pub fn remove(&self, device_id: &str, protocol: Protocol) {
        self.entries
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&(device_id.to_string(), protocol));
    }
}

#[async_trait]
impl SecretStore for InMemorySecretStore {
    async fn get(&self, device_id: &str, protocol: Protocol) -> Result<Option<SecretString>, StoreError> {
        let entries = self.entries.read().unwrap_or_else(|p| p.into_inner());
        Ok(entries
            .get(&(device_id.to_string(), protocol))
            .map(|blob| SecretString::new(blob.clone())))
    }
}

/// JSON file keyed by device then protocol, re-read on every lookup:
///
/// ```json
/// { "D1": { "ftp": { "username": "pi", "password": "..." } } }
/// ```
pub struct JsonFileSecretStore {
    path: PathBuf,
}

impl JsonFileSecretStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl SecretStore for JsonFileSecretStore {
    async fn get(&self, device_id: &str, protocol: Protocol) -> Result<Option<SecretString>, StoreError> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::debug!("secret file {} does not exist", self.path.display());
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        let doc: serde_json::Value = serde_json::from_str(&raw).map_err(|e| {
            StoreError::Unavailable(format!(
                "{} is not valid JSON ({:?} error at line {})",
                self.path.display(),
                e.classify(),
                e.line()
            ))
        })?;
        Ok(doc
            .get(device_id)
            .and_then(|d| d.get(protocol.to_string()))
            .map(|entry| SecretString::new(entry.to_string())))
    }
}
