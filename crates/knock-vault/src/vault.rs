//! Credential Vault Adapter.

use crate::error::VaultError;
use crate::store::SecretStore;
use knock_core::{Credential, Protocol};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::sync::Arc;

#[derive(Deserialize)]
struct StoredCredential {
    #[serde(default)]
    username: String,
    password: SecretString,
}

#[derive(Clone)]
pub struct CredentialVault {
    store: Arc<dyn SecretStore>,
}

impl CredentialVault {
    pub fn new(store: Arc<dyn SecretStore>) -> Self {
        Self { store }
    }

    /// Fetch and decode the credential for one device and protocol.
    /// Always hits the store.
    pub async fn resolve(&self, device_id: &str, protocol: Protocol) -> Result<Credential, VaultError> {
        let blob = self
            .store
            .get(device_id, protocol)
            .await?
            .ok_or_else(|| VaultError::CredentialNotFound {
                device_id: device_id.to_string(),
                protocol,
            })?;

        let stored: StoredCredential =
            serde_json::from_str(blob.expose_secret()).map_err(|e| VaultError::Malformed {
                device_id: device_id.to_string(),
                protocol,
                reason: format!("{:?} error at column {}", e.classify(), e.column()),
            })?;

        log::debug!("resolved {} credential for {}", protocol, device_id);
        Ok(Credential::new(protocol, stored.username, stored.password))
    }

    /// Whether a credential is stored, without decoding it.
    pub async fn contains(&self, device_id: &str, protocol: Protocol) -> Result<bool, VaultError> {
        Ok(self.store.get(device_id, protocol).await?.is_some())
    }
}
