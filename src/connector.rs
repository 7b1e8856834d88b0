//! Opens sessions: resolve the credential, build an adapter, connect.
//!
//! The credential is resolved again for every attempt so a rotated secret
//! is picked up by the next reconnect.

use crate::config::{snapshot, SharedConfig};
use crate::error::{OrchestratorError, OrchestratorResult};
use knock_core::{DeviceDescriptor, RetryPolicy, SessionFactory, SessionKey, SessionRef};
use knock_vault::CredentialVault;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct Connector {
    factory: Arc<dyn SessionFactory>,
    vault: CredentialVault,
    config: SharedConfig,
}

impl Connector {
    pub fn new(factory: Arc<dyn SessionFactory>, vault: CredentialVault, config: SharedConfig) -> Self {
        Self { factory, vault, config }
    }

    pub fn retry_policy(&self, key: &SessionKey) -> RetryPolicy {
        snapshot(&self.config).retry_policy(key.protocol)
    }

    /// One connect attempt on a fresh session instance.
    pub async fn open_once(&self, key: &SessionKey, device: &DeviceDescriptor) -> OrchestratorResult<SessionRef> {
        let credential = self.vault.resolve(&key.device_id, key.protocol).await?;
        let connect_timeout = snapshot(&self.config).connect_timeout();
        let session = self.factory.create(key);
        debug!(key = %key, endpoint = %device.endpoint(key.protocol), "opening session");
        session
            .open(device, credential, connect_timeout)
            .await
            .map_err(OrchestratorError::ConnectFailed)?;
        info!(key = %key, "session ready");
        Ok(session)
    }

    /// Initial connect: transient failures are retried with the protocol's
    /// backoff, anything else fails at once.
    pub async fn open_with_retry(&self, key: &SessionKey, device: &DeviceDescriptor) -> OrchestratorResult<SessionRef> {
        let policy = self.retry_policy(key);
        let mut attempt = 1;
        loop {
            match self.open_once(key, device).await {
                Ok(session) => return Ok(session),
                Err(e) if e.is_transient_connect() && attempt < policy.max_attempts => {
                    let delay = policy.delay_for(attempt);
                    warn!(key = %key, attempt, ?delay, error = %e, "connect failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    warn!(key = %key, attempt, error = %e, "connect failed");
                    return Err(e);
                }
            }
        }
    }
}
