use knock_core::Protocol;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("secret store unavailable: {0}")]
    Unavailable(String),
    #[error("secret store I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("no {protocol} credential stored for device {device_id}")]
    CredentialNotFound { device_id: String, protocol: Protocol },
    /// The reason never includes secret material.
    #[error("stored {protocol} credential for device {device_id} is malformed: {reason}")]
    Malformed {
        device_id: String,
        protocol: Protocol,
        reason: String,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}
