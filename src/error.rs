//! Caller-facing error taxonomy.
//!
//! Every lower layer (vault, gate, protocol session, registry) is folded
//! into [`OrchestratorError`] so callers never match on protocol types.

use knock_core::{Capability, SessionError, SessionErrorKind};
use knock_gate::GateError;
use knock_vault::VaultError;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum OrchestratorError {
    #[error("device {0} is not known to the device registry")]
    DeviceUnknown(String),

    #[error("device {device_id} does not offer {capability:?}")]
    CapabilityUnsupported {
        device_id: String,
        capability: Capability,
    },

    #[error("credential unavailable: {0}")]
    CredentialUnavailable(String),

    #[error("operation denied at the biometric prompt")]
    AuthorizationDenied,

    #[error("biometric prompt timed out")]
    AuthorizationTimeout,

    #[error("connect failed: {0}")]
    ConnectFailed(SessionError),

    #[error("session unavailable: {0}")]
    SessionUnavailable(String),

    #[error("operation cancelled")]
    OperationCancelled,

    #[error("device reported a protocol fault ({}): {message}", code.map(|c| c.to_string()).unwrap_or_else(|| "no code".into()))]
    ProtocolFault { code: Option<u16>, message: String },

    #[error("orchestrator is shutting down")]
    ShuttingDown,
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

impl OrchestratorError {
    /// Classify a failure reported by `ProtocolSession::execute` once
    /// reconnection has been ruled out.
    pub fn from_execute(err: SessionError) -> Self {
        match err.kind {
            SessionErrorKind::Cancelled => OrchestratorError::OperationCancelled,
            SessionErrorKind::ProtocolError | SessionErrorKind::InvalidState => {
                OrchestratorError::ProtocolFault {
                    code: err.code,
                    message: err.message,
                }
            }
            SessionErrorKind::SessionClosed | SessionErrorKind::Timeout => {
                OrchestratorError::SessionUnavailable(err.message)
            }
            SessionErrorKind::ConnectTimeout
            | SessionErrorKind::AuthRejected
            | SessionErrorKind::NetworkUnreachable => OrchestratorError::ConnectFailed(err),
        }
    }

    /// Connect failures worth another attempt with backoff.
    pub fn is_transient_connect(&self) -> bool {
        matches!(self, OrchestratorError::ConnectFailed(e) if e.is_transient_connect())
    }
}

impl From<VaultError> for OrchestratorError {
    fn from(e: VaultError) -> Self {
        OrchestratorError::CredentialUnavailable(e.to_string())
    }
}

impl From<GateError> for OrchestratorError {
    fn from(e: GateError) -> Self {
        match e {
            GateError::Denied | GateError::TokenMismatch { .. } => OrchestratorError::AuthorizationDenied,
            GateError::Timeout(_) => OrchestratorError::AuthorizationTimeout,
            GateError::Cancelled => OrchestratorError::OperationCancelled,
        }
    }
}

// ─── Configuration errors ────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}
