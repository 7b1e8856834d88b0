//! Uniform failure signal shared by every protocol session.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Categorised session error.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionError {
    pub kind: SessionErrorKind,
    pub message: String,
    /// Protocol reply/status code that triggered the error, if any.
    pub code: Option<u16>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SessionErrorKind {
    /// `open` did not finish within the connect timeout.
    ConnectTimeout,
    /// The device refused the credential.
    AuthRejected,
    /// DNS / TCP level failure reaching the device.
    NetworkUnreachable,
    /// The device answered with an error status.
    ProtocolError,
    /// The session is (or became) closed under the caller.
    SessionClosed,
    /// The caller's cancellation token fired.
    Cancelled,
    /// A request did not complete within the execute timeout.
    Timeout,
    /// Operation not valid in the current state (e.g. wrong payload type).
    InvalidState,
}

pub type SessionResult<T> = Result<T, SessionError>;

// ── Construction helpers ─────────────────────────────────────────────

impl SessionError {
    pub fn new(kind: SessionErrorKind, msg: impl Into<String>) -> Self {
        Self {
            kind,
            message: msg.into(),
            code: None,
        }
    }

    pub fn with_code(mut self, code: u16) -> Self {
        self.code = Some(code);
        self
    }

    pub fn connect_timeout(msg: impl Into<String>) -> Self {
        Self::new(SessionErrorKind::ConnectTimeout, msg)
    }

    pub fn auth_rejected(msg: impl Into<String>) -> Self {
        Self::new(SessionErrorKind::AuthRejected, msg)
    }

    pub fn unreachable(msg: impl Into<String>) -> Self {
        Self::new(SessionErrorKind::NetworkUnreachable, msg)
    }

    pub fn protocol(code: u16, msg: impl Into<String>) -> Self {
        Self::new(SessionErrorKind::ProtocolError, msg).with_code(code)
    }

    pub fn closed(msg: impl Into<String>) -> Self {
        Self::new(SessionErrorKind::SessionClosed, msg)
    }

    pub fn cancelled() -> Self {
        Self::new(SessionErrorKind::Cancelled, "operation cancelled")
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::new(SessionErrorKind::Timeout, msg)
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::new(SessionErrorKind::InvalidState, msg)
    }

    /// Failures worth another connect attempt.
    pub fn is_transient_connect(&self) -> bool {
        matches!(
            self.kind,
            SessionErrorKind::ConnectTimeout | SessionErrorKind::NetworkUnreachable
        )
    }

    /// Mid-session failures that mean the connection itself is gone.
    pub fn is_connection_loss(&self) -> bool {
        matches!(
            self.kind,
            SessionErrorKind::SessionClosed | SessionErrorKind::Timeout
        )
    }
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(code) = self.code {
            write!(f, "[{:?} {}] {}", self.kind, code, self.message)
        } else {
            write!(f, "[{:?}] {}", self.kind, self.message)
        }
    }
}

impl std::error::Error for SessionError {}

impl From<std::io::Error> for SessionError {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match e.kind() {
            ErrorKind::TimedOut => Self::timeout(format!("I/O timeout: {}", e)),
            ErrorKind::UnexpectedEof
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe => Self::closed(e.to_string()),
            _ => Self::unreachable(e.to_string()),
        }
    }
}
