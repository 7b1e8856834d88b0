//! Shared device, credential and session identity types.

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

// ─── Protocol / Capability ───────────────────────────────────────────

/// Wire protocol backing a session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Ftp,
    Ssh,
    Rtsp,
}

impl Protocol {
    pub const ALL: [Protocol; 3] = [Protocol::Ftp, Protocol::Ssh, Protocol::Rtsp];

    /// Well-known port used when a descriptor carries no override.
    pub fn default_port(self) -> u16 {
        match self {
            Protocol::Ftp => 21,
            Protocol::Ssh => 22,
            Protocol::Rtsp => 8554,
        }
    }

    /// The capability this protocol provides.
    pub fn capability(self) -> Capability {
        match self {
            Protocol::Ftp => Capability::FileTransfer,
            Protocol::Ssh => Capability::Shell,
            Protocol::Rtsp => Capability::Stream,
        }
    }

    /// FTP and SSH carry one request at a time on the wire.
    pub fn is_sequential(self) -> bool {
        !matches!(self, Protocol::Rtsp)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Protocol::Ftp => "ftp",
            Protocol::Ssh => "ssh",
            Protocol::Rtsp => "rtsp",
        };
        f.write_str(s)
    }
}

/// What a caller wants to do with a device.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "camelCase")]
pub enum Capability {
    FileTransfer,
    Shell,
    Stream,
}

impl Capability {
    pub fn protocol(self) -> Protocol {
        match self {
            Capability::FileTransfer => Protocol::Ftp,
            Capability::Shell => Protocol::Ssh,
            Capability::Stream => Protocol::Rtsp,
        }
    }
}

// ─── Device ──────────────────────────────────────────────────────────

/// A remote device as loaded from the external device registry.
///
/// Immutable once loaded; refreshed only by an explicit re-sync.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeviceDescriptor {
    pub device_id: String,
    /// Host name or IP address.
    pub address: String,
    /// Per-protocol port overrides.
    #[serde(default)]
    pub ports: BTreeMap<Protocol, u16>,
    #[serde(default)]
    pub capabilities: BTreeSet<Capability>,
    /// Friendly label shown to the user.
    #[serde(default)]
    pub label: Option<String>,
}

impl DeviceDescriptor {
    pub fn new(device_id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            address: address.into(),
            ports: BTreeMap::new(),
            capabilities: BTreeSet::new(),
            label: None,
        }
    }

    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.capabilities.insert(capability);
        self
    }

    pub fn with_port(mut self, protocol: Protocol, port: u16) -> Self {
        self.ports.insert(protocol, port);
        self
    }

    pub fn supports(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    pub fn port_for(&self, protocol: Protocol) -> u16 {
        self.ports
            .get(&protocol)
            .copied()
            .unwrap_or_else(|| protocol.default_port())
    }

    /// `host:port` for the given protocol.
    pub fn endpoint(&self, protocol: Protocol) -> String {
        format!("{}:{}", self.address, self.port_for(protocol))
    }
}

// ─── Credential ──────────────────────────────────────────────────────

/// Connection credential for one (device, protocol) pair.
///
/// Moved into `ProtocolSession::open` by value; the secret is zeroised when
/// the credential is dropped at the end of that call.
pub struct Credential {
    pub protocol: Protocol,
    pub username: String,
    pub secret: SecretString,
}

impl Credential {
    pub fn new(protocol: Protocol, username: impl Into<String>, secret: SecretString) -> Self {
        Self {
            protocol,
            username: username.into(),
            secret,
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("protocol", &self.protocol)
            .field("username", &self.username)
            .field("secret", &"[redacted]")
            .finish()
    }
}

// ─── Session identity / state ────────────────────────────────────────

/// Unique identity of a live session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "camelCase")]
pub struct SessionKey {
    pub device_id: String,
    pub protocol: Protocol,
}

impl SessionKey {
    pub fn new(device_id: impl Into<String>, protocol: Protocol) -> Self {
        Self {
            device_id: device_id.into(),
            protocol,
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.device_id, self.protocol)
    }
}

/// Lifecycle state of a protocol session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    Idle,
    Connecting,
    Ready,
    Degraded,
    Closing,
    Closed,
    Failed,
}

impl SessionState {
    /// Closed and Failed are final for a session instance.
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }

    /// Whether the state machine permits `self -> next`.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            // close() is always allowed from a live state.
            (_, Closing) | (_, Closed) => true,
            (Idle, Connecting) => true,
            (Connecting, Ready) | (Connecting, Failed) => true,
            (Ready, Degraded) | (Ready, Failed) => true,
            (Degraded, Ready) | (Degraded, Failed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// ─── Retry policy ────────────────────────────────────────────────────

/// Bounded exponential backoff for (re)connecting one protocol.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub max_backoff_ms: u64,
}

impl RetryPolicy {
    pub fn for_protocol(protocol: Protocol) -> Self {
        match protocol {
            Protocol::Ftp | Protocol::Ssh => Self {
                max_attempts: 3,
                base_backoff_ms: 500,
                backoff_multiplier: 2.0,
                max_backoff_ms: 10_000,
            },
            Protocol::Rtsp => Self {
                max_attempts: 5,
                base_backoff_ms: 250,
                backoff_multiplier: 2.0,
                max_backoff_ms: 5_000,
            },
        }
    }

    /// Delay before the given 1-based attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63) as i32;
        let raw = self.base_backoff_ms as f64 * self.backoff_multiplier.powi(exp);
        let capped = raw.min(self.max_backoff_ms as f64);
        Duration::from_millis(capped as u64)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("maxAttempts must be at least 1".into());
        }
        if !(self.backoff_multiplier >= 1.0) {
            return Err("backoffMultiplier must be >= 1.0".into());
        }
        if self.max_backoff_ms < self.base_backoff_ms {
            return Err("maxBackoffMs must be >= baseBackoffMs".into());
        }
        Ok(())
    }
}
