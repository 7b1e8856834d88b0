//! RTSP/1.0 client (RFC 2326) over TCP.
//!
//! - `message`: request encoding and response parsing
//! - `auth`: Basic and Digest authorisation headers
//! - `connection`: CSeq-matched requests plus the interleaved-frame reader
//! - `session`: `ProtocolSession` implementation

pub mod auth;
pub mod connection;
pub mod message;
pub mod session;

pub use connection::RtspConnection;
pub use message::{RtspRequest, RtspResponse};
pub use session::{RtspSession, DEFAULT_STREAM_PATH};

#[cfg(test)]
pub(crate) mod fake_server;
