//! FTP client and session adapter.
//!
//! Architecture:
//! - `error`: FTP-specific error type and its mapping to `SessionError`
//! - `protocol`: low-level command/response codec
//! - `parser`: Unix/Windows/MLSD LIST response parsing
//! - `transfer`: passive data channel (PASV/EPSV)
//! - `client`: stateful FTP client (login, FEAT, file/directory commands)
//! - `session`: `ProtocolSession` implementation
//! - `types`: reply and FEAT types

pub mod client;
pub mod error;
pub mod parser;
pub mod protocol;
pub mod session;
pub mod transfer;
pub mod types;

pub use client::FtpClient;
pub use error::{FtpError, FtpErrorKind, FtpResult};
pub use session::FtpSession;

#[cfg(test)]
pub(crate) mod fake_server;
