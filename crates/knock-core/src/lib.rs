//! # knock-core: shared session types
//!
//! - `types`: devices, credentials, session keys/states, retry policy
//! - `payload`: protocol-specific requests and results
//! - `error`: the uniform `SessionError` every adapter reports
//! - `state`: the session state machine cell
//! - `session`: the `ProtocolSession` interface and its helpers
//! - `directory`: the device registry boundary

pub mod directory;
pub mod error;
pub mod payload;
pub mod session;
pub mod state;
pub mod types;

pub use directory::{DeviceDirectory, DirectoryError, StaticDirectory};
pub use error::{SessionError, SessionErrorKind, SessionResult};
pub use payload::*;
pub use session::{ProtocolSession, SessionFactory, SessionRef};
pub use state::StateCell;
pub use types::*;

pub use tokio_util::sync::CancellationToken;
