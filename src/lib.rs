//! # knockly
//!
//! Session orchestration for remote doorbell and camera devices. One
//! [`Orchestrator`] keeps at most one live FTP, SSH and RTSP session per
//! device, reconnects them with bounded backoff, puts a biometric prompt
//! in front of sensitive operations, and hands callers a cancellable
//! [`OperationHandle`] whatever protocol does the work.
//!
//! - `registry`: the session map with single-flight opens and idle eviction
//! - `supervisor`: per-key reconnect with backoff
//! - `orchestrator`: the façade
//! - `connector` / `factory`: credential resolution and adapter selection
//! - `config`, `logging`, `error`: ambient plumbing
//! - `push`, `discovery`: pre-warm hints and LAN scanning

pub mod config;
pub mod connector;
pub mod discovery;
pub mod error;
pub mod factory;
pub mod logging;
pub mod operation;
pub mod orchestrator;
pub mod push;
pub mod registry;
pub mod supervisor;

pub use config::{OrchestratorConfig, RetryPolicies, SharedConfig};
pub use error::{ConfigError, OrchestratorError, OrchestratorResult};
pub use factory::DefaultSessionFactory;
pub use logging::{init_logging, LogFormat};
pub use operation::{Operation, OperationHandle};
pub use orchestrator::Orchestrator;
pub use push::{PushEvent, PushHint};
pub use registry::SessionRegistry;
pub use supervisor::{ReconnectSupervisor, RecoveryStatus, SupervisorEvent};
