//! # knock-ssh
//!
//! SSH shell sessions for the device orchestrator. libssh2 is blocking, so
//! every wire call runs on tokio's blocking pool.

pub mod ssh;

pub use ssh::*;
