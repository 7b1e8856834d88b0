//! # knock-gate
//!
//! Sensitive operations must pass a fresh biometric prompt before any
//! session is touched. The prompt itself lives behind [`BiometricGate`];
//! the platform UI implements it.

pub mod gatekeeper;
pub mod prompt;

pub use gatekeeper::{GateError, GatePolicy, Gatekeeper, GrantToken};
pub use prompt::{BiometricGate, GateContext, GateDecision};
