//! Biometric prompt boundary.

use async_trait::async_trait;
use knock_core::Protocol;
use serde::Serialize;

/// What the user is shown when asked to confirm.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GateContext {
    pub operation_id: String,
    pub device_id: String,
    pub protocol: Protocol,
    /// Human-readable description, e.g. `delete-file /clips/a.mp4`.
    pub summary: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Granted,
    Denied,
}

#[async_trait]
pub trait BiometricGate: Send + Sync {
    /// Show the prompt and wait for the user. Dismissal counts as `Denied`.
    async fn prompt_and_wait(&self, context: &GateContext) -> GateDecision;
}
