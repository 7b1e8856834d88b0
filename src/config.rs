//! Orchestrator configuration (JSON, camelCase).

use crate::error::ConfigError;
use knock_core::{Protocol, RetryPolicy};
use knock_gate::GatePolicy;
use knock_rtsp::DEFAULT_STREAM_PATH;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Configuration shared between the façade and the session factory; a
/// `configure` call swaps the whole value.
pub type SharedConfig = Arc<RwLock<OrchestratorConfig>>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicies {
    #[serde(default = "default_ftp_retry")]
    pub ftp: RetryPolicy,
    #[serde(default = "default_ssh_retry")]
    pub ssh: RetryPolicy,
    #[serde(default = "default_rtsp_retry")]
    pub rtsp: RetryPolicy,
}

impl Default for RetryPolicies {
    fn default() -> Self {
        Self {
            ftp: default_ftp_retry(),
            ssh: default_ssh_retry(),
            rtsp: default_rtsp_retry(),
        }
    }
}

impl RetryPolicies {
    pub fn get(&self, protocol: Protocol) -> &RetryPolicy {
        match protocol {
            Protocol::Ftp => &self.ftp,
            Protocol::Ssh => &self.ssh,
            Protocol::Rtsp => &self.rtsp,
        }
    }
}

fn default_ftp_retry() -> RetryPolicy {
    RetryPolicy::for_protocol(Protocol::Ftp)
}
fn default_ssh_retry() -> RetryPolicy {
    RetryPolicy::for_protocol(Protocol::Ssh)
}
fn default_rtsp_retry() -> RetryPolicy {
    RetryPolicy::for_protocol(Protocol::Rtsp)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorConfig {
    /// Bound on a single `open`, in milliseconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// Bound on a single `execute`, in milliseconds.
    #[serde(default = "default_execute_timeout")]
    pub execute_timeout_ms: u64,
    /// How long the biometric prompt may stay unanswered.
    #[serde(default = "default_prompt_timeout")]
    pub prompt_timeout_ms: u64,
    /// Ready sessions idle longer than this are closed by the sweep.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_ms: u64,
    /// Period of the idle sweep and health probes.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_ms: u64,
    #[serde(default)]
    pub gate_policy: GatePolicy,
    #[serde(default)]
    pub retry_policies: RetryPolicies,
    /// RTSP stream path requested on every device.
    #[serde(default = "default_rtsp_path")]
    pub rtsp_path: String,
}

fn default_connect_timeout() -> u64 {
    10_000
}
fn default_execute_timeout() -> u64 {
    30_000
}
fn default_prompt_timeout() -> u64 {
    30_000
}
fn default_idle_timeout() -> u64 {
    300_000
}
fn default_sweep_interval() -> u64 {
    30_000
}
fn default_rtsp_path() -> String {
    DEFAULT_STREAM_PATH.to_string()
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout(),
            execute_timeout_ms: default_execute_timeout(),
            prompt_timeout_ms: default_prompt_timeout(),
            idle_timeout_ms: default_idle_timeout(),
            sweep_interval_ms: default_sweep_interval(),
            gate_policy: GatePolicy::default(),
            retry_policies: RetryPolicies::default(),
            rtsp_path: default_rtsp_path(),
        }
    }
}

impl OrchestratorConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let timeouts = [
            ("connectTimeoutMs", self.connect_timeout_ms),
            ("executeTimeoutMs", self.execute_timeout_ms),
            ("promptTimeoutMs", self.prompt_timeout_ms),
            ("idleTimeoutMs", self.idle_timeout_ms),
            ("sweepIntervalMs", self.sweep_interval_ms),
        ];
        for (name, value) in timeouts {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{} must be greater than 0", name)));
            }
        }
        for protocol in Protocol::ALL {
            self.retry_policies
                .get(protocol)
                .validate()
                .map_err(|e| ConfigError::Invalid(format!("retryPolicies.{}: {}", protocol, e)))?;
        }
        if !self.rtsp_path.starts_with('/') {
            return Err(ConfigError::Invalid("rtspPath must start with '/'".into()));
        }
        Ok(())
    }

    pub fn shared(self) -> SharedConfig {
        Arc::new(RwLock::new(self))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn execute_timeout(&self) -> Duration {
        Duration::from_millis(self.execute_timeout_ms)
    }

    pub fn prompt_timeout(&self) -> Duration {
        Duration::from_millis(self.prompt_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn retry_policy(&self, protocol: Protocol) -> RetryPolicy {
        self.retry_policies.get(protocol).clone()
    }
}

/// Snapshot of the shared config.
pub(crate) fn snapshot(config: &SharedConfig) -> OrchestratorConfig {
    config.read().unwrap_or_else(|p| p.into_inner()).clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_yields_defaults() {
        let config = OrchestratorConfig::from_json_str("{}").unwrap();
        assert_eq!(config, OrchestratorConfig::default());
        assert_eq!(config.connect_timeout(), Duration::from_secs(10));
        assert_eq!(config.prompt_timeout(), Duration::from_secs(30));
        assert_eq!(config.gate_policy, GatePolicy::AlwaysReprompt);
        assert_eq!(config.retry_policy(Protocol::Ssh).max_attempts, 3);
        assert_eq!(config.retry_policy(Protocol::Rtsp).max_attempts, 5);
        assert_eq!(config.rtsp_path, "/doorbell");
    }

    #[test]
    fn partial_override() {
        let config = OrchestratorConfig::from_json_str(
            r#"{
                "idleTimeoutMs": 60000,
                "gatePolicy": "repromptPerSession",
                "retryPolicies": {
                    "ssh": { "maxAttempts": 5, "baseBackoffMs": 100, "backoffMultiplier": 1.5, "maxBackoffMs": 1000 }
                }
            }"#,
        )
        .unwrap();
        assert_eq!(config.idle_timeout(), Duration::from_secs(60));
        assert_eq!(config.gate_policy, GatePolicy::RepromptPerSession);
        assert_eq!(config.retry_policy(Protocol::Ssh).max_attempts, 5);
        assert_eq!(config.retry_policy(Protocol::Ftp).max_attempts, 3);
    }

    #[test]
    fn rejects_zero_timeout() {
        let err = OrchestratorConfig::from_json_str(r#"{"connectTimeoutMs": 0}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(m) if m.contains("connectTimeoutMs")));
    }

    #[test]
    fn rejects_bad_retry_policy() {
        let err = OrchestratorConfig::from_json_str(
            r#"{"retryPolicies": {"ftp": {"maxAttempts": 0, "baseBackoffMs": 1, "backoffMultiplier": 2.0, "maxBackoffMs": 2}}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(m) if m.starts_with("retryPolicies.ftp")));
    }

    #[test]
    fn rejects_malformed_json() {
        assert!(matches!(
            OrchestratorConfig::from_json_str("{not json"),
            Err(ConfigError::Parse(_))
        ));
    }
}
