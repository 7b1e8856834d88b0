//! # Gatekeeper
//!
//! Turns a biometric decision into a single-use [`GrantToken`] bound to one
//! operation. Under [`GatePolicy::AlwaysReprompt`] every sensitive
//! operation prompts. Under [`GatePolicy::RepromptPerSession`] one grant
//! covers a session until it is disconnected, evicted or fails.
//!
//! Independently of policy, the first shell command to a device is gated:
//! once one SSH operation on a device has passed the gate, later shell
//! commands there run unprompted until that SSH session goes away.

use crate::prompt::{BiometricGate, GateContext, GateDecision};
use knock_core::{Protocol, SessionKey};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum GatePolicy {
    #[default]
    AlwaysReprompt,
    RepromptPerSession,
}

#[derive(Debug, Error, PartialEq)]
pub enum GateError {
    #[error("user denied the operation")]
    Denied,
    #[error("no biometric decision within {0:?}")]
    Timeout(Duration),
    #[error("authorisation cancelled")]
    Cancelled,
    #[error("grant issued for operation {issued} presented for {presented}")]
    TokenMismatch { issued: String, presented: String },
}

/// Proof that one operation passed the gate. Not `Clone`; consumed once.
#[derive(Debug)]
pub struct GrantToken {
    operation_id: String,
    issued_at: Instant,
}

impl GrantToken {
    fn new(operation_id: String) -> Self {
        Self {
            operation_id,
            issued_at: Instant::now(),
        }
    }

    pub fn operation_id(&self) -> &str {
        &self.operation_id
    }

    pub fn age(&self) -> Duration {
        self.issued_at.elapsed()
    }

    /// Spend the grant on the operation it was issued for.
    pub fn consume(self, operation_id: &str) -> Result<(), GateError> {
        if self.operation_id != operation_id {
            return Err(GateError::TokenMismatch {
                issued: self.operation_id,
                presented: operation_id.to_string(),
            });
        }
        Ok(())
    }
}

struct Settings {
    policy: GatePolicy,
    prompt_timeout: Duration,
}

pub struct Gatekeeper {
    gate: Arc<dyn BiometricGate>,
    settings: RwLock<Settings>,
    session_grants: RwLock<HashSet<SessionKey>>,
    /// Devices whose shell has been opened through the gate.
    shell_cleared: RwLock<HashSet<String>>,
}

impl Gatekeeper {
    pub fn new(gate: Arc<dyn BiometricGate>, policy: GatePolicy, prompt_timeout: Duration) -> Self {
        Self {
            gate,
            settings: RwLock::new(Settings {
                policy,
                prompt_timeout,
            }),
            session_grants: RwLock::new(HashSet::new()),
            shell_cleared: RwLock::new(HashSet::new()),
        }
    }

    pub fn policy(&self) -> GatePolicy {
        self.settings.read().unwrap_or_else(|p| p.into_inner()).policy
    }

    /// Switching policy drops every standing session grant and shell clearance.
    pub fn configure(&self, policy: GatePolicy, prompt_timeout: Duration) {
        {
            let mut s = self.settings.write().unwrap_or_else(|p| p.into_inner());
            s.policy = policy;
            s.prompt_timeout = prompt_timeout;
        }
        self.session_grants
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .clear();
        self.shell_cleared
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .clear();
    }

    /// Prompt (unless a session grant applies) and issue a token.
    pub async fn authorize(
        &self,
        context: GateContext,
        session: &SessionKey,
        cancel: &CancellationToken,
    ) -> Result<GrantToken, GateError> {
        let (policy, limit) = {
            let s = self.settings.read().unwrap_or_else(|p| p.into_inner());
            (s.policy, s.prompt_timeout)
        };

        if policy == GatePolicy::RepromptPerSession && self.has_session_grant(session) {
            log::debug!("{}: reusing session grant for {}", session, context.operation_id);
            self.clear_shell(&context);
            return Ok(GrantToken::new(context.operation_id));
        }

        log::debug!("{}: prompting for {} ({})", session, context.operation_id, context.summary);
        let decision = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(GateError::Cancelled),
            d = tokio::time::timeout(limit, self.gate.prompt_and_wait(&context)) => d,
        };

        match decision {
            Err(_) => {
                log::info!("{}: biometric prompt timed out after {:?}", session, limit);
                Err(GateError::Timeout(limit))
            }
            Ok(GateDecision::Denied) => {
                log::info!("{}: operation {} denied", session, context.operation_id);
                Err(GateError::Denied)
            }
            Ok(GateDecision::Granted) => {
                if policy == GatePolicy::RepromptPerSession {
                    self.session_grants
                        .write()
                        .unwrap_or_else(|p| p.into_inner())
                        .insert(session.clone());
                }
                self.clear_shell(&context);
                Ok(GrantToken::new(context.operation_id))
            }
        }
    }

    pub fn has_session_grant(&self, session: &SessionKey) -> bool {
        self.session_grants
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .contains(session)
    }

    /// Whether a shell command to `device_id` has already passed the gate.
    pub fn shell_cleared(&self, device_id: &str) -> bool {
        self.shell_cleared
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .contains(device_id)
    }

    fn clear_shell(&self, context: &GateContext) {
        if context.protocol == Protocol::Ssh {
            self.shell_cleared
                .write()
                .unwrap_or_else(|p| p.into_inner())
                .insert(context.device_id.clone());
        }
    }

    /// Forget the grant for a session that went away. For SSH sessions the
    /// device's shell clearance goes with it.
    pub fn revoke(&self, session: &SessionKey) {
        if session.protocol == Protocol::Ssh
            && self
                .shell_cleared
                .write()
                .unwrap_or_else(|p| p.into_inner())
                .remove(&session.device_id)
        {
            log::debug!("{}: shell clearance revoked", session);
        }
        if self
            .session_grants
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(session)
        {
            log::debug!("{}: session grant revoked", session);
        }
    }
}
