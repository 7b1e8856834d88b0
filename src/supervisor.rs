//! Reconnect Supervisor.
//!
//! Runs at most one recovery per [`SessionKey`]. A recovery opens
//! replacement sessions with the protocol's backoff and swaps the first
//! success into the registry. The degraded instance is closed on success
//! and marked Failed (and removed) once the attempts are used up.

use crate::connector::Connector;
use crate::error::OrchestratorError;
use crate::registry::SessionRegistry;
use knock_core::{DeviceDescriptor, SessionKey, SessionRef};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const EVENT_CAPACITY: usize = 64;

/// Published for every recovery step; `Failed` is the permanent-failure
/// notification.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SupervisorEvent {
    Reconnecting {
        key: SessionKey,
        attempt: u32,
        delay: Duration,
    },
    Reconnected {
        key: SessionKey,
        attempts: u32,
    },
    Failed {
        key: SessionKey,
        attempts: u32,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryStatus {
    Recovering,
    /// A replacement session is registered under the key.
    Recovered,
    /// Attempts exhausted; the key was removed.
    Failed,
    /// Stopped by a disconnect or shutdown.
    Cancelled,
}

struct Recovery {
    id: u64,
    cancel: CancellationToken,
    status: watch::Receiver<RecoveryStatus>,
}

pub struct ReconnectSupervisor {
    registry: Arc<SessionRegistry>,
    connector: Arc<Connector>,
    recoveries: Mutex<HashMap<SessionKey, Recovery>>,
    next_id: AtomicU64,
    events: broadcast::Sender<SupervisorEvent>,
    shutdown: CancellationToken,
}

impl ReconnectSupervisor {
    pub fn new(registry: Arc<SessionRegistry>, connector: Arc<Connector>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            registry,
            connector,
            recoveries: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            events,
            shutdown: CancellationToken::new(),
        }
    }

    fn recoveries(&self) -> MutexGuard<'_, HashMap<SessionKey, Recovery>> {
        self.recoveries.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.events.subscribe()
    }

    pub fn is_recovering(&self, key: &SessionKey) -> bool {
        self.recoveries().contains_key(key)
    }

    /// Report that `session` lost its connection. Starts a recovery unless
    /// one is already running for the key, and returns its status feed.
    pub fn report_degraded(
        self: &Arc<Self>,
        key: &SessionKey,
        session: &SessionRef,
        device: &DeviceDescriptor,
    ) -> watch::Receiver<RecoveryStatus> {
        let mut recoveries = self.recoveries();
        if let Some(running) = recoveries.get(key) {
            return running.status.clone();
        }
        if self.shutdown.is_cancelled() {
            return watch::channel(RecoveryStatus::Cancelled).1;
        }
        if !self.registry.is_current(key, session) {
            // Already replaced, evicted or removed: the caller re-resolves.
            return watch::channel(RecoveryStatus::Recovered).1;
        }

        session.mark_degraded();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = self.shutdown.child_token();
        let (tx, rx) = watch::channel(RecoveryStatus::Recovering);
        recoveries.insert(
            key.clone(),
            Recovery {
                id,
                cancel: cancel.clone(),
                status: rx.clone(),
            },
        );
        drop(recoveries);

        warn!(key = %key, "session degraded, starting recovery");
        let this = Arc::clone(self);
        let (key, old, device) = (key.clone(), session.clone(), device.clone());
        tokio::spawn(async move {
            let outcome = this.recover(&key, old, &device, &cancel).await;
            let _ = tx.send(outcome);
            let mut recoveries = this.recoveries();
            if recoveries.get(&key).map(|r| r.id) == Some(id) {
                recoveries.remove(&key);
            }
        });
        rx
    }

    async fn recover(
        &self,
        key: &SessionKey,
        old: SessionRef,
        device: &DeviceDescriptor,
        cancel: &CancellationToken,
    ) -> RecoveryStatus {
        let policy = self.connector.retry_policy(key);
        let mut attempts = 0;
        while attempts < policy.max_attempts {
            attempts += 1;
            let delay = policy.delay_for(attempts);
            self.emit(SupervisorEvent::Reconnecting {
                key: key.clone(),
                attempt: attempts,
                delay,
            });

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return RecoveryStatus::Cancelled,
                r = async {
                    tokio::time::sleep(delay).await;
                    self.connector.open_once(key, device).await
                } => r,
            };

            match result {
                Ok(replacement) => {
                    if !self.registry.swap(key, &old, replacement.clone()) {
                        replacement.close().await;
                        return RecoveryStatus::Cancelled;
                    }
                    old.close().await;
                    info!(key = %key, attempts, "session recovered");
                    self.emit(SupervisorEvent::Reconnected {
                        key: key.clone(),
                        attempts,
                    });
                    return RecoveryStatus::Recovered;
                }
                Err(e) if is_permanent(&e) => {
                    warn!(key = %key, attempt = attempts, error = %e, "reconnect rejected, giving up");
                    break;
                }
                Err(e) => warn!(key = %key, attempt = attempts, error = %e, "reconnect attempt failed"),
            }
        }

        if cancel.is_cancelled() {
            return RecoveryStatus::Cancelled;
        }
        old.mark_failed();
        if self.registry.remove_if_current(key, &old) {
            warn!(key = %key, attempts, "reconnect attempts exhausted, session removed");
        }
        self.emit(SupervisorEvent::Failed {
            key: key.clone(),
            attempts,
        });
        RecoveryStatus::Failed
    }

    fn emit(&self, event: SupervisorEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Stop any pending recovery for `key` (user-initiated disconnect).
    pub fn cancel(&self, key: &SessionKey) {
        if let Some(recovery) = self.recoveries().remove(key) {
            info!(key = %key, "recovery cancelled");
            recovery.cancel.cancel();
        }
    }

    /// Cancel every recovery and refuse new ones.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.recoveries().clear();
    }
}

/// Wait for a recovery to settle, or for `cancel`.
pub async fn await_outcome(
    mut status: watch::Receiver<RecoveryStatus>,
    cancel: &CancellationToken,
) -> Result<RecoveryStatus, OrchestratorError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(OrchestratorError::OperationCancelled),
        settled = status.wait_for(|s| *s != RecoveryStatus::Recovering) => {
            Ok(settled.map(|s| *s).unwrap_or(RecoveryStatus::Cancelled))
        }
    }
}

fn is_permanent(err: &OrchestratorError) -> bool {
    match err {
        OrchestratorError::ConnectFailed(e) => e.kind == knock_core::SessionErrorKind::AuthRejected,
        OrchestratorError::CredentialUnavailable(_) => true,
        _ => false,
    }
}
