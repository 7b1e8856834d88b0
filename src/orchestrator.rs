//! # Orchestrator
//!
//! The single entry point for the rest of the application. `invoke`
//! resolves the device, gates sensitive work, obtains a session through the
//! registry and runs the payload on it, all on a task of its own so the
//! caller holds only an [`OperationHandle`].
//!
//! Background work (idle sweep, health probes, grant revocation on
//! permanent failure) runs in one maintenance task started by `start`.

use crate::config::{snapshot, OrchestratorConfig, SharedConfig};
use crate::connector::Connector;
use crate::error::{ConfigError, OrchestratorError, OrchestratorResult};
use crate::factory::DefaultSessionFactory;
use crate::operation::{Operation, OperationHandle};
use crate::push::PushEvent;
use crate::registry::SessionRegistry;
use crate::supervisor::{await_outcome, ReconnectSupervisor, RecoveryStatus, SupervisorEvent};
use futures::future::join_all;
use knock_core::{
    Capability, DeviceDescriptor, DeviceDirectory, Outcome, Payload, Protocol, SessionFactory, SessionKey,
    SessionRef, SessionState,
};
use knock_gate::{BiometricGate, GateContext, Gatekeeper};
use knock_vault::CredentialVault;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

/// Entry point used by the application.
pub struct Orchestrator {
    inner: Arc<Inner>,
    started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

struct Inner {
    config: SharedConfig,
    directory: Arc<dyn DeviceDirectory>,
    descriptors: RwLock<HashMap<String, DeviceDescriptor>>,
    gatekeeper: Gatekeeper,
    registry: Arc<SessionRegistry>,
    connector: Arc<Connector>,
    supervisor: Arc<ReconnectSupervisor>,
    shutdown: CancellationToken,
}

impl Orchestrator {
    /// Orchestrator backed by the real FTP, SSH and RTSP adapters.
    pub fn new(
        config: OrchestratorConfig,
        directory: Arc<dyn DeviceDirectory>,
        vault: CredentialVault,
        gate: Arc<dyn BiometricGate>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let shared = config.shared();
        let factory = Arc::new(DefaultSessionFactory::new(shared.clone()));
        Ok(Self::build(shared, directory, vault, gate, factory))
    }

    /// Orchestrator with a caller-supplied session factory.
    pub fn with_factory(
        config: OrchestratorConfig,
        directory: Arc<dyn DeviceDirectory>,
        vault: CredentialVault,
        gate: Arc<dyn BiometricGate>,
        factory: Arc<dyn SessionFactory>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::build(config.shared(), directory, vault, gate, factory))
    }

    fn build(
        config: SharedConfig,
        directory: Arc<dyn DeviceDirectory>,
        vault: CredentialVault,
        gate: Arc<dyn BiometricGate>,
        factory: Arc<dyn SessionFactory>,
    ) -> Self {
        let current = snapshot(&config);
        let registry = Arc::new(SessionRegistry::new());
        let connector = Arc::new(Connector::new(factory, vault, config.clone()));
        let supervisor = Arc::new(ReconnectSupervisor::new(registry.clone(), connector.clone()));
        let gatekeeper = Gatekeeper::new(gate, current.gate_policy, current.prompt_timeout());
        Self {
            inner: Arc::new(Inner {
                config,
                directory,
                descriptors: RwLock::new(HashMap::new()),
                gatekeeper,
                registry,
                connector,
                supervisor,
                shutdown: CancellationToken::new(),
            }),
            started: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Start the maintenance task. Calling it again does nothing.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move { inner.maintenance().await });
        self.track(handle);
        info!("orchestrator started");
    }

    fn track(&self, handle: JoinHandle<()>) {
        self.tasks.lock().unwrap_or_else(|p| p.into_inner()).push(handle);
    }

    /// Run `payload` against `device_id`. The returned handle yields the
    /// outcome or can cancel it.
    pub fn invoke(&self, device_id: &str, capability: Capability, payload: Payload, sensitive: bool) -> OperationHandle {
        let op = Operation::new(device_id, capability, payload, sensitive);
        let (tx, rx) = oneshot::channel();
        let handle = OperationHandle::new(op.id.clone(), op.cancel.clone(), rx);
        let span = info_span!("operation", id = %op.id, device = %op.device_id, capability = ?op.capability);
        let inner = self.inner.clone();
        tokio::spawn(
            async move {
                let result = inner.run(op).await;
                if let Err(e) = &result {
                    debug!(error = %e, "operation failed");
                }
                let _ = tx.send(result);
            }
            .instrument(span),
        );
        handle
    }

    /// Invoke and wait.
    pub async fn call(
        &self,
        device_id: &str,
        capability: Capability,
        payload: Payload,
        sensitive: bool,
    ) -> OrchestratorResult<Outcome> {
        self.invoke(device_id, capability, payload, sensitive).result().await
    }

    /// Close the session for `(device_id, protocol)` and stop any pending
    /// reconnect for it.
    pub async fn disconnect(&self, device_id: &str, protocol: Protocol) {
        let key = SessionKey::new(device_id, protocol);
        self.inner.supervisor.cancel(&key);
        self.inner.gatekeeper.revoke(&key);
        if let Some(session) = self.inner.registry.remove(&key) {
            session.close().await;
            info!(key = %key, "disconnected");
        }
    }

    /// Swap the whole configuration. Applies to later opens, sweeps and
    /// prompts; live sessions keep running.
    pub fn configure(&self, config: OrchestratorConfig) -> Result<(), ConfigError> {
        config.validate()?;
        self.inner
            .gatekeeper
            .configure(config.gate_policy, config.prompt_timeout());
        *self.inner.config.write().unwrap_or_else(|p| p.into_inner()) = config;
        info!("configuration updated");
        Ok(())
    }

    pub fn config(&self) -> OrchestratorConfig {
        snapshot(&self.inner.config)
    }

    /// Pre-warm the session a push event hints at. Fire and forget.
    pub fn on_push(&self, event: PushEvent) {
        let inner = self.inner.clone();
        tokio::spawn(async move { inner.prewarm(event).await });
    }

    /// Feed push events from `events` until it closes or shutdown.
    pub fn spawn_push_listener(&self, mut events: mpsc::Receiver<PushEvent>) -> JoinHandle<()> {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    biased;
                    _ = inner.shutdown.cancelled() => break,
                    event = events.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                let inner = inner.clone();
                tokio::spawn(async move { inner.prewarm(event).await });
            }
            debug!("push listener stopped");
        })
    }

    /// Reconnect and permanent-failure notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.inner.supervisor.subscribe()
    }

    /// `(key, state)` for every registered session.
    pub fn sessions(&self) -> Vec<(SessionKey, SessionState)> {
        self.inner.registry.snapshot()
    }

    pub fn has_session(&self, device_id: &str, protocol: Protocol) -> bool {
        self.inner.registry.contains(&SessionKey::new(device_id, protocol))
    }

    /// Forget the cached descriptor; the next call re-fetches it.
    pub fn resync(&self, device_id: &str) {
        self.inner
            .descriptors
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(device_id);
    }

    /// Run one idle sweep and health pass now.
    pub async fn sweep(&self) {
        self.inner.sweep().await;
    }

    /// Stop background work, cancel reconnects and close every session.
    /// Later `invoke` calls fail with `ShuttingDown`.
    pub async fn shutdown(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        self.inner.shutdown.cancel();
        self.inner.supervisor.shutdown();
        let tasks: Vec<_> = self.tasks.lock().unwrap_or_else(|p| p.into_inner()).drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        let sessions = self.inner.registry.drain();
        let count = sessions.len();
        join_all(sessions.into_iter().map(|(key, session)| {
            self.inner.gatekeeper.revoke(&key);
            async move { session.close().await }
        }))
        .await;
        info!(sessions = count, "orchestrator shut down");
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
        self.inner.supervisor.shutdown();
        for task in self.tasks.lock().unwrap_or_else(|p| p.into_inner()).drain(..) {
            task.abort();
        }
    }
}

impl Inner {
    async fn run(self: &Arc<Self>, op: Operation) -> OrchestratorResult<Outcome> {
        if self.shutdown.is_cancelled() {
            return Err(OrchestratorError::ShuttingDown);
        }
        let cancel = op.cancel.clone();
        let device = self.descriptor(&op.device_id).await?;
        if op.payload.capability() != op.capability || !device.supports(op.capability) {
            return Err(OrchestratorError::CapabilityUnsupported {
                device_id: op.device_id.clone(),
                capability: op.capability,
            });
        }
        let key = SessionKey::new(&op.device_id, op.payload.protocol());

        let first_shell = key.protocol == Protocol::Ssh && !self.gatekeeper.shell_cleared(&op.device_id);
        if op.requires_gate() || first_shell {
            if first_shell {
                debug!(key = %key, "first shell command to device, gating");
            }
            let context = GateContext {
                operation_id: op.id.clone(),
                device_id: op.device_id.clone(),
                protocol: key.protocol,
                summary: op.summary(),
            };
            let grant = self.gatekeeper.authorize(context, &key, &cancel).await?;
            grant.consume(&op.id)?;
        }

        let mut session = self.acquire(&key, &device, &cancel).await?;
        let mut reissued = false;
        loop {
            let err = match session.execute(op.payload.clone(), cancel.clone()).await {
                Ok(outcome) => return Ok(outcome),
                Err(e) if e.is_connection_loss() && !cancel.is_cancelled() => e,
                Err(e) => return Err(OrchestratorError::from_execute(e)),
            };

            warn!(key = %key, error = %err, "connection lost mid-operation");
            let status = self.supervisor.report_degraded(&key, &session, &device);
            match await_outcome(status, &cancel).await? {
                RecoveryStatus::Recovered if op.payload.is_idempotent() && !reissued => {
                    reissued = true;
                    debug!(key = %key, "re-issuing idempotent operation");
                    session = self.acquire(&key, &device, &cancel).await?;
                }
                RecoveryStatus::Recovered => {
                    return Err(OrchestratorError::SessionUnavailable(format!(
                        "{} reconnected but the operation was not re-issued",
                        key
                    )))
                }
                RecoveryStatus::Failed => {
                    return Err(OrchestratorError::SessionUnavailable(format!(
                        "{}: reconnect attempts exhausted",
                        key
                    )))
                }
                RecoveryStatus::Cancelled | RecoveryStatus::Recovering => {
                    return Err(if self.shutdown.is_cancelled() {
                        OrchestratorError::ShuttingDown
                    } else {
                        OrchestratorError::SessionUnavailable(format!("{} was disconnected", key))
                    })
                }
            }
        }
    }

    /// Registered session for `key`, opening one if needed. A Degraded
    /// session is waited out first.
    async fn acquire(
        &self,
        key: &SessionKey,
        device: &DeviceDescriptor,
        cancel: &CancellationToken,
    ) -> OrchestratorResult<SessionRef> {
        let mut waited = false;
        loop {
            let connector = self.connector.clone();
            let (k, d) = (key.clone(), device.clone());
            let session = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(OrchestratorError::OperationCancelled),
                opened = self.registry.get_or_create(key, move || async move {
                    connector.open_with_retry(&k, &d).await
                }) => opened?,
            };
            if session.state() != SessionState::Degraded || waited {
                return Ok(session);
            }
            waited = true;
            let status = self.supervisor.report_degraded(key, &session, device);
            match await_outcome(status, cancel).await? {
                RecoveryStatus::Recovered => continue,
                _ => {
                    return Err(OrchestratorError::SessionUnavailable(format!(
                        "{} could not be recovered",
                        key
                    )))
                }
            }
        }
    }

    async fn descriptor(&self, device_id: &str) -> OrchestratorResult<DeviceDescriptor> {
        if let Some(device) = self.cached_descriptor(device_id) {
            return Ok(device);
        }
        let fetched = self
            .directory
            .fetch_descriptor(device_id)
            .await
            .map_err(|e| OrchestratorError::SessionUnavailable(e.to_string()))?
            .ok_or_else(|| OrchestratorError::DeviceUnknown(device_id.to_string()))?;
        self.descriptors
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(device_id.to_string(), fetched.clone());
        Ok(fetched)
    }

    fn cached_descriptor(&self, device_id: &str) -> Option<DeviceDescriptor> {
        self.descriptors
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(device_id)
            .cloned()
    }

    async fn prewarm(&self, event: PushEvent) {
        if self.shutdown.is_cancelled() {
            return;
        }
        let Some(protocol) = event.prewarm_protocol() else {
            return;
        };
        let device = match self.descriptor(&event.device_id).await {
            Ok(device) => device,
            Err(e) => {
                debug!(device = %event.device_id, error = %e, "push pre-warm skipped");
                return;
            }
        };
        if !device.supports(protocol.capability()) {
            return;
        }
        let key = SessionKey::new(&event.device_id, protocol);
        let connector = self.connector.clone();
        let (k, d) = (key.clone(), device.clone());
        match self
            .registry
            .get_or_create(&key, move || async move { connector.open_with_retry(&k, &d).await })
            .await
        {
            Ok(_) => debug!(key = %key, hint = ?event.hint, "session pre-warmed"),
            Err(e) => debug!(key = %key, error = %e, "pre-warm failed"),
        }
    }

    async fn maintenance(self: Arc<Self>) {
        let mut events = self.supervisor.subscribe();
        let mut next_sweep = Instant::now() + snapshot(&self.config).sweep_interval();
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Ok(SupervisorEvent::Failed { key, .. }) => self.gatekeeper.revoke(&key),
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => debug!(skipped = n, "maintenance lagged on events"),
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = tokio::time::sleep_until(next_sweep) => {
                    self.sweep().await;
                    next_sweep = Instant::now() + snapshot(&self.config).sweep_interval();
                }
            }
        }
        debug!("maintenance task stopped");
    }

    async fn sweep(&self) {
        let config = snapshot(&self.config);
        for key in self.registry.evict_idle(config.idle_timeout()).await {
            self.gatekeeper.revoke(&key);
        }

        let candidates: Vec<_> = self
            .registry
            .live()
            .into_iter()
            .filter(|(key, _)| !self.supervisor.is_recovering(key))
            .collect();
        let probes = candidates.into_iter().map(|(key, session)| async move {
            let healthy = match session.state() {
                SessionState::Ready => session.health_check().await,
                SessionState::Degraded => false,
                _ => true,
            };
            (key, session, healthy)
        });
        for (key, session, healthy) in join_all(probes).await {
            if healthy {
                continue;
            }
            match self.cached_descriptor(&key.device_id) {
                Some(device) => {
                    self.supervisor.report_degraded(&key, &session, &device);
                }
                None => warn!(key = %key, "unhealthy session without a known descriptor"),
            }
        }
    }
}
