//! Scripted sessions, gate and fixtures shared by the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use knock_core::{
    CancellationToken, Capability, Credential, DeviceDescriptor, EntryKind, FtpCommand, Outcome, Payload, Protocol,
    ProtocolSession, RemoteEntry, SessionError, SessionFactory, SessionKey, SessionRef, SessionResult, SessionState,
    StateCell, StaticDirectory,
};
use knock_gate::{BiometricGate, GateContext, GateDecision};
use knock_vault::{CredentialVault, InMemorySecretStore};
use knockly::{Orchestrator, OrchestratorConfig};
use secrecy::ExposeSecret;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ─── Scripted session ────────────────────────────────────────────────

/// Behaviour shared by every session a factory creates for one protocol.
#[derive(Default)]
pub struct Script {
    pub opens: AtomicUsize,
    pub executes: AtomicUsize,
    pub closes: AtomicUsize,
    open_delay: Mutex<Duration>,
    open_error: Mutex<Option<SessionError>>,
    execute_delay: Mutex<Duration>,
    execute_errors: Mutex<VecDeque<SessionError>>,
    unhealthy: AtomicBool,
    secrets: Mutex<Vec<String>>,
}

impl Script {
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn executes(&self) -> usize {
        self.executes.load(Ordering::SeqCst)
    }

    pub fn set_open_delay(&self, d: Duration) {
        *self.open_delay.lock().unwrap() = d;
    }

    /// Every later open fails with `err`; `None` lets them succeed again.
    pub fn set_open_error(&self, err: Option<SessionError>) {
        *self.open_error.lock().unwrap() = err;
    }

    pub fn set_execute_delay(&self, d: Duration) {
        *self.execute_delay.lock().unwrap() = d;
    }

    /// Fail the next execute with `err`.
    pub fn fail_next_execute(&self, err: SessionError) {
        self.execute_errors.lock().unwrap().push_back(err);
    }

    pub fn set_unhealthy(&self, unhealthy: bool) {
        self.unhealthy.store(unhealthy, Ordering::SeqCst);
    }

    /// Secrets seen by `open`, oldest first.
    pub fn secrets(&self) -> Vec<String> {
        self.secrets.lock().unwrap().clone()
    }
}

pub struct ScriptedSession {
    protocol: Protocol,
    state: StateCell,
    script: Arc<Script>,
}

#[async_trait]
impl ProtocolSession for ScriptedSession {
    fn protocol(&self) -> Protocol {
        self.protocol
    }

    fn state(&self) -> SessionState {
        self.state.get()
    }

    fn idle_for(&self) -> Duration {
        self.state.idle_for()
    }

    async fn open(&self, _device: &DeviceDescriptor, credential: Credential, _timeout: Duration) -> SessionResult<()> {
        self.script.opens.fetch_add(1, Ordering::SeqCst);
        self.script
            .secrets
            .lock()
            .unwrap()
            .push(credential.secret.expose_secret().to_string());
        self.state.transition(SessionState::Connecting);
        let delay = *self.script.open_delay.lock().unwrap();
        tokio::time::sleep(delay).await;
        let failure = self.script.open_error.lock().unwrap().clone();
        match failure {
            Some(err) => {
                self.state.transition(SessionState::Failed);
                Err(err)
            }
            None => {
                self.state.transition(SessionState::Ready);
                Ok(())
            }
        }
    }

    async fn execute(&self, payload: Payload, cancel: CancellationToken) -> SessionResult<Outcome> {
        self.script.executes.fetch_add(1, Ordering::SeqCst);
        if self.state.get() != SessionState::Ready {
            return Err(SessionError::closed("session not ready"));
        }
        self.state.touch();
        let injected = self.script.execute_errors.lock().unwrap().pop_front();
        if let Some(err) = injected {
            if err.is_connection_loss() {
                self.state.transition(SessionState::Degraded);
            }
            return Err(err);
        }
        let delay = *self.script.execute_delay.lock().unwrap();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SessionError::cancelled()),
            _ = tokio::time::sleep(delay) => {}
        }
        Ok(match payload {
            Payload::Ftp(FtpCommand::List { path }) => Outcome::Listing(vec![RemoteEntry {
                name: format!("{}clip-001.mp4", path),
                kind: EntryKind::File,
                size: 1024,
                modified: None,
                permissions: None,
                link_target: None,
            }]),
            _ => Outcome::Done,
        })
    }

    async fn health_check(&self) -> bool {
        if self.state.get() != SessionState::Ready {
            return false;
        }
        if self.script.unhealthy.load(Ordering::SeqCst) {
            self.state.transition(SessionState::Degraded);
            return false;
        }
        true
    }

    async fn close(&self) {
        self.script.closes.fetch_add(1, Ordering::SeqCst);
        self.state.transition(SessionState::Closing);
        self.state.transition(SessionState::Closed);
    }

    fn mark_degraded(&self) {
        self.state.transition(SessionState::Degraded);
    }

    fn mark_failed(&self) {
        self.state.transition(SessionState::Failed);
    }
}

#[derive(Default)]
pub struct ScriptedFactory {
    scripts: Mutex<HashMap<Protocol, Arc<Script>>>,
}

impl ScriptedFactory {
    pub fn script(&self, protocol: Protocol) -> Arc<Script> {
        self.scripts.lock().unwrap().entry(protocol).or_default().clone()
    }
}

impl SessionFactory for ScriptedFactory {
    fn create(&self, key: &SessionKey) -> SessionRef {
        Arc::new(ScriptedSession {
            protocol: key.protocol,
            state: StateCell::new(key.to_string()),
            script: self.script(key.protocol),
        })
    }
}

// ─── Gate ────────────────────────────────────────────────────────────

pub struct CountingGate {
    decision: Mutex<Option<GateDecision>>,
    pub prompts: AtomicUsize,
}

impl CountingGate {
    /// `None` never answers.
    pub fn new(decision: Option<GateDecision>) -> Arc<Self> {
        Arc::new(Self {
            decision: Mutex::new(decision),
            prompts: AtomicUsize::new(0),
        })
    }

    pub fn prompts(&self) -> usize {
        self.prompts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BiometricGate for CountingGate {
    async fn prompt_and_wait(&self, _context: &GateContext) -> GateDecision {
        self.prompts.fetch_add(1, Ordering::SeqCst);
        let decision = *self.decision.lock().unwrap();
        match decision {
            Some(d) => d,
            None => std::future::pending().await,
        }
    }
}

// ─── Fixture ─────────────────────────────────────────────────────────

pub struct Fixture {
    pub orchestrator: Orchestrator,
    pub factory: Arc<ScriptedFactory>,
    pub gate: Arc<CountingGate>,
    pub secrets: Arc<InMemorySecretStore>,
}

/// D1: file transfer + stream. D2: shell. D3: stream only, no credential.
pub fn devices() -> Vec<DeviceDescriptor> {
    vec![
        DeviceDescriptor::new("D1", "10.0.0.5")
            .with_capability(Capability::FileTransfer)
            .with_capability(Capability::Stream),
        DeviceDescriptor::new("D2", "10.0.0.6").with_capability(Capability::Shell),
        DeviceDescriptor::new("D3", "10.0.0.7").with_capability(Capability::Stream),
    ]
}

/// Short backoffs so retry tests run in milliseconds.
pub fn fast_config() -> OrchestratorConfig {
    let mut config = OrchestratorConfig::default();
    for policy in [
        &mut config.retry_policies.ftp,
        &mut config.retry_policies.ssh,
        &mut config.retry_policies.rtsp,
    ] {
        policy.max_attempts = 3;
        policy.base_backoff_ms = 5;
        policy.max_backoff_ms = 20;
    }
    config.prompt_timeout_ms = 2_000;
    config
}

pub fn fixture(config: OrchestratorConfig, decision: Option<GateDecision>) -> Fixture {
    let secrets = Arc::new(InMemorySecretStore::new());
    secrets.insert("D1", Protocol::Ftp, "pi", "raspberry");
    secrets.insert("D1", Protocol::Rtsp, "pi", "raspberry");
    secrets.insert("D2", Protocol::Ssh, "pi", "raspberry");
    let factory = Arc::new(ScriptedFactory::default());
    let gate = CountingGate::new(decision);
    let orchestrator = Orchestrator::with_factory(
        config,
        Arc::new(StaticDirectory::new(devices())),
        CredentialVault::new(secrets.clone()),
        gate.clone(),
        factory.clone(),
    )
    .unwrap();
    Fixture {
        orchestrator,
        factory,
        gate,
        secrets,
    }
}

pub fn payload(verb: &str, arg: &str) -> Payload {
    Payload::from_verb(verb, arg).unwrap()
}

/// Poll `check` every 5ms for up to two seconds.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..400 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}
