//! `ProtocolSession` over one authenticated SSH connection.
//!
//! Commands are serialised through a single lock; each one opens its own
//! exec channel on the blocking pool.

use crate::ssh::client::SshClient;
use async_trait::async_trait;
use knock_core::session::{run_detached, with_connect_timeout, with_timeout};
use knock_core::{
    CancellationToken, Credential, DeviceDescriptor, Outcome, Payload, Protocol, ProtocolSession,
    SessionError, SessionKey, SessionResult, SessionState, SshCommand, StateCell,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const CLOSE_GRACE: Duration = Duration::from_secs(2);

type Shared = Arc<Mutex<Option<SshClient>>>;

pub struct SshSession {
    key: SessionKey,
    state: Arc<StateCell>,
    client: Shared,
    execute_timeout: Duration,
}

impl SshSession {
    pub fn new(key: SessionKey, execute_timeout: Duration) -> Self {
        Self {
            state: Arc::new(StateCell::new(key.to_string())),
            key,
            client: Arc::new(Mutex::new(None)),
            execute_timeout,
        }
    }
}

/// Run `f` against the connected client on the blocking pool.
async fn blocking<T, F>(client: Shared, f: F) -> SessionResult<T>
where
    T: Send + 'static,
    F: FnOnce(&SshClient) -> SessionResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let guard = client.lock().unwrap_or_else(|p| p.into_inner());
        match guard.as_ref() {
            Some(conn) => f(conn),
            None => Err(SessionError::closed("SSH session not connected")),
        }
    })
    .await
    .map_err(|e| SessionError::closed(format!("SSH task aborted: {}", e)))?
}

/// Release the connection unless a timed-out call still holds it; the
/// session is Degraded either way and refuses new work.
fn drop_connection(client: &Shared) {
    if let Ok(mut guard) = client.try_lock() {
        guard.take();
    }
}

#[async_trait]
impl ProtocolSession for SshSession {
    fn protocol(&self) -> Protocol {
        Protocol::Ssh
    }

    fn state(&self) -> SessionState {
        self.state.get()
    }

    fn idle_for(&self) -> Duration {
        self.state.idle_for()
    }

    async fn open(
        &self,
        device: &DeviceDescriptor,
        credential: Credential,
        connect_timeout: Duration,
    ) -> SessionResult<()> {
        if !self.state.transition(SessionState::Connecting) {
            return Err(SessionError::invalid_state(format!(
                "{}: open called in state {}",
                self.key,
                self.state.get()
            )));
        }
        let endpoint = device.endpoint(Protocol::Ssh);
        let connect = SshClient::connect(
            &device.address,
            device.port_for(Protocol::Ssh),
            credential.username,
            credential.secret,
            connect_timeout,
        );

        match with_connect_timeout(connect_timeout, &endpoint, connect).await {
            Ok(conn) => {
                // From here on libssh2 calls are bounded by the execute timeout.
                let limit = self.execute_timeout;
                let client = self.client.clone();
                let installed = tokio::task::spawn_blocking(move || {
                    conn.set_io_timeout(limit);
                    *client.lock().unwrap_or_else(|p| p.into_inner()) = Some(conn);
                })
                .await;
                if let Err(e) = installed {
                    self.state.transition(SessionState::Failed);
                    return Err(SessionError::closed(format!("SSH setup aborted: {}", e)));
                }
                self.state.transition(SessionState::Ready);
                log::info!("{}: SSH session ready at {}", self.key, endpoint);
                Ok(())
            }
            Err(e) => {
                self.state.transition(SessionState::Failed);
                log::warn!("{}: SSH open failed: {}", self.key, e);
                Err(e)
            }
        }
    }

    async fn execute(&self, payload: Payload, cancel: CancellationToken) -> SessionResult<Outcome> {
        let command = match payload {
            Payload::Ssh(SshCommand::Exec { command }) => command,
            other => {
                return Err(SessionError::invalid_state(format!(
                    "{}: SSH session cannot run a {} payload",
                    self.key,
                    other.protocol()
                )));
            }
        };
        if self.state.get() != SessionState::Ready {
            return Err(SessionError::closed(format!(
                "{}: session is {}",
                self.key,
                self.state.get()
            )));
        }
        self.state.touch();

        let client = self.client.clone();
        let state = self.state.clone();
        let limit = self.execute_timeout;
        let key = self.key.clone();
        run_detached(&cancel, async move {
            let result = with_timeout(
                limit,
                "SSH exec",
                blocking(client.clone(), move |conn| conn.exec(&command)),
            )
            .await;
            state.touch();
            if let Err(e) = &result {
                if e.is_connection_loss() {
                    drop_connection(&client);
                    state.transition(SessionState::Degraded);
                    log::warn!("{}: SSH connection lost: {}", key, e);
                }
            }
            result.map(Outcome::Exec)
        })
        .await
    }

    async fn health_check(&self) -> bool {
        if self.state.get() != SessionState::Ready {
            return false;
        }
        if self.client.try_lock().is_err() {
            // A command is running; the connection is in use.
            return true;
        }
        let probe = with_timeout(
            self.execute_timeout,
            "SSH probe",
            blocking(self.client.clone(), |conn| conn.probe()),
        )
        .await;
        match probe {
            Ok(()) => true,
            Err(e) => {
                log::warn!("{}: SSH health probe failed: {}", self.key, e);
                drop_connection(&self.client);
                self.state.transition(SessionState::Degraded);
                false
            }
        }
    }

    async fn close(&self) {
        if self.state.get() == SessionState::Closed {
            return;
        }
        self.state.transition(SessionState::Closing);
        let client = self.client.clone();
        let teardown = tokio::task::spawn_blocking(move || {
            let mut guard = client.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(conn) = guard.take() {
                conn.disconnect();
            }
        });
        if tokio::time::timeout(CLOSE_GRACE, teardown).await.is_err() {
            log::debug!("{}: command still in flight, abandoning connection", self.key);
        }
        self.state.transition(SessionState::Closed);
        log::debug!("{}: SSH session closed", self.key);
    }

    fn mark_degraded(&self) {
        self.state.transition(SessionState::Degraded);
    }

    fn mark_failed(&self) {
        self.state.transition(SessionState::Failed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use knock_core::SessionErrorKind;
    use secrecy::SecretString;
    use tokio::net::TcpListener;

    fn device(port: u16) -> DeviceDescriptor {
        DeviceDescriptor::new("D1", "127.0.0.1").with_port(Protocol::Ssh, port)
    }

    fn cred() -> Credential {
        Credential::new(Protocol::Ssh, "pi", SecretString::new("raspberry".to_string()))
    }

    fn session() -> SshSession {
        SshSession::new(SessionKey::new("D1", Protocol::Ssh), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn refused_port_is_unreachable() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let s = session();
        let err = s
            .open(&device(port), cred(), Duration::from_secs(2))
            .await
            .unwrap_err();
        assert_eq!(err.kind, SessionErrorKind::NetworkUnreachable);
        assert_eq!(s.state(), SessionState::Failed);
    }

    #[tokio::test]
    async fn silent_server_hits_connect_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (_sock, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });
        let s = session();
        let err = s
            .open(&device(port), cred(), Duration::from_millis(300))
            .await
            .unwrap_err();
        assert_eq!(err.kind, SessionErrorKind::ConnectTimeout);
    }

    #[tokio::test]
    async fn execute_before_open_is_closed() {
        let s = session();
        let err = s
            .execute(
                Payload::Ssh(SshCommand::Exec { command: "uptime".into() }),
                CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, SessionErrorKind::SessionClosed);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let s = session();
        s.close().await;
        s.close().await;
        assert_eq!(s.state(), SessionState::Closed);
        assert!(!s.health_check().await);
    }
}
