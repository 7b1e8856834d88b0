//! `ProtocolSession` over one FTP control connection.
//!
//! FTP is strictly sequential, so every request takes the connection mutex
//! for its whole duration, data channel included.

use crate::ftp::client::FtpClient;
use async_trait::async_trait;
use knock_core::session::{run_detached, with_connect_timeout, with_timeout};
use knock_core::{
    CancellationToken, Credential, DeviceDescriptor, Outcome, Payload, Protocol, ProtocolSession,
    SessionError, SessionKey, SessionResult, SessionState, StateCell,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// How long `close` waits for an in-flight request before giving up on QUIT.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

pub struct FtpSession {
    key: SessionKey,
    state: Arc<StateCell>,
    client: Arc<Mutex<Option<FtpClient>>>,
    execute_timeout: Duration,
}

impl FtpSession {
    pub fn new(key: SessionKey, execute_timeout: Duration) -> Self {
        Self {
            state: Arc::new(StateCell::new(key.to_string())),
            key,
            client: Arc::new(Mutex::new(None)),
            execute_timeout,
        }
    }
}

#[async_trait]
impl ProtocolSession for FtpSession {
    fn protocol(&self) -> Protocol {
        Protocol::Ftp
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
        let port = device.port_for(Protocol::Ftp);
        let endpoint = device.endpoint(Protocol::Ftp);
        let connect = async {
            FtpClient::connect(
                &device.address,
                port,
                &credential.username,
                &credential.secret,
                self.execute_timeout,
            )
            .await
            .map_err(SessionError::from)
        };

        match with_connect_timeout(connect_timeout, &endpoint, connect).await {
            Ok(client) => {
                *self.client.lock().await = Some(client);
                self.state.transition(SessionState::Ready);
                log::info!("{}: FTP session ready at {}", self.key, endpoint);
                Ok(())
            }
            Err(e) => {
                self.state.transition(SessionState::Failed);
                log::warn!("{}: FTP open failed: {}", self.key, e);
                Err(e)
            }
        }
    }

    async fn execute(&self, payload: Payload, cancel: CancellationToken) -> SessionResult<Outcome> {
        let command = match payload {
            Payload::Ftp(command) => command,
            other => {
                return Err(SessionError::invalid_state(format!(
                    "{}: FTP session cannot run a {} payload",
                    self.key,
                    other.protocol()
                )));
            }
        };
        match self.state.get() {
            SessionState::Ready => {}
            other => {
                return Err(SessionError::closed(format!("{}: session is {}", self.key, other)));
            }
        }
        self.state.touch();

        let client = self.client.clone();
        let state = self.state.clone();
        let limit = self.execute_timeout;
        let key = self.key.clone();
        run_detached(&cancel, async move {
            let mut guard = client.lock().await;
            let conn = guard
                .as_mut()
                .ok_or_else(|| SessionError::closed(format!("{}: not connected", key)))?;
            let result = with_timeout(limit, "FTP request", async {
                conn.run(command).await.map_err(SessionError::from)
            })
            .await;
            state.touch();
            if let Err(e) = &result {
                if e.is_connection_loss() {
                    // The control channel may be mid-reply; it cannot be reused.
                    *guard = None;
                    state.transition(SessionState::Degraded);
                    log::warn!("{}: FTP connection lost: {}", key, e);
                }
            }
            result
        })
        .await
    }

    async fn health_check(&self) -> bool {
        if self.state.get() != SessionState::Ready {
            return false;
        }
        let Ok(mut guard) = self.client.try_lock() else {
            // A request is in flight; the connection is in use.
            return true;
        };
        let Some(conn) = guard.as_mut() else {
            return false;
        };
        let probe = with_timeout(self.execute_timeout, "FTP NOOP", async {
            conn.noop().await.map_err(SessionError::from)
        })
        .await;
        match probe {
            Ok(()) => true,
            Err(e) => {
                log::warn!("{}: FTP health probe failed: {}", self.key, e);
                *guard = None;
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
        match tokio::time::timeout(CLOSE_GRACE, self.client.lock()).await {
            Ok(mut guard) => {
                if let Some(mut conn) = guard.take() {
                    let _ = tokio::time::timeout(CLOSE_GRACE, conn.quit()).await;
                }
            }
            Err(_) => log::debug!("{}: request still in flight, dropping connection", self.key),
        }
        self.state.transition(SessionState::Closed);
        log::debug!("{}: FTP session closed", self.key);
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
    use crate::ftp::fake_server::FakeFtpServer;
    use knock_core::{FtpCommand, SessionErrorKind};
    use secrecy::SecretString;

    fn device(port: u16) -> DeviceDescriptor {
        DeviceDescriptor::new("D1", "127.0.0.1").with_port(Protocol::Ftp, port)
    }

    fn cred(password: &str) -> Credential {
        Credential::new(Protocol::Ftp, "pi", SecretString::new(password.to_string()))
    }

    async fn ready_session(server: &FakeFtpServer) -> FtpSession {
        let s = FtpSession::new(SessionKey::new("D1", Protocol::Ftp), Duration::from_secs(5));
        s.open(&device(server.port), cred("raspberry"), Duration::from_secs(5))
            .await
            .unwrap();
        s
    }

    #[tokio::test]
    async fn open_execute_close() {
        let server = FakeFtpServer::start().await;
        let s = ready_session(&server).await;
        assert_eq!(s.state(), SessionState::Ready);

        let out = s
            .execute(
                Payload::Ftp(FtpCommand::List { path: "/".into() }),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        match out {
            Outcome::Listing(entries) => assert_eq!(entries.len(), 2),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(s.health_check().await);

        s.close().await;
        assert_eq!(s.state(), SessionState::Closed);
        s.close().await;
        assert_eq!(s.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn bad_password_fails_open() {
        let server = FakeFtpServer::start().await;
        let s = FtpSession::new(SessionKey::new("D1", Protocol::Ftp), Duration::from_secs(5));
        let err = s
            .open(&device(server.port), cred("wrong"), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err.kind, SessionErrorKind::AuthRejected);
        assert_eq!(s.state(), SessionState::Failed);
    }

    #[tokio::test]
    async fn refused_port_is_unreachable() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let s = FtpSession::new(SessionKey::new("D1", Protocol::Ftp), Duration::from_secs(5));
        let err = s
            .open(&device(port), cred("raspberry"), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err.kind, SessionErrorKind::NetworkUnreachable);
    }

    #[tokio::test]
    async fn cancel_returns_promptly_while_request_hangs() {
        let server = FakeFtpServer::start().await;
        let s = ready_session(&server).await;
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let started = std::time::Instant::now();
        let err = s
            .execute(
                Payload::Ftp(FtpCommand::Download { path: "hang".into() }),
                cancel,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, SessionErrorKind::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn dropped_control_connection_degrades() {
        let server = FakeFtpServer::start().await;
        let s = ready_session(&server).await;
        let err = s
            .execute(
                Payload::Ftp(FtpCommand::Download { path: "drop".into() }),
                CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, SessionErrorKind::SessionClosed);
        assert_eq!(s.state(), SessionState::Degraded);
        assert!(!s.health_check().await);
    }

    #[tokio::test]
    async fn wrong_payload_is_invalid_state() {
        let server = FakeFtpServer::start().await;
        let s = ready_session(&server).await;
        let err = s
            .execute(
                Payload::Rtsp(knock_core::RtspCommand::Play),
                CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, SessionErrorKind::InvalidState);
    }
}
