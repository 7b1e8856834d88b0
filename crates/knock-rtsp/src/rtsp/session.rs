//! `ProtocolSession` over one RTSP control connection.
//!
//! Requests are pipelined: each carries its own `CSeq`, so concurrent
//! DESCRIBE/PLAY/PAUSE calls share the connection without a lock.

use crate::rtsp::auth::Authenticator;
use crate::rtsp::connection::RtspConnection;
use crate::rtsp::message::{media_control, resolve_control, RtspRequest, RtspResponse};
use async_trait::async_trait;
use knock_core::session::{run_detached, with_connect_timeout, with_timeout};
use knock_core::{
    CancellationToken, Credential, DeviceDescriptor, Outcome, Payload, Protocol, ProtocolSession,
    RtspCommand, SessionError, SessionErrorKind, SessionKey, SessionResult, SessionState,
    StateCell, StreamHandle,
};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

pub const DEFAULT_STREAM_PATH: &str = "/doorbell";

const MEDIA_BUFFER: usize = 256;
const CLOSE_GRACE: Duration = Duration::from_secs(2);
const INTERLEAVED_TRANSPORT: &str = "RTP/AVP/TCP;unicast;interleaved=0-1";

/// Per-connection protocol state.
struct Control {
    conn: RtspConnection,
    url: String,
    auth: Mutex<Authenticator>,
    media_url: Mutex<Option<String>>,
    session_id: Mutex<Option<String>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

impl Control {
    fn authorize(&self, mut req: RtspRequest) -> RtspRequest {
        if let Some(value) = lock(&self.auth).header(req.method, &req.url) {
            req.set_header("Authorization", value);
        }
        if let Some(id) = lock(&self.session_id).clone() {
            req.set_header("Session", id);
        }
        req
    }

    /// Send once, answering a fresh 401 challenge with one retry.
    async fn send(&self, req: RtspRequest) -> SessionResult<RtspResponse> {
        let first = self.conn.send(&self.authorize(req.clone())).await?;
        if first.status != 401 {
            return Ok(first);
        }
        let retry = lock(&self.auth).accept_challenges(first.headers_named("WWW-Authenticate"));
        if !retry {
            return Ok(first);
        }
        self.conn.send(&self.authorize(req)).await
    }

    /// Send and require a 2xx status.
    async fn request(&self, req: RtspRequest) -> SessionResult<RtspResponse> {
        let resp = self.send(req).await?;
        if !resp.is_success() {
            return Err(SessionError::protocol(resp.status, format!("RTSP {}", resp.reason)));
        }
        if let Some(id) = resp.session_id() {
            *lock(&self.session_id) = Some(id);
        }
        Ok(resp)
    }

    async fn describe(&self) -> SessionResult<String> {
        let resp = self
            .request(RtspRequest::new("DESCRIBE", &self.url).header("Accept", "application/sdp"))
            .await?;
        let control = media_control(&resp.body).unwrap_or_default();
        *lock(&self.media_url) = Some(resolve_control(&self.url, &control));
        Ok(resp.body)
    }

    async fn open_stream(&self) -> SessionResult<StreamHandle> {
        let existing = lock(&self.media_url).clone();
        let media_url = match existing {
            Some(url) => url,
            None => {
                self.describe().await?;
                lock(&self.media_url).clone().unwrap_or_else(|| self.url.clone())
            }
        };
        self.request(RtspRequest::new("SETUP", media_url).header("Transport", INTERLEAVED_TRANSPORT))
            .await?;
        let rx = self.conn.attach_media(MEDIA_BUFFER);
        if let Err(e) = self
            .request(RtspRequest::new("PLAY", &self.url).header("Range", "npt=0.000-"))
            .await
        {
            self.conn.detach_media();
            return Err(e);
        }
        Ok(StreamHandle::new(rx))
    }

    fn require_session(&self, verb: &str) -> SessionResult<()> {
        if lock(&self.session_id).is_none() {
            return Err(SessionError::invalid_state(format!(
                "{} needs an open stream (use open-stream first)",
                verb
            )));
        }
        Ok(())
    }

    async fn run(&self, command: RtspCommand) -> SessionResult<Outcome> {
        match command {
            RtspCommand::Describe => self.describe().await.map(Outcome::Description),
            RtspCommand::OpenStream => self.open_stream().await.map(Outcome::Stream),
            RtspCommand::Play => {
                self.require_session("PLAY")?;
                self.request(RtspRequest::new("PLAY", &self.url)).await?;
                Ok(Outcome::Done)
            }
            RtspCommand::Pause => {
                self.require_session("PAUSE")?;
                self.request(RtspRequest::new("PAUSE", &self.url)).await?;
                Ok(Outcome::Done)
            }
            RtspCommand::Teardown => {
                self.teardown().await?;
                Ok(Outcome::Done)
            }
        }
    }

    async fn teardown(&self) -> SessionResult<()> {
        if lock(&self.session_id).is_none() {
            return Ok(());
        }
        let result = self.request(RtspRequest::new("TEARDOWN", &self.url)).await;
        lock(&self.session_id).take();
        self.conn.detach_media();
        result.map(|_| ())
    }
}

pub struct RtspSession {
    key: SessionKey,
    state: Arc<StateCell>,
    control: Mutex<Option<Arc<Control>>>,
    execute_timeout: Duration,
    stream_path: String,
}

impl RtspSession {
    pub fn new(key: SessionKey, execute_timeout: Duration) -> Self {
        Self::with_path(key, execute_timeout, DEFAULT_STREAM_PATH)
    }

    pub fn with_path(key: SessionKey, execute_timeout: Duration, stream_path: &str) -> Self {
        Self {
            state: Arc::new(StateCell::new(key.to_string())),
            key,
            control: Mutex::new(None),
            execute_timeout,
            stream_path: format!("/{}", stream_path.trim_start_matches('/')),
        }
    }

    fn control(&self) -> Option<Arc<Control>> {
        lock(&self.control).clone()
    }

    /// OPTIONS then DESCRIBE, so bad credentials surface at open time.
    async fn handshake(control: &Control) -> SessionResult<()> {
        let result = async {
            control.request(RtspRequest::new("OPTIONS", &control.url)).await?;
            control.describe().await.map(|_| ())
        }
        .await;
        match result {
            Err(e) if e.code == Some(401) => Err(SessionError::auth_rejected(format!(
                "{} rejected the stream credentials",
                control.url
            ))),
            other => other,
        }
    }
}

#[async_trait]
impl ProtocolSession for RtspSession {
    fn protocol(&self) -> Protocol {
        Protocol::Rtsp
    }

    fn state(&self) -> SessionState {
        self.state.get()
    }

    /// Frames reaching an open stream count as activity.
    fn idle_for(&self) -> Duration {
        let idle = self.state.idle_for();
        match self.control().and_then(|c| c.conn.media_idle_for()) {
            Some(media) => idle.min(media),
            None => idle,
        }
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
        let endpoint = device.endpoint(Protocol::Rtsp);
        let url = format!("rtsp://{}{}", endpoint, self.stream_path);
        let connect = async {
            let control = Control {
                conn: RtspConnection::connect(&endpoint).await?,
                url: url.clone(),
                auth: Mutex::new(Authenticator::new(credential.username, credential.secret)),
                media_url: Mutex::new(None),
                session_id: Mutex::new(None),
            };
            Self::handshake(&control).await?;
            Ok::<_, SessionError>(control)
        };

        match with_connect_timeout(connect_timeout, &endpoint, connect).await {
            Ok(control) => {
                let dropped = control.conn.closed_token();
                *lock(&self.control) = Some(Arc::new(control));
                self.state.transition(SessionState::Ready);

                let state = self.state.clone();
                let key = self.key.clone();
                tokio::spawn(async move {
                    dropped.cancelled().await;
                    if state.get() == SessionState::Ready {
                        log::warn!("{}: RTSP connection dropped", key);
                        state.transition(SessionState::Degraded);
                    }
                });
                log::info!("{}: RTSP session ready at {}", self.key, url);
                Ok(())
            }
            Err(e) => {
                self.state.transition(SessionState::Failed);
                log::warn!("{}: RTSP open failed: {}", self.key, e);
                Err(e)
            }
        }
    }

    async fn execute(&self, payload: Payload, cancel: CancellationToken) -> SessionResult<Outcome> {
        let command = match payload {
            Payload::Rtsp(command) => command,
            other => {
                return Err(SessionError::invalid_state(format!(
                    "{}: RTSP session cannot run a {} payload",
                    self.key,
                    other.protocol()
                )));
            }
        };
        let control = match (self.state.get(), self.control()) {
            (SessionState::Ready, Some(control)) => control,
            (state, _) => {
                return Err(SessionError::closed(format!("{}: session is {}", self.key, state)));
            }
        };
        self.state.touch();

        let state = self.state.clone();
        let limit = self.execute_timeout;
        let key = self.key.clone();
        run_detached(&cancel, async move {
            let result = with_timeout(limit, "RTSP request", control.run(command)).await;
            state.touch();
            if let Err(e) = &result {
                if e.is_connection_loss() {
                    state.transition(SessionState::Degraded);
                    log::warn!("{}: RTSP connection lost: {}", key, e);
                    if e.kind == SessionErrorKind::Timeout {
                        control.conn.shutdown().await;
                    }
                }
            }
            result
        })
        .await
    }

    async fn health_check(&self) -> bool {
        let control = match (self.state.get(), self.control()) {
            (SessionState::Ready, Some(control)) => control,
            _ => return false,
        };
        let probe = with_timeout(
            self.execute_timeout,
            "RTSP OPTIONS",
            control.request(RtspRequest::new("OPTIONS", &control.url)),
        )
        .await;
        match probe {
            Ok(_) => true,
            Err(e) => {
                log::warn!("{}: RTSP health probe failed: {}", self.key, e);
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
        let control = lock(&self.control).take();
        if let Some(control) = control {
            if !control.conn.is_closed() {
                let _ = tokio::time::timeout(CLOSE_GRACE, control.teardown()).await;
            }
            control.conn.shutdown().await;
        }
        self.state.transition(SessionState::Closed);
        log::debug!("{}: RTSP session closed", self.key);
    }

    fn mark_degraded(&self) {
        self.state.transition(SessionState::Degraded);
    }

    fn mark_failed(&self) {
        self.state.transition(SessionState::Failed);
    }
}
