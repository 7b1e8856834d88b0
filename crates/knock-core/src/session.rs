//! The capability interface every protocol adapter implements, plus the
//! cancellation/timeout helpers the adapters share.

use crate::error::{SessionError, SessionResult};
use crate::payload::{Outcome, Payload};
use crate::types::{Credential, DeviceDescriptor, Protocol, SessionKey, SessionState};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// One live connection to one device over one protocol.
///
/// All methods take `&self`; adapters keep their connection behind interior
/// locks so a session can be shared as a [`SessionRef`].
#[async_trait]
pub trait ProtocolSession: Send + Sync {
    fn protocol(&self) -> Protocol;

    /// Snapshot of the current lifecycle state.
    fn state(&self) -> SessionState;

    /// Time since the last `execute` (or since becoming Ready).
    fn idle_for(&self) -> Duration;

    /// Connect and authenticate. Must resolve within `connect_timeout`.
    async fn open(
        &self,
        device: &DeviceDescriptor,
        credential: Credential,
        connect_timeout: Duration,
    ) -> SessionResult<()>;

    /// Run one request. Returns `Cancelled` as soon as `cancel` fires, even
    /// if the wire call is still outstanding.
    async fn execute(&self, payload: Payload, cancel: CancellationToken) -> SessionResult<Outcome>;

    /// Cheap liveness probe. A failed probe moves the session to Degraded.
    async fn health_check(&self) -> bool;

    /// Idempotent; always ends in Closed and releases the connection.
    async fn close(&self);

    /// Flag the session unhealthy after a mid-session connection loss.
    fn mark_degraded(&self);

    /// Final failure after reconnection was given up.
    fn mark_failed(&self);
}

pub type SessionRef = Arc<dyn ProtocolSession>;

/// Builds fresh, unopened sessions for a key.
pub trait SessionFactory: Send + Sync {
    fn create(&self, key: &SessionKey) -> SessionRef;
}

/// Run `fut` on its own task and wait for it or for `cancel`.
///
/// On cancellation the task keeps running until its own timeout fires, so
/// the adapter's connection lock stays held and the wire stays consistent.
pub async fn run_detached<T, F>(cancel: &CancellationToken, fut: F) -> SessionResult<T>
where
    T: Send + 'static,
    F: Future<Output = SessionResult<T>> + Send + 'static,
{
    if cancel.is_cancelled() {
        return Err(SessionError::cancelled());
    }
    let task = tokio::spawn(fut);
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(SessionError::cancelled()),
        joined = task => match joined {
            Ok(result) => result,
            Err(e) => Err(SessionError::closed(format!("session task aborted: {}", e))),
        },
    }
}

/// Bound a request by the execute timeout.
pub async fn with_timeout<T, F>(limit: Duration, what: &str, fut: F) -> SessionResult<T>
where
    F: Future<Output = SessionResult<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(SessionError::timeout(format!(
            "{} did not complete within {:?}",
            what, limit
        ))),
    }
}

/// Bound an `open` by the connect timeout, reporting `ConnectTimeout`.
pub async fn with_connect_timeout<T, F>(limit: Duration, endpoint: &str, fut: F) -> SessionResult<T>
where
    F: Future<Output = SessionResult<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(SessionError::connect_timeout(format!(
            "connect to {} timed out after {:?}",
            endpoint, limit
        ))),
    }
}
