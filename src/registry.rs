//! Session Registry: the process-wide map of live sessions.
//!
//! At most one non-terminal session exists per [`SessionKey`]. While a key
//! is being opened its slot holds a shared future, so concurrent callers
//! all wait on the one open and see the same outcome.

use crate::error::{OrchestratorError, OrchestratorResult};
use futures::future::{BoxFuture, FutureExt, Shared};
use knock_core::{SessionKey, SessionRef, SessionState};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info};

type OpenFuture = Shared<BoxFuture<'static, OrchestratorResult<SessionRef>>>;

enum Slot {
    Opening { generation: u64, open: OpenFuture },
    Live { session: SessionRef },
}

type SlotMap = Arc<Mutex<HashMap<SessionKey, Slot>>>;

fn lock(slots: &SlotMap) -> MutexGuard<'_, HashMap<SessionKey, Slot>> {
    slots.lock().unwrap_or_else(|p| p.into_inner())
}

#[derive(Default)]
pub struct SessionRegistry {
    slots: SlotMap,
    next_generation: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the live session for `key`, or run `open` and register its
    /// result. `open` runs on its own task, so it completes even when every
    /// waiter gives up.
    pub async fn get_or_create<F, Fut>(&self, key: &SessionKey, open: F) -> OrchestratorResult<SessionRef>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = OrchestratorResult<SessionRef>> + Send + 'static,
    {
        let pending = {
            let mut slots = lock(&self.slots);
            match slots.get(key) {
                Some(Slot::Live { session }) if !session.state().is_terminal() => {
                    return Ok(session.clone());
                }
                Some(Slot::Opening { open, .. }) => open.clone(),
                _ => {
                    let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                    let pending = self.spawn_open(key.clone(), generation, open());
                    slots.insert(
                        key.clone(),
                        Slot::Opening {
                            generation,
                            open: pending.clone(),
                        },
                    );
                    pending
                }
            }
        };
        pending.await
    }

    fn spawn_open<Fut>(&self, key: SessionKey, generation: u64, open: Fut) -> OpenFuture
    where
        Fut: Future<Output = OrchestratorResult<SessionRef>> + Send + 'static,
    {
        let slots = self.slots.clone();
        let task = tokio::spawn(async move {
            let result = open.await;
            let orphan = {
                let mut map = lock(&slots);
                let ours = matches!(map.get(&key), Some(Slot::Opening { generation: g, .. }) if *g == generation);
                match (&result, ours) {
                    (Ok(session), true) => {
                        map.insert(key.clone(), Slot::Live { session: session.clone() });
                        None
                    }
                    (Err(_), true) => {
                        map.remove(&key);
                        None
                    }
                    // Removed (disconnect or shutdown) while the open was running.
                    (Ok(session), false) => Some(session.clone()),
                    (Err(_), false) => None,
                }
            };
            match orphan {
                Some(session) => {
                    debug!(key = %key, "open finished after removal, closing");
                    session.close().await;
                    Err(OrchestratorError::SessionUnavailable(format!(
                        "{} was disconnected while opening",
                        key
                    )))
                }
                None => result,
            }
        });
        async move {
            match task.await {
                Ok(result) => result,
                Err(e) => Err(OrchestratorError::SessionUnavailable(format!("open task failed: {}", e))),
            }
        }
        .boxed()
        .shared()
    }

    /// The live session for `key`, if any.
    pub fn get(&self, key: &SessionKey) -> Option<SessionRef> {
        match lock(&self.slots).get(key) {
            Some(Slot::Live { session }) => Some(session.clone()),
            _ => None,
        }
    }

    pub fn contains(&self, key: &SessionKey) -> bool {
        lock(&self.slots).contains_key(key)
    }

    /// Whether `session` is the instance currently registered for `key`.
    pub fn is_current(&self, key: &SessionKey, session: &SessionRef) -> bool {
        matches!(lock(&self.slots).get(key), Some(Slot::Live { session: s }) if Arc::ptr_eq(s, session))
    }

    /// Drop the entry for `key`, live or opening. Returns the live session
    /// for the caller to close.
    pub fn remove(&self, key: &SessionKey) -> Option<SessionRef> {
        match lock(&self.slots).remove(key) {
            Some(Slot::Live { session }) => Some(session),
            _ => None,
        }
    }

    /// Remove `key` only while it still maps to `session`.
    pub fn remove_if_current(&self, key: &SessionKey, session: &SessionRef) -> bool {
        let mut slots = lock(&self.slots);
        if matches!(slots.get(key), Some(Slot::Live { session: s }) if Arc::ptr_eq(s, session)) {
            slots.remove(key);
            return true;
        }
        false
    }

    /// Replace `old` with `new` under `key`. Fails if `old` is no longer the
    /// registered instance.
    pub fn swap(&self, key: &SessionKey, old: &SessionRef, new: SessionRef) -> bool {
        let mut slots = lock(&self.slots);
        match slots.get_mut(key) {
            Some(Slot::Live { session }) if Arc::ptr_eq(session, old) => {
                *session = new;
                true
            }
            _ => false,
        }
    }

    /// Close and remove Ready sessions idle for longer than `max_idle`.
    pub async fn evict_idle(&self, max_idle: Duration) -> Vec<SessionKey> {
        let evicted: Vec<(SessionKey, SessionRef)> = {
            let mut slots = lock(&self.slots);
            let stale: Vec<SessionKey> = slots
                .iter()
                .filter_map(|(key, slot)| match slot {
                    Slot::Live { session }
                        if session.state() == SessionState::Ready && session.idle_for() > max_idle =>
                    {
                        Some(key.clone())
                    }
                    _ => None,
                })
                .collect();
            stale
                .into_iter()
                .filter_map(|key| match slots.remove(&key) {
                    Some(Slot::Live { session }) => Some((key, session)),
                    _ => None,
                })
                .collect()
        };

        for (key, session) in &evicted {
            debug!(key = %key, idle = ?session.idle_for(), "evicting idle session");
            session.close().await;
        }
        if !evicted.is_empty() {
            info!(count = evicted.len(), "registry: evicted idle sessions");
        }
        evicted.into_iter().map(|(key, _)| key).collect()
    }

    /// Live sessions, for health probing.
    pub fn live(&self) -> Vec<(SessionKey, SessionRef)> {
        lock(&self.slots)
            .iter()
            .filter_map(|(key, slot)| match slot {
                Slot::Live { session } => Some((key.clone(), session.clone())),
                _ => None,
            })
            .collect()
    }

    /// `(key, state)` pairs sorted by key; opening slots report Connecting.
    pub fn snapshot(&self) -> Vec<(SessionKey, SessionState)> {
        let mut out: Vec<_> = lock(&self.slots)
            .iter()
            .map(|(key, slot)| match slot {
                Slot::Live { session } => (key.clone(), session.state()),
                Slot::Opening { .. } => (key.clone(), SessionState::Connecting),
            })
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Empty the registry, returning every live session.
    pub fn drain(&self) -> Vec<(SessionKey, SessionRef)> {
        lock(&self.slots)
            .drain()
            .filter_map(|(key, slot)| match slot {
                Slot::Live { session } => Some((key, session)),
                Slot::Opening { .. } => None,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.slots).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use knock_core::{
        CancellationToken, Credential, DeviceDescriptor, Outcome, Payload, Protocol, ProtocolSession, SessionError,
        SessionResult, StateCell,
    };
    use std::sync::atomic::AtomicUsize;

    struct StubSession {
        state: StateCell,
        closes: AtomicUsize,
    }

    impl StubSession {
        fn ready() -> Arc<Self> {
            let s = Arc::new(Self {
                state: StateCell::new("stub"),
                closes: AtomicUsize::new(0),
            });
            s.state.transition(SessionState::Connecting);
            s.state.transition(SessionState::Ready);
            s
        }
    }

    #[async_trait]
    impl ProtocolSession for StubSession {
        fn protocol(&self) -> Protocol {
            Protocol::Ftp
        }
        fn state(&self) -> SessionState {
            self.state.get()
        }
        fn idle_for(&self) -> Duration {
            self.state.idle_for()
        }
        async fn open(&self, _: &DeviceDescriptor, _: Credential, _: Duration) -> SessionResult<()> {
            Ok(())
        }
        async fn execute(&self, _: Payload, _: CancellationToken) -> SessionResult<Outcome> {
            self.state.touch();
            Ok(Outcome::Done)
        }
        async fn health_check(&self) -> bool {
            true
        }
        async fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
            self.state.transition(SessionState::Closed);
        }
        fn mark_degraded(&self) {
            self.state.transition(SessionState::Degraded);
        }
        fn mark_failed(&self) {
            self.state.transition(SessionState::Failed);
        }
    }

    fn key() -> SessionKey {
        SessionKey::new("D1", Protocol::Ftp)
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_open() {
        let registry = Arc::new(SessionRegistry::new());
        let opens = Arc::new(AtomicUsize::new(0));
        let mut joins = Vec::new();
        for _ in 0..8 {
            let (registry, opens) = (registry.clone(), opens.clone());
            joins.push(tokio::spawn(async move {
                registry
                    .get_or_create(&key(), || async move {
                        opens.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok(StubSession::ready() as SessionRef)
                    })
                    .await
            }));
        }
        let mut sessions = Vec::new();
        for j in joins {
            sessions.push(j.await.unwrap().unwrap());
        }
        assert_eq!(opens.load(Ordering::SeqCst), 1);
        assert!(sessions.iter().all(|s| Arc::ptr_eq(s, &sessions[0])));
        assert_eq!(registry.snapshot(), vec![(key(), SessionState::Ready)]);
    }

    #[tokio::test]
    async fn failed_open_leaves_no_entry() {
        let registry = SessionRegistry::new();
        let err = registry
            .get_or_create(&key(), || async { Err(OrchestratorError::ConnectFailed(SessionError::unreachable("refused"))) })
            .await
            .err().unwrap();
        assert!(matches!(err, OrchestratorError::ConnectFailed(_)));
        assert!(!registry.contains(&key()));
    }

    #[tokio::test]
    async fn terminal_session_is_replaced() {
        let registry = SessionRegistry::new();
        let first = registry
            .get_or_create(&key(), || async { Ok(StubSession::ready() as SessionRef) })
            .await
            .unwrap();
        first.close().await;
        let second = registry
            .get_or_create(&key(), || async { Ok(StubSession::ready() as SessionRef) })
            .await
            .unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn removal_during_open_closes_the_orphan() {
        let registry = Arc::new(SessionRegistry::new());
        let stub = StubSession::ready();
        let opened = stub.clone();
        let r = registry.clone();
        let waiter = tokio::spawn(async move {
            r.get_or_create(&key(), || async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(opened as SessionRef)
            })
            .await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(registry.remove(&key()).is_none());
        let err = waiter.await.unwrap().err().unwrap();
        assert!(matches!(err, OrchestratorError::SessionUnavailable(_)));
        assert_eq!(stub.closes.load(Ordering::SeqCst), 1);
        assert!(!registry.contains(&key()));
    }

    #[tokio::test]
    async fn swap_requires_current_instance() {
        let registry = SessionRegistry::new();
        let old = registry
            .get_or_create(&key(), || async { Ok(StubSession::ready() as SessionRef) })
            .await
            .unwrap();
        let stranger: SessionRef = StubSession::ready();
        assert!(!registry.swap(&key(), &stranger, StubSession::ready()));
        let new: SessionRef = StubSession::ready();
        assert!(registry.swap(&key(), &old, new.clone()));
        assert!(registry.is_current(&key(), &new));
        assert!(!registry.remove_if_current(&key(), &old));
        assert!(registry.remove_if_current(&key(), &new));
    }

    #[tokio::test]
    async fn evicts_only_idle_ready_sessions() {
        let registry = SessionRegistry::new();
        let idle = registry
            .get_or_create(&key(), || async { Ok(StubSession::ready() as SessionRef) })
            .await
            .unwrap();
        let busy_key = SessionKey::new("D2", Protocol::Ftp);
        let busy = registry
            .get_or_create(&busy_key, || async { Ok(StubSession::ready() as SessionRef) })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        busy.execute(Payload::from_verb("list-files", "/").unwrap(), CancellationToken::new())
            .await
            .unwrap();

        let evicted = registry.evict_idle(Duration::from_millis(30)).await;
        assert_eq!(evicted, vec![key()]);
        assert_eq!(idle.state(), SessionState::Closed);
        assert!(!registry.contains(&key()));
        assert!(registry.contains(&busy_key));
    }
}
