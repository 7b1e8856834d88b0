//! Session state cell shared by the protocol adapters.
//!
//! Each adapter owns one `StateCell`; the registry and supervisor only ever
//! read snapshots through `ProtocolSession::state`.

use crate::types::SessionState;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

struct Inner {
    state: SessionState,
    last_activity: Instant,
}

pub struct StateCell {
    label: String,
    inner: Mutex<Inner>,
}

impl StateCell {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            inner: Mutex::new(Inner {
                state: SessionState::Idle,
                last_activity: Instant::now(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn get(&self) -> SessionState {
        self.lock().state
    }

    /// Apply `next` if the state machine allows it. Returns whether it did.
    pub fn transition(&self, next: SessionState) -> bool {
        let mut inner = self.lock();
        let prev = inner.state;
        if prev == next {
            return true;
        }
        if !prev.can_transition_to(next) {
            log::debug!("{}: ignoring transition {} -> {}", self.label, prev, next);
            return false;
        }
        inner.state = next;
        if next == SessionState::Ready {
            inner.last_activity = Instant::now();
        }
        log::debug!("{}: {} -> {}", self.label, prev, next);
        true
    }

    /// Record caller activity for idle eviction.
    pub fn touch(&self) {
        self.lock().last_activity = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.lock().last_activity.elapsed()
    }
}
