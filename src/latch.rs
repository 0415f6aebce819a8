//! Signalling primitives shared between the handshake and the player thread.

use std::sync::{Condvar, Mutex};
use std::time::Duration;
use tokio::sync::watch;

/// A settable/clearable readiness latch awaited from async code.
///
/// The value is held by a `watch` channel, so a `set()` always happens-before
/// any waiter that observes it, and a waiter that subscribes after the `set()`
/// still sees it.
#[derive(Debug)]
pub struct Latch {
    tx: watch::Sender<bool>,
}

impl Latch {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    pub fn set(&self) {
        self.tx.send_replace(true);
    }

    pub fn clear(&self) {
        self.tx.send_replace(false);
    }

    pub fn is_set(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once the latch is set.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|set| *set).await;
    }

    /// Returns `false` if `timeout` elapsed first.
    pub async fn wait_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait()).await.is_ok()
    }
}

impl Default for Latch {
    fn default() -> Self {
        Self::new()
    }
}

/// A blocking flag for OS threads, set and cleared from the async side.
#[derive(Debug, Default)]
pub struct ThreadFlag {
    state: Mutex<bool>,
    cond: Condvar,
}

impl ThreadFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        *state = true;
        self.cond.notify_all();
    }

    pub fn clear(&self) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = false;
    }

    pub fn is_set(&self) -> bool {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Blocks for at most `timeout`; returns whether the flag is set.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let (state, _) = self
            .cond
            .wait_timeout_while(state, timeout, |set| !*set)
            .unwrap_or_else(|e| e.into_inner());
        *state
    }
}
