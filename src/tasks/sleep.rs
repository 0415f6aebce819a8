use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// A cancellable sleep until a wall-clock deadline that can be moved while
/// someone waits on it.
#[derive(Debug)]
pub struct SleepHandle {
    deadline: watch::Sender<Instant>,
    // None while pending, then Some(true) when elapsed or Some(false) when cancelled
    outcome: Arc<watch::Sender<Option<bool>>>,
    timer: JoinHandle<()>,
}

fn to_instant(at: DateTime<Utc>) -> Instant {
    let delta = (at - Utc::now()).to_std().unwrap_or_default();
    Instant::now() + delta
}

impl SleepHandle {
    pub fn new(at: DateTime<Utc>) -> Self {
        let (deadline, mut deadline_rx) = watch::channel(to_instant(at));
        let (outcome, _) = watch::channel(None);
        let outcome = Arc::new(outcome);

        let done = outcome.clone();
        let timer = tokio::spawn(async move {
            loop {
                let until = *deadline_rx.borrow_and_update();
                tokio::select! {
                    _ = tokio::time::sleep_until(until) => {
                        done.send_replace(Some(true));
                        return;
                    }
                    changed = deadline_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }
            }
        });

        Self { deadline, outcome, timer }
    }

    /// Moves the deadline. No effect once the handle is done.
    pub fn recalculate(&self, at: DateTime<Utc>) {
        if !self.done() {
            self.deadline.send_replace(to_instant(at));
        }
    }

    /// Resolves to `true` when the deadline passed, `false` when cancelled.
    pub async fn wait(&self) -> bool {
        let mut rx = self.outcome.subscribe();
        rx.wait_for(Option::is_some)
            .await
            .map(|outcome| outcome.unwrap_or(false))
            .unwrap_or(false)
    }

    pub fn done(&self) -> bool {
        self.outcome.borrow().is_some()
    }

    pub fn cancel(&self) {
        self.timer.abort();
        self.outcome.send_if_modified(|outcome| {
            if outcome.is_none() {
                *outcome = Some(false);
                true
            } else {
                false
            }
        });
    }
}

impl Drop for SleepHandle {
    fn drop(&mut self) {
        self.timer.abort();
    }
}
