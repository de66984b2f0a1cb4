//! Single-writer state store.
//!
//! ```text
//!  dispatch(Action) ──► unbounded mpsc ──► StoreLoop ── reduce() ──► watch<Arc<EngineState>>
//!                                                                         │
//!                                      snapshot() / subscribe() ◄────────┘
//! ```
//!
//! Actions apply strictly in arrival order. Readers never lock: a snapshot
//! is an `Arc` clone of the latest published state, and a slow subscriber
//! only ever sees the newest one.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::action::Action;
use crate::reducer::reduce;
use crate::state::EngineState;

/// Constructor for the store's two halves.
pub struct Store;

impl Store {
    pub fn new(initial: EngineState) -> (StoreHandle, StoreLoop) {
        let (tx, rx) = mpsc::unbounded_channel();
        let initial = Arc::new(initial);
        let (publisher, snapshots) = watch::channel(initial.clone());
        (
            StoreHandle { tx, snapshots },
            StoreLoop {
                rx,
                publisher,
                state: initial,
            },
        )
    }
}

/// Cheap, cloneable access to the store from any task.
#[derive(Clone)]
pub struct StoreHandle {
    tx: mpsc::UnboundedSender<Action>,
    snapshots: watch::Receiver<Arc<EngineState>>,
}

impl StoreHandle {
    /// Queue `action`; never blocks. Returns `false` once the loop is gone.
    pub fn dispatch(&self, action: Action) -> bool {
        match self.tx.send(action) {
            Ok(()) => true,
            Err(err) => {
                debug!(action = err.0.label(), "store loop stopped; action discarded");
                false
            }
        }
    }

    /// The latest published state.
    pub fn snapshot(&self) -> Arc<EngineState> {
        self.snapshots.borrow().clone()
    }

    /// A receiver that is notified on every published state.
    pub fn subscribe(&self) -> watch::Receiver<Arc<EngineState>> {
        self.snapshots.clone()
    }
}

/// The only writer of [`EngineState`].
pub struct StoreLoop {
    rx: mpsc::UnboundedReceiver<Action>,
    publisher: watch::Sender<Arc<EngineState>>,
    state: Arc<EngineState>,
}

impl StoreLoop {
    /// Apply actions until `cancel` fires, then drain what is already
    /// queued. Returns the final state.
    pub async fn run(mut self, cancel: CancellationToken) -> Arc<EngineState> {
        loop {
            tokio::select! {
                biased;
                maybe_action = self.rx.recv() => {
                    let Some(action) = maybe_action else { break };
                    self.apply(action);
                }
                _ = cancel.cancelled() => break,
            }
        }
        while let Ok(action) = self.rx.try_recv() {
            self.apply(action);
        }
        self.state
    }

    /// Reduce one action and publish the result. Returns whether it applied.
    pub fn apply(&mut self, action: Action) -> bool {
        if self.state.settings.log_actions {
            debug!(action = ?action, "applying action");
        } else {
            trace!(action = action.label(), "applying action");
        }
        match reduce(&self.state, &action) {
            Ok(next) => {
                self.state = Arc::new(next);
                self.publisher.send_replace(self.state.clone());
                true
            }
            Err(err) => {
                warn!(action = action.label(), error = %err, "dropping action");
                false
            }
        }
    }

    /// Apply the oldest queued action without waiting. `None` when the
    /// queue is empty.
    pub fn apply_next(&mut self) -> Option<bool> {
        let action = self.rx.try_recv().ok()?;
        Some(self.apply(action))
    }

    pub fn state(&self) -> Arc<EngineState> {
        self.state.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use devloop_core::{EngineSettings, TargetName};

    #[tokio::test]
    async fn snapshot_is_stable_without_dispatch() {
        let (handle, _loop) = Store::new(EngineState::new(EngineSettings::default(), Utc::now()));
        let a = handle.snapshot();
        let b = handle.snapshot();
        assert_eq!(a, b);
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn rejected_actions_do_not_publish() {
        let (handle, mut store) =
            Store::new(EngineState::new(EngineSettings::default(), Utc::now()));
        let before = handle.snapshot();
        assert!(!store.apply(Action::trigger(TargetName::from("ghost"))));
        assert!(Arc::ptr_eq(&before, &handle.snapshot()));
        assert_eq!(handle.snapshot().counters.actions_applied, 0);
    }

    #[tokio::test]
    async fn loop_applies_in_order_and_drains_on_cancel() {
        let (handle, store) = Store::new(EngineState::new(EngineSettings::default(), Utc::now()));
        let cancel = CancellationToken::new();
        for i in 0..5 {
            handle.dispatch(Action::error(
                crate::action::ErrorSource::Watcher,
                None,
                format!("event {i}"),
            ));
        }
        cancel.cancel();
        let final_state = store.run(cancel).await;
        let messages: Vec<&str> = final_state
            .recent_errors
            .iter()
            .map(|e| e.message.as_str())
            .collect();
        assert_eq!(messages, vec!["event 0", "event 1", "event 2", "event 3", "event 4"]);
        assert_eq!(final_state.counters.actions_applied, 5);
    }
}
