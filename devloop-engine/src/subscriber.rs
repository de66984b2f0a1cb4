//! Snapshot fan-out to independently scheduled subscribers.
//!
//! ```text
//!  StoreLoop ── watch<Arc<EngineState>> ──┬──► worker 1 ──► sub1.on_change() ──► dispatch(actions)
//!                                         ├──► worker 2 ──► sub2.on_change()
//!                                         └──► worker N ──► subN.on_change()
//! ```
//!
//! Each subscriber gets its own task. A subscriber that is still busy when
//! several snapshots are published sees only the newest one afterwards.
//! Polling subscribers are additionally woken on their interval. A panic
//! inside `on_change` is caught and logged; the worker keeps going.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::action::Action;
use crate::state::EngineState;
use crate::store::StoreHandle;

#[async_trait]
pub trait Subscriber: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// Also run this often when nothing changed. `None` means purely
    /// snapshot-driven.
    fn poll_interval(&self) -> Option<Duration> {
        None
    }

    /// React to the latest state. Returned actions are dispatched in order.
    async fn on_change(&self, store: &StoreHandle, state: Arc<EngineState>) -> Vec<Action>;

    /// Called once after the worker stops receiving snapshots.
    async fn on_shutdown(&self) {}
}

pub struct SubscriberPool {
    workers: Vec<(&'static str, JoinHandle<()>)>,
}

impl SubscriberPool {
    /// Spawn one worker per subscriber. Workers run until `cancel` fires.
    pub fn spawn(
        subscribers: Vec<Arc<dyn Subscriber>>,
        store: StoreHandle,
        cancel: CancellationToken,
    ) -> Self {
        let workers = subscribers
            .into_iter()
            .map(|sub| {
                let name = sub.name();
                let handle = tokio::spawn(worker(sub, store.clone(), cancel.clone()));
                (name, handle)
            })
            .collect();
        Self { workers }
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Wait for every worker to finish. Call after cancelling the token.
    pub async fn shutdown(self) {
        for (name, handle) in self.workers {
            if let Err(err) = handle.await {
                error!(subscriber = name, error = %err, "subscriber worker failed");
            }
        }
    }
}

async fn worker(sub: Arc<dyn Subscriber>, store: StoreHandle, cancel: CancellationToken) {
    let name = sub.name();
    let mut snapshots = store.subscribe();
    let mut ticker = sub.poll_interval().map(|period| {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        interval
    });
    debug!(subscriber = name, "subscriber started");

    loop {
        let state = snapshots.borrow_and_update().clone();
        let outcome = AssertUnwindSafe(sub.on_change(&store, state))
            .catch_unwind()
            .await;
        match outcome {
            Ok(actions) => {
                for action in actions {
                    store.dispatch(action);
                }
            }
            Err(panic) => {
                error!(subscriber = name, panic = %panic_message(&*panic), "subscriber panicked");
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = next_tick(&mut ticker) => {}
        }
    }

    sub.on_shutdown().await;
    debug!(subscriber = name, "subscriber stopped");
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&'static str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
