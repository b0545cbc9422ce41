//! The Waiter Set (C7, spec §4.7): pending "wake me at version ≥ v" completions,
//! fired by the polling loop, plus the `result`/`error`/`handled` observer
//! broadcast (spec §9 "Observer pattern").

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::sync::Mutex;

use crate::error::EngineError;
use crate::event::Event;
use crate::queue::EventQueue;

const CHANNEL_CAPACITY: usize = 1;
const OBSERVER_CAPACITY: usize = 256;

/// What happened to an event, broadcast to every caller awaiting its version.
#[derive(Clone)]
enum Outcome {
    Success(Arc<Event>),
    Failure(Arc<Event>),
}

/// An observer notification (spec §4.7, §9).
#[derive(Clone)]
pub enum Notification {
    /// A model's reducer/applier/deriver output, emitted for every successful event.
    Result(Arc<Event>),
    /// Emitted for every event that committed with an `error` map.
    Error(Arc<Event>),
    /// Emitted for every event once it's been handled, success or failure.
    Handled(Arc<Event>),
}

/// Registry of pending "wake me at version ≥ v" completions (spec §4.7).
pub struct WaiterSet {
    channels: Mutex<BTreeMap<i64, broadcast::Sender<Outcome>>>,
    observers: broadcast::Sender<Notification>,
}

impl WaiterSet {
    pub fn new() -> Self {
        WaiterSet {
            channels: Mutex::new(BTreeMap::new()),
            observers: broadcast::channel(OBSERVER_CAPACITY).0,
        }
    }

    /// Subscribe to `result`/`error`/`handled` notifications. Multiple
    /// subscribers are independent hot observables (no backfill), matching
    /// the teacher-adjacent `EventDispatcher::subscribe` shape.
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.observers.subscribe()
    }

    /// Registers interest in version `v`; idempotent per `v` - concurrent
    /// callers waiting on the same version share the underlying channel.
    /// Resolves with the processed event on success, or rejects with
    /// `EngineError::EventFailed` if it committed with an error.
    pub async fn register(&self, v: i64) -> impl std::future::Future<Output = Result<Event, EngineError>> {
        let mut receiver = {
            let mut channels = self.channels.lock().await;
            let sender = channels
                .entry(v)
                .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
                .clone();
            sender.subscribe()
        };

        async move {
            match receiver.recv().await {
                Ok(Outcome::Success(event)) => Ok((*event).clone()),
                Ok(Outcome::Failure(event)) => Err(EngineError::EventFailed(Box::new((*event).clone()))),
                Err(_) => Err(EngineError::Closed(v)),
            }
        }
    }

    /// Fires the waiter for `event.v`, sweeps any waiters left behind for
    /// earlier versions (spec §4.7: "If event.v ≥ maxWaitingFor, sweep all
    /// waiters with v ≤ event.v: re-read each from the queue ... and fulfill
    /// accordingly"), and emits observer notifications. Swallows errors from
    /// this function's own broadcast sends (no receivers is not an error).
    pub async fn notify(&self, event: &Event, queue: &dyn EventQueue) {
        let event_arc = Arc::new(event.clone());
        self.fire(event.v, event_arc.clone()).await;

        let max_waiting_for = {
            let channels = self.channels.lock().await;
            channels.keys().next_back().copied()
        };

        if let Some(max_v) = max_waiting_for {
            if event.v >= max_v {
                let pending: Vec<i64> = {
                    let channels = self.channels.lock().await;
                    channels.keys().filter(|&&v| v <= event.v).copied().collect()
                };

                for v in pending {
                    if let Ok(Some(stale)) = queue.get(v).await {
                        self.fire(v, Arc::new(stale)).await;
                    }
                }
            }
        }

        let notification = if event.is_error() {
            Notification::Error(event_arc.clone())
        } else {
            Notification::Result(event_arc.clone())
        };
        let _ = self.observers.send(notification);
        let _ = self.observers.send(Notification::Handled(event_arc));
    }

    /// Drops every pending waiter's sender, so any in-flight `register(v)`
    /// wakes with `EngineError::Closed` instead of hanging forever (spec:
    /// `Engine::close` must not strand callers).
    pub async fn close(&self) {
        self.channels.lock().await.clear();
    }

    /// Drops a single registered waiter without firing it, for a caller that
    /// registered `v` and then found the event already resolved by some other
    /// path (e.g. a direct queue read that raced the registration) - without
    /// this the channel for `v` would sit in the map until a `notify` for
    /// that exact version happens to sweep it, which may never come again.
    pub async fn forget(&self, v: i64) {
        self.channels.lock().await.remove(&v);
    }

    async fn fire(&self, v: i64, event: Arc<Event>) {
        let mut channels = self.channels.lock().await;
        if let Some(sender) = channels.remove(&v) {
            let outcome = if event.is_error() {
                Outcome::Failure(event)
            } else {
                Outcome::Success(event)
            };
            let _ = sender.send(outcome);
        }
    }
}

impl Default for WaiterSet {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::SqliteEventQueue;
    use serde_json::json;
    use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

    async fn memory_queue() -> SqliteEventQueue {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(SqliteConnectOptions::new().in_memory(true))
            .await
            .unwrap();
        SqliteEventQueue::new(pool).await.unwrap()
    }

    #[tokio::test]
    async fn resolves_on_success() {
        let waiters = WaiterSet::new();
        let queue = memory_queue().await;

        let wait = waiters.register(1).await;
        let mut event = Event::new(1, "ADD", json!({}), 0);
        event.result = Some(Default::default());

        waiters.notify(&event, &queue).await;
        assert_eq!(wait.await.unwrap().v, 1);
    }

    #[tokio::test]
    async fn rejects_on_error() {
        let waiters = WaiterSet::new();
        let queue = memory_queue().await;

        let wait = waiters.register(1).await;
        let mut event = Event::new(1, "ADD", json!({}), 0);
        event.push_error("_handle", "boom");

        waiters.notify(&event, &queue).await;
        match wait.await {
            Err(EngineError::EventFailed(failed)) => assert_eq!(failed.v, 1),
            other => panic!("expected EventFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn multiple_waiters_on_same_version_both_resolve() {
        let waiters = WaiterSet::new();
        let queue = memory_queue().await;

        let wait_a = waiters.register(3).await;
        let wait_b = waiters.register(3).await;

        let mut event = Event::new(3, "ADD", json!({}), 0);
        event.result = Some(Default::default());
        waiters.notify(&event, &queue).await;

        assert_eq!(wait_a.await.unwrap().v, 3);
        assert_eq!(wait_b.await.unwrap().v, 3);
    }
}
