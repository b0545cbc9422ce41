//! The public engine surface: wires the queue, registry, version oracle,
//! waiter set and polling loop together (spec §5 "Shared resources").

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::error::EngineError;
use crate::event::Event;
use crate::model::Model;
use crate::options::{EngineOptions, QueueLocation};
use crate::polling::PollingLoop;
use crate::queue::{EventQueue, SqliteEventQueue};
use crate::registry::ModelRegistry;
use crate::store::{self, StoreHandles, StoreLocation};
use crate::version::VersionOracle;
use crate::waiter::{Notification, WaiterSet};

/// An event-sourced engine: a durable, gap-free queue of events, a set of
/// user-defined models that derive table state from them, and a background
/// loop that drives every event through the pipeline in order.
pub struct Engine {
    queue: Arc<dyn EventQueue>,
    store: Arc<StoreHandles>,
    waiters: Arc<WaiterSet>,
    version: Arc<VersionOracle>,
    shutdown: watch::Sender<bool>,
    loop_handle: Mutex<Option<JoinHandle<Result<(), EngineError>>>>,
}

impl Engine {
    /// Opens the store, validates and registers `models`, and spawns the
    /// polling loop starting just after the last persisted `user_version`
    /// (spec §4.3: the version is the durable high-water mark used to resume
    /// after a restart).
    pub async fn new(options: EngineOptions, models: Vec<Arc<dyn Model>>) -> Result<Self, EngineError> {
        let store = Arc::new(StoreHandles::open(options.store.clone()).await?);

        let queue_shares_rw_connection = matches!(options.queue, QueueLocation::SameAsStore);
        let queue_pool = match &options.queue {
            QueueLocation::SameAsStore => store.queue.clone(),
            QueueLocation::File(path) => {
                store::open_pool(&StoreLocation::File(path.clone()), 1, false).await?
            }
        };
        let queue: Arc<dyn EventQueue> =
            Arc::new(SqliteEventQueue::with_poll_interval(queue_pool, options.poll_interval).await?);

        let registry = Arc::new(ModelRegistry::new(models)?);
        let waiters = Arc::new(WaiterSet::new());
        let version = Arc::new(VersionOracle::new(store.ro.clone()));

        let start_v = version
            .get()
            .await
            .map_err(|e| EngineError::Sqlx(sqlx::Error::Protocol(e.to_string())))?;

        let polling_loop = PollingLoop::new(
            queue.clone(),
            registry,
            store.clone(),
            waiters.clone(),
            options.recursion_limit,
            options.max_retry,
            options.backoff_base_ms,
            queue_shares_rw_connection,
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let loop_handle = tokio::spawn(async move { polling_loop.run(start_v, shutdown_rx).await });

        Ok(Engine {
            queue,
            store,
            waiters,
            version,
            shutdown: shutdown_tx,
            loop_handle: Mutex::new(Some(loop_handle)),
        })
    }

    /// Appends a new event and returns it immediately, without waiting for
    /// the polling loop to process it. Most callers want [`Engine::dispatch`]
    /// instead; this is the bare `queue.add` (spec §4.1) for callers that
    /// only need the reserved `v` and don't care when it settles. `ts`
    /// defaults to wall-clock time when omitted (spec §4.1: "ts?").
    pub async fn enqueue(&self, kind: &str, data: Value, ts: Option<i64>) -> Result<Event, EngineError> {
        let ts = ts.unwrap_or_else(|| chrono::Utc::now().timestamp());
        Ok(self.queue.add(kind, data, ts).await?)
    }

    /// Appends a new event and returns a future that resolves once the
    /// polling loop has processed it (spec §4.5, §6: "dispatch(type, data,
    /// ts?) → future<Event>"), rejecting with `EventFailed` if it committed
    /// with an error.
    pub async fn dispatch(&self, kind: &str, data: Value, ts: Option<i64>) -> Result<Event, EngineError> {
        let event = self.enqueue(kind, data, ts).await?;
        self.handled_version(event.v).await
    }

    /// Waits for whatever is the latest enqueued version *as of this call*
    /// to be handled (spec §6: "waitForQueue() → future<Event>") - useful for
    /// draining the queue without dispatching a new event.
    pub async fn wait_for_queue(&self) -> Result<Event, EngineError> {
        let latest = self.queue.latest_version().await?;
        self.handled_version(latest).await
    }

    /// Waits for version `v` to be handled, resolving with the processed
    /// event (spec §6: "handledVersion(v) → future<Event>"). Checks the
    /// queue directly first, in case `v` was already processed before this
    /// call registered a waiter (spec §4.7's sweep exists for the same race).
    ///
    /// Registration itself doesn't close the race: the polling loop can
    /// commit and notify `v` between that first check and the broadcast
    /// subscription `register` sets up, and a notify with no subscriber
    /// listening is lost - the sweep in `WaiterSet::notify` only rescues a
    /// waiter when a *later* version is notified afterwards, which never
    /// happens for the last event dispatched. So the queue is checked again
    /// right after registering, before awaiting the registered future.
    pub async fn handled_version(&self, v: i64) -> Result<Event, EngineError> {
        if let Some(existing) = self.queue.get(v).await? {
            if existing.is_error() {
                return Err(EngineError::EventFailed(Box::new(existing)));
            }
            if existing.result.is_some() {
                return Ok(existing);
            }
        }

        let waiter = self.waiters.register(v).await;

        if let Some(existing) = self.queue.get(v).await? {
            if existing.is_error() {
                self.waiters.forget(v).await;
                return Err(EngineError::EventFailed(Box::new(existing)));
            }
            if existing.result.is_some() {
                self.waiters.forget(v).await;
                return Ok(existing);
            }
        }

        waiter.await
    }

    /// The persisted `user_version`: the highest version whose effects are
    /// durably reflected in the RW store's tables (spec §4.3). Unlike
    /// [`Engine::handled_version`], this never waits - it reads the oracle as-is.
    pub async fn persisted_version(&self) -> Result<i64, EngineError> {
        self.version
            .get()
            .await
            .map_err(|e| EngineError::Sqlx(sqlx::Error::Protocol(e.to_string())))
    }

    /// Subscribes to `result`/`error`/`handled` notifications for every event
    /// the polling loop processes from here on (spec §4.7, §9 observer pattern).
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Notification> {
        self.waiters.subscribe()
    }

    /// Stops the polling loop, wakes any pending waiters with
    /// `EngineError::Closed`, and closes the underlying store handles.
    ///
    /// If the loop had already given up (`EngineError::GivingUp`, spec
    /// §4.6/§9: "a fatal error from the loop is reported out-of-band") before
    /// this call, that error is logged here rather than silently discarded -
    /// an embedder polling only `dispatch`/`handled_version` results would
    /// otherwise have no way to learn the loop exited on its own.
    pub async fn close(&self) {
        let _ = self.shutdown.send(true);
        self.waiters.close().await;

        if let Some(handle) = self.loop_handle.lock().await.take() {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!(error = %e, "polling loop exited with a fatal error"),
                Err(e) => tracing::error!(error = %e, "polling loop task panicked"),
            }
        }

        self.store.close().await;
    }

    /// Waits for the polling loop task to exit and returns its outcome:
    /// `Ok(())` on a clean shutdown (`Engine::close` was called), or
    /// `Err(EngineError::GivingUp)` if it exhausted its retry budget (spec
    /// §4.6, §9). Useful for an embedder that wants to detect and react to a
    /// fatal loop exit directly, rather than only seeing it logged by
    /// `close`. Returns `None` if the loop handle was already taken (i.e.
    /// `close` already ran).
    pub async fn join(&self) -> Option<Result<(), EngineError>> {
        let handle = self.loop_handle.lock().await.take()?;
        Some(match handle.await {
            Ok(result) => result,
            Err(e) => Err(EngineError::Sqlx(sqlx::Error::Protocol(format!("polling loop task panicked: {e}")))),
        })
    }
}
