//! The Polling Loop (C6, spec §4.6): a single cooperative task that drains the
//! queue strictly in version order, running each event through the pipeline
//! inside one write transaction and a nested `handle` savepoint.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::error::EngineError;
use crate::event::{Event, SQLITE_ERROR_KEY};
use crate::pipeline::Pipeline;
use crate::queue::{self, EventQueue};
use crate::registry::ModelRegistry;
use crate::store::{self, StoreHandles};
use crate::waiter::WaiterSet;

/// Consecutive transient-failure ceiling before the loop logs loudly and
/// resets its RW connection (spec §4.6).
pub const MAX_RETRY: u32 = 38;

/// Backoff unit; the loop sleeps `BACKOFF_BASE_MS * errs` after each transient
/// failure (spec §4.6).
pub const BACKOFF_BASE_MS: u64 = 5000;

const SAVEPOINT_NAME: &str = "handle";

/// Drives the pipeline over every event in the queue, one at a time, never
/// running two events concurrently (spec §5: single-writer serialization).
pub struct PollingLoop {
    queue: Arc<dyn EventQueue>,
    registry: Arc<ModelRegistry>,
    store: Arc<StoreHandles>,
    waiters: Arc<WaiterSet>,
    max_retry: u32,
    backoff_base_ms: u64,
    recursion_limit: u32,
    /// Whether `queue` is backed by the same connection as `store.rw` (spec
    /// §4.6 "resultQueue"). When it is, the outcome must be written through
    /// the RW transaction's own connection, since the RW pool holds only one
    /// connection and it's already checked out by the open transaction -
    /// acquiring a second one from the same pool here would deadlock. When
    /// the queue lives in its own file, it has its own pool, so the outcome
    /// is written through `queue.set` after the RW transaction commits.
    queue_shares_rw_connection: bool,
}

impl PollingLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: Arc<dyn EventQueue>,
        registry: Arc<ModelRegistry>,
        store: Arc<StoreHandles>,
        waiters: Arc<WaiterSet>,
        recursion_limit: u32,
        max_retry: u32,
        backoff_base_ms: u64,
        queue_shares_rw_connection: bool,
    ) -> Self {
        PollingLoop {
            queue,
            registry,
            store,
            waiters,
            max_retry,
            backoff_base_ms,
            recursion_limit,
            queue_shares_rw_connection,
        }
    }

    /// Runs until `shutdown` reports `true` or the retry budget is exhausted,
    /// starting just after `start_v`. Each dequeued event is retried, with
    /// backoff, until it commits - the loop never skips a version, since the
    /// queue is gap-free by contract.
    ///
    /// Past `max_retry` consecutive failures the loop gives up and returns
    /// `EngineError::GivingUp` rather than retrying forever (spec §4.6, §9:
    /// "a fatal error from the loop is reported out-of-band"); an embedder
    /// restarts the engine to recover.
    ///
    /// Spec §4.6's pseudocode closes all three store handles before each
    /// backoff sleep ("they auto-reopen on next use") to shake loose a wedged
    /// raw sqlite handle. A `sqlx::SqlitePool` already recovers from a single
    /// bad connection transparently - a connection that errors is dropped and
    /// a fresh one opened on the next `acquire` - and unlike a raw handle,
    /// `SqlitePool::close` is a one-way shutdown with no reopen, so calling it
    /// here would turn the first transient failure into a permanent outage.
    /// This loop therefore only sleeps for the backoff; [`StoreHandles::close`]
    /// and [`EventQueue::close`] stay reserved for genuine engine shutdown.
    pub async fn run(&self, start_v: i64, mut shutdown: watch::Receiver<bool>) -> Result<(), EngineError> {
        let mut last_v = start_v;
        let mut errs: u32 = 0;

        loop {
            let span = tracing::debug_span!("eventcore.polling.iteration", errs, last_v);
            let _e = span.enter();

            if errs > 0 {
                if errs > self.max_retry {
                    tracing::error!(errs, v = last_v + 1, "giving up after repeated failures");
                    return Err(EngineError::GivingUp(last_v + 1));
                }
                tokio::time::sleep(Duration::from_millis(self.backoff_base_ms * u64::from(errs))).await;
            }

            let next = tokio::select! {
                _ = shutdown.changed() => return Ok(()),
                result = self.queue.get_next(last_v, false) => result,
            };

            let event = match next {
                Ok(Some(event)) => event,
                Ok(None) => continue,
                Err(e) => {
                    errs += 1;
                    tracing::warn!(error = %e, errs, "polling the queue failed");
                    continue;
                }
            };

            match self.process(event).await {
                Ok((v, true)) => {
                    // The event committed, but with a model-level error recorded on
                    // it. Spec §4.6: "if resultEvent.error: errs++; lastV := v - 1" -
                    // back off and re-fetch this same version next iteration instead
                    // of advancing past it.
                    errs += 1;
                    last_v = v - 1;
                    tracing::warn!(v, errs, "event committed with an error, will retry");
                }
                Ok((v, false)) => {
                    last_v = v;
                    errs = 0;
                }
                Err(e) => {
                    errs += 1;
                    tracing::warn!(error = %e, v = last_v + 1, errs, "event processing failed, retrying");
                }
            }
        }
    }

    /// Runs one event through the pipeline inside a single write transaction:
    /// `SAVEPOINT handle`, `pipeline.handle`, then `RELEASE`/`ROLLBACK TO`
    /// depending on the outcome, the result row, and `COMMIT` - all atomic.
    /// Returns the event's `v` plus whether it committed with a model-level
    /// error; only transaction-machinery failures surface as `Err`, since
    /// those leave the event unhandled for a retry. The caller (`run`) uses
    /// the `is_error` flag to decide whether to advance past this version or
    /// back off and retry it.
    ///
    /// Re-checks `user_version` against `event.v` inside the transaction
    /// first (spec §4.6: "if event.v ≤ version.get(): return undefined"), in
    /// case another process sharing this file already handled it - this
    /// process's own `last_v` only tracks what it has itself processed, so it
    /// can lag a peer's commits. When raced, returns the persisted version
    /// instead of reprocessing. Otherwise clears any `result`/`error` left
    /// over from a previous failed attempt at this same version (spec §4.6:
    /// "clear event.error, event.result") before handing it to the pipeline -
    /// without this, a stale error from an earlier attempt would still be
    /// present on this attempt's event even after a successful reprocessing.
    async fn process(&self, mut event: Event) -> Result<(i64, bool), EngineError> {
        let v = event.v;
        let mut tx = self.store.rw.begin().await?;

        let persisted = store::read_user_version(&mut tx).await?;
        if event.v <= persisted {
            tx.commit().await?;
            // A peer sharing this file already committed this version. Still
            // notify: a waiter may be registered locally (e.g. this process's
            // own `dispatch` raced a peer's polling loop to the same event).
            let was_error = match self.queue.get(event.v).await {
                Ok(Some(handled)) => {
                    let was_error = handled.is_error();
                    self.waiters.notify(&handled, self.queue.as_ref()).await;
                    was_error
                }
                _ => false,
            };
            return Ok((persisted, was_error));
        }

        event.reset_for_processing();
        store::savepoint(&mut tx, SAVEPOINT_NAME).await?;

        let pipeline = Pipeline::new(&self.registry, &self.store.ro, self.recursion_limit);
        pipeline.handle(&mut tx, &mut event, 0, true).await;

        let savepoint_result = if event.is_error() {
            store::rollback_to_savepoint(&mut tx, SAVEPOINT_NAME).await
        } else {
            store::release_savepoint(&mut tx, SAVEPOINT_NAME).await
        };
        if let Err(e) = savepoint_result {
            event.push_error(SQLITE_ERROR_KEY, e);
        }

        if self.queue_shares_rw_connection {
            queue::set_on_connection(&mut tx, &event).await?;
            tx.commit().await?;
        } else {
            tx.commit().await?;
            self.queue.set(&event).await?;
        }

        let is_error = event.is_error();
        self.waiters.notify(&event, self.queue.as_ref()).await;

        Ok((v, is_error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Model, ReduceContext, ReduceOutcome};
    use crate::queue::SqliteEventQueue;
    use crate::store::StoreLocation;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicI64, Ordering};

    struct Counter {
        total: Arc<AtomicI64>,
    }

    #[async_trait]
    impl Model for Counter {
        fn name(&self) -> &str {
            "counter"
        }

        fn has_reducer(&self) -> bool {
            true
        }

        fn has_preprocessor(&self) -> bool {
            true
        }

        async fn reduce(&self, ctx: &ReduceContext<'_>) -> Result<ReduceOutcome, crate::error::ModelError> {
            let amount = ctx.event().data.get("amount").and_then(|v| v.as_i64()).unwrap_or(0);
            Ok(ReduceOutcome::changes(json!({ "amount": amount })))
        }

        async fn apply_changes(
            &self,
            changes: &serde_json::Value,
            _conn: &mut sqlx::SqliteConnection,
        ) -> Result<(), crate::error::ModelError> {
            let amount = changes.get("amount").and_then(|v| v.as_i64()).unwrap_or(0);
            self.total.fetch_add(amount, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn drains_queue_and_advances_version() {
        let store = Arc::new(StoreHandles::open(StoreLocation::Memory).await.unwrap());
        let queue: Arc<dyn EventQueue> = Arc::new(SqliteEventQueue::new(store.queue.clone()).await.unwrap());

        let total = Arc::new(AtomicI64::new(0));
        let registry = Arc::new(
            ModelRegistry::new(vec![Arc::new(Counter { total: total.clone() })]).unwrap(),
        );
        let waiters = Arc::new(WaiterSet::new());

        queue.add("ADD", json!({ "amount": 3 }), 0).await.unwrap();
        queue.add("ADD", json!({ "amount": 4 }), 0).await.unwrap();

        let loop_ = PollingLoop::new(
            queue.clone(),
            registry,
            store.clone(),
            waiters,
            crate::event::MAX_RECURSION_DEPTH,
            MAX_RETRY,
            1,
            true,
        );
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(async move { loop_.run(0, shutdown_rx).await });

        for _ in 0..200 {
            if total.load(Ordering::SeqCst) == 7 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(total.load(Ordering::SeqCst), 7);
        assert_eq!(queue.latest_version().await.unwrap(), 2);
    }
}
