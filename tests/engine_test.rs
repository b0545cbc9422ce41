//! End-to-end scenarios against the public `Engine` surface, mirroring the
//! concrete scenarios the core's invariants are checked against.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use sqlx::SqliteConnection;
use tokio::sync::Mutex as AsyncMutex;

use eventcore::{DeriveContext, Engine, EngineError, EngineOptions, Model, PreprocessContext, ReduceContext, ReduceOutcome};

/// An in-memory engine with a short poll interval and backoff, so tests don't
/// wait on the production defaults (mirrors the teacher's `test_store`).
async fn test_engine(models: Vec<Arc<dyn Model>>) -> Engine {
    let options = EngineOptions::memory()
        .poll_interval(std::time::Duration::from_millis(10))
        .backoff_base_ms(1);
    Engine::new(options, models).await.unwrap()
}

/// `foo`: a model whose reducer stamps `{id, v}` and whose `apply_changes`
/// writes the row into an in-memory table (standing in for a real SQL table,
/// the way `polling.rs`'s own test fixture keeps a counter instead).
struct FooModel {
    rows: AsyncMutex<BTreeMap<String, Value>>,
}

impl FooModel {
    fn new() -> Self {
        FooModel {
            rows: AsyncMutex::new(BTreeMap::new()),
        }
    }

    async fn get(&self, id: &str) -> Option<Value> {
        self.rows.lock().await.get(id).cloned()
    }
}

#[async_trait]
impl Model for FooModel {
    fn name(&self) -> &str {
        "foo"
    }

    fn has_reducer(&self) -> bool {
        true
    }

    async fn reduce(&self, ctx: &ReduceContext<'_>) -> Result<ReduceOutcome, eventcore::ModelError> {
        let id = ctx.event().data.get("id").and_then(Value::as_str).unwrap_or_default();
        Ok(ReduceOutcome::changes(json!({ "id": id, "v": ctx.event().v })))
    }

    async fn apply_changes(&self, changes: &Value, _conn: &mut SqliteConnection) -> Result<(), eventcore::ModelError> {
        let id = changes.get("id").and_then(Value::as_str).unwrap_or_default().to_string();
        self.rows.lock().await.insert(id, changes.clone());
        Ok(())
    }
}

#[tokio::test]
async fn s1_add_one() {
    let foo = Arc::new(FooModel::new());
    let engine = test_engine(vec![foo.clone()]).await;

    let event = engine.dispatch("ADD", json!({ "id": "a" }), None).await.unwrap();
    assert_eq!(event.v, 1);
    assert_eq!(engine.persisted_version().await.unwrap(), 1);

    let row = foo.get("a").await.unwrap();
    assert_eq!(row["id"], "a");
    assert_eq!(row["v"], 1);

    engine.close().await;
}

/// A reducer that always fails, tagging its own model name.
struct ErroringModel {
    model_name: &'static str,
}

#[async_trait]
impl Model for ErroringModel {
    fn name(&self) -> &str {
        self.model_name
    }

    fn has_reducer(&self) -> bool {
        true
    }

    async fn reduce(&self, _ctx: &ReduceContext<'_>) -> Result<ReduceOutcome, eventcore::ModelError> {
        Err(eventcore::ModelError::custom("boom"))
    }
}

/// A reducer that always succeeds and records whether `apply_changes` ran.
struct RecordingModel {
    model_name: &'static str,
    applied: Arc<std::sync::atomic::AtomicBool>,
}

#[async_trait]
impl Model for RecordingModel {
    fn name(&self) -> &str {
        self.model_name
    }

    fn has_reducer(&self) -> bool {
        true
    }

    async fn reduce(&self, _ctx: &ReduceContext<'_>) -> Result<ReduceOutcome, eventcore::ModelError> {
        Ok(ReduceOutcome::changes(json!({})))
    }

    async fn apply_changes(&self, _changes: &Value, _conn: &mut SqliteConnection) -> Result<(), eventcore::ModelError> {
        self.applied.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn s2_reducer_error_isolation() {
    let applied_b = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let model_a: Arc<dyn Model> = Arc::new(ErroringModel { model_name: "a" });
    let model_b: Arc<dyn Model> = Arc::new(RecordingModel {
        model_name: "b",
        applied: applied_b.clone(),
    });

    let engine = test_engine(vec![model_a, model_b]).await;

    let err = engine.dispatch("X", json!({}), None).await.unwrap_err();
    let failed = match err {
        EngineError::EventFailed(event) => event,
        other => panic!("expected EventFailed, got {other:?}"),
    };

    let error_map = failed.error.as_ref().expect("error map present");
    assert!(error_map.contains_key("reduce_a"));
    assert!(!error_map.contains_key("reduce_b"));

    // B's reducer never errored, but since A's did, the whole reduce phase is
    // aggregated and the apply phase never runs for either model.
    assert!(!applied_b.load(Ordering::SeqCst));
    assert_eq!(engine.persisted_version().await.unwrap(), 0);

    engine.close().await;
}

/// A preprocessor that, on `"PARENT"`, appends a `"CHILD"` sub-event.
struct ParentPreprocessor;

#[async_trait]
impl Model for ParentPreprocessor {
    fn name(&self) -> &str {
        "parent_pre"
    }

    fn has_preprocessor(&self) -> bool {
        true
    }

    async fn preprocess(&self, ctx: &mut PreprocessContext<'_>) -> Result<(), eventcore::ModelError> {
        if ctx.event().kind == "PARENT" {
            ctx.dispatch("CHILD", json!({}));
        }
        Ok(())
    }
}

/// A reducer that only reacts to `"CHILD"` events, recording a hit count.
struct ChildWriter {
    hits: AtomicI64,
}

#[async_trait]
impl Model for ChildWriter {
    fn name(&self) -> &str {
        "child_writer"
    }

    fn has_reducer(&self) -> bool {
        true
    }

    async fn reduce(&self, ctx: &ReduceContext<'_>) -> Result<ReduceOutcome, eventcore::ModelError> {
        if ctx.event().kind == "CHILD" {
            Ok(ReduceOutcome::changes(json!({ "hit": true })))
        } else {
            Ok(ReduceOutcome::NoChange)
        }
    }

    async fn apply_changes(&self, _changes: &Value, _conn: &mut SqliteConnection) -> Result<(), eventcore::ModelError> {
        self.hits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn s3_sub_event_chain() {
    let parent_pre: Arc<dyn Model> = Arc::new(ParentPreprocessor);
    let child_writer = Arc::new(ChildWriter { hits: AtomicI64::new(0) });

    let engine = test_engine(vec![parent_pre, child_writer.clone()]).await;

    let event = engine.dispatch("PARENT", json!({}), None).await.unwrap();

    assert_eq!(event.v, 1);
    assert_eq!(engine.persisted_version().await.unwrap(), 1);
    assert_eq!(event.events.len(), 1);
    assert_eq!(event.events[0].kind, "CHILD");
    // Sub-events share the parent's v (spec §3 invariant 5); they are not
    // independently ordered in the queue.
    assert_eq!(event.events[0].v, 1);

    assert_eq!(child_writer.hits.load(Ordering::SeqCst), 1);

    engine.close().await;
}

/// A preprocessor that unconditionally re-emits its own event type as a
/// sub-event, forcing unbounded recursion.
struct Looper;

#[async_trait]
impl Model for Looper {
    fn name(&self) -> &str {
        "looper"
    }

    fn has_preprocessor(&self) -> bool {
        true
    }

    async fn preprocess(&self, ctx: &mut PreprocessContext<'_>) -> Result<(), eventcore::ModelError> {
        let kind = ctx.event().kind.clone();
        ctx.dispatch(kind, json!({}));
        Ok(())
    }
}

#[tokio::test]
async fn s6_recursion_limit() {
    let looper: Arc<dyn Model> = Arc::new(Looper);
    // A small ceiling keeps this test fast; the default is 100 (spec §4.4).
    let options = EngineOptions::memory().recursion_limit(5);
    let engine = Engine::new(options, vec![looper]).await.unwrap();

    let err = engine.dispatch("LOOP", json!({}), None).await.unwrap_err();
    let failed = match err {
        EngineError::EventFailed(event) => event,
        other => panic!("expected EventFailed, got {other:?}"),
    };

    assert!(failed.error.as_ref().unwrap().contains_key("_handle"));
    assert_eq!(engine.persisted_version().await.unwrap(), 0);

    // Walk the nested sub-event chain down to where the recursion guard
    // actually tripped (spec §4.4: ancestors see "subevent <i> failed";
    // only the event at the recursion ceiling carries the original message).
    let mut node = &*failed;
    loop {
        match node.events.first() {
            Some(child) => node = child,
            None => break,
        }
    }
    assert_eq!(
        node.error.as_ref().unwrap().get("_handle").map(String::as_str),
        Some("events recursing too deep")
    );

    engine.close().await;
}

/// Two independent models, each writing their own table off the same event -
/// both effects land under the same version (spec §3 invariant 6).
struct CounterModel {
    total: Arc<AtomicI64>,
}

#[async_trait]
impl Model for CounterModel {
    fn name(&self) -> &str {
        "counter"
    }

    fn has_reducer(&self) -> bool {
        true
    }

    async fn reduce(&self, ctx: &ReduceContext<'_>) -> Result<ReduceOutcome, eventcore::ModelError> {
        let amount = ctx.event().data.get("amount").and_then(Value::as_i64).unwrap_or(0);
        Ok(ReduceOutcome::changes(json!({ "amount": amount })))
    }

    async fn apply_changes(&self, changes: &Value, _conn: &mut SqliteConnection) -> Result<(), eventcore::ModelError> {
        let amount = changes.get("amount").and_then(Value::as_i64).unwrap_or(0);
        self.total.fetch_add(amount, Ordering::SeqCst);
        Ok(())
    }
}

/// A deriver that mirrors the running total into its own cache table, reading
/// the `result` the reduce phase produced for `counter` (spec §4.4: derivers
/// see `event`, `result`, and a `dispatch`).
struct CacheDeriver {
    mirrored: Arc<AtomicI64>,
}

#[async_trait]
impl Model for CacheDeriver {
    fn name(&self) -> &str {
        "cache"
    }

    fn has_deriver(&self) -> bool {
        true
    }

    async fn derive(&self, ctx: &mut DeriveContext<'_>) -> Result<(), eventcore::ModelError> {
        if let Some(changes) = ctx.result().get("counter") {
            let amount = changes.get("amount").and_then(Value::as_i64).unwrap_or(0);
            self.mirrored.fetch_add(amount, Ordering::SeqCst);
        }
        Ok(())
    }
}

#[tokio::test]
async fn deriver_sees_reduce_result_and_monotonic_version_holds() {
    let total = Arc::new(AtomicI64::new(0));
    let mirrored = Arc::new(AtomicI64::new(0));
    let counter: Arc<dyn Model> = Arc::new(CounterModel { total: total.clone() });
    let cache: Arc<dyn Model> = Arc::new(CacheDeriver { mirrored: mirrored.clone() });

    let engine = test_engine(vec![counter, cache]).await;

    engine.dispatch("ADD", json!({ "amount": 3 }), None).await.unwrap();
    engine.dispatch("ADD", json!({ "amount": 4 }), None).await.unwrap();

    assert_eq!(total.load(Ordering::SeqCst), 7);
    assert_eq!(mirrored.load(Ordering::SeqCst), 7);
    assert_eq!(engine.persisted_version().await.unwrap(), 2);

    engine.close().await;
}

/// A model whose `apply_changes` writes a row through the real RW connection
/// (so the pipeline's savepoint rollback genuinely undoes it on failure) and
/// fails on demand. Before inserting, it records how many rows already exist
/// for this `v` - a leaked row from an earlier failed attempt would show up
/// here as a nonzero count on the eventually-successful retry.
struct FlakyModel {
    should_fail: Arc<std::sync::atomic::AtomicBool>,
    seen_counts_before_insert: AsyncMutex<Vec<(i64, i64)>>,
}

#[async_trait]
impl Model for FlakyModel {
    fn name(&self) -> &str {
        "flaky"
    }

    fn has_reducer(&self) -> bool {
        true
    }

    async fn reduce(&self, ctx: &ReduceContext<'_>) -> Result<ReduceOutcome, eventcore::ModelError> {
        Ok(ReduceOutcome::changes(json!({ "v": ctx.event().v })))
    }

    async fn apply_changes(&self, changes: &Value, conn: &mut SqliteConnection) -> Result<(), eventcore::ModelError> {
        sqlx::query("CREATE TABLE IF NOT EXISTS flaky (v INTEGER)")
            .execute(&mut *conn)
            .await?;

        let v = changes.get("v").and_then(Value::as_i64).unwrap_or(0);
        let before: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM flaky WHERE v = ?")
            .bind(v)
            .fetch_one(&mut *conn)
            .await?;
        self.seen_counts_before_insert.lock().await.push((v, before));

        sqlx::query("INSERT INTO flaky (v) VALUES (?)").bind(v).execute(&mut *conn).await?;

        if self.should_fail.load(Ordering::SeqCst) {
            return Err(eventcore::ModelError::custom("boom"));
        }
        Ok(())
    }
}

#[tokio::test]
async fn s4_failed_event_blocks_then_recovers_with_no_leaked_state() {
    let should_fail = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let flaky = Arc::new(FlakyModel {
        should_fail: should_fail.clone(),
        seen_counts_before_insert: AsyncMutex::new(Vec::new()),
    });
    let engine = test_engine(vec![flaky.clone()]).await;

    engine.dispatch("ADD", json!({}), None).await.unwrap();
    assert_eq!(engine.persisted_version().await.unwrap(), 1);

    should_fail.store(true, Ordering::SeqCst);
    let err = engine.dispatch("ADD", json!({}), None).await.unwrap_err();
    match err {
        EngineError::EventFailed(event) => {
            assert_eq!(event.v, 2);
            assert!(event.error.as_ref().unwrap().contains_key("_apply-apply"));
        }
        other => panic!("expected EventFailed, got {other:?}"),
    }
    // Version stays at the last successful event while v=2 is stuck (spec §8 invariant 1).
    assert_eq!(engine.persisted_version().await.unwrap(), 1);

    should_fail.store(false, Ordering::SeqCst);
    let recovered = tokio::time::timeout(std::time::Duration::from_secs(5), engine.handled_version(2))
        .await
        .expect("polling loop retried within the timeout")
        .unwrap();
    assert_eq!(recovered.v, 2);
    assert!(recovered.error.is_none());
    assert_eq!(engine.persisted_version().await.unwrap(), 2);

    // The retry that finally succeeded must have seen zero pre-existing rows
    // for v=2 - the earlier failed attempt's INSERT was rolled back by the
    // `handle` savepoint, not merely left for a later overwrite.
    let seen = flaky.seen_counts_before_insert.lock().await;
    let last_v2 = seen.iter().rev().find(|(v, _)| *v == 2).unwrap();
    assert_eq!(last_v2.1, 0);

    engine.close().await;
}

#[tokio::test]
async fn wait_for_queue_catches_up_to_latest_enqueued() {
    let foo = Arc::new(FooModel::new());
    let engine = test_engine(vec![foo]).await;

    engine.enqueue("ADD", json!({ "id": "a" }), None).await.unwrap();
    engine.enqueue("ADD", json!({ "id": "b" }), None).await.unwrap();

    let event = engine.wait_for_queue().await.unwrap();
    assert_eq!(event.v, 2);
    assert_eq!(engine.persisted_version().await.unwrap(), 2);

    engine.close().await;
}

/// Exercises `EngineOptions::queue_file`: the queue lives in its own SQLite
/// file, separate from the model store, so the per-event outcome has to be
/// written through the queue's own connection after the RW transaction
/// commits rather than through the RW transaction itself (spec §4.6).
#[tokio::test]
async fn dispatch_works_with_queue_in_a_separate_file() {
    let dir = tempfile::tempdir().unwrap();
    let store_path = dir.path().join("store.sqlite3");
    let queue_path = dir.path().join("queue.sqlite3");

    let foo = Arc::new(FooModel::new());
    let options = eventcore::EngineOptions::file(store_path.to_str().unwrap())
        .queue_file(queue_path.to_str().unwrap())
        .poll_interval(std::time::Duration::from_millis(10))
        .backoff_base_ms(1);
    let engine = Engine::new(options, vec![foo.clone()]).await.unwrap();

    let event = engine.dispatch("ADD", json!({ "id": "a" }), None).await.unwrap();
    assert_eq!(event.v, 1);
    assert_eq!(engine.persisted_version().await.unwrap(), 1);
    assert_eq!(foo.get("a").await.unwrap()["id"], "a");

    engine.close().await;
}
