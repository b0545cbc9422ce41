//! The [`Model`] trait: the capability union a user-defined model may implement
//! (spec §3 "Model", §4.2 Model Registry).
//!
//! Rather than duck-typing capability presence, every model implements one
//! trait with default (no-op) methods, and advertises which capabilities it
//! actually wants run via `has_preprocessor`/`has_reducer`/`has_deriver`. The
//! registry (`registry.rs`) uses those flags to build the three ordered/unordered
//! worklists spec §4.2 describes, and to reject models declaring none of them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::{SqliteConnection, SqlitePool};

use crate::error::ModelError;
use crate::event::Event;

/// What a reducer returned for its model (spec §4.4 Reduce phase).
pub enum ReduceOutcome {
    /// `null`/the-model, or anything that isn't recognized as changes: "no change".
    NoChange,
    /// An object describing changes to this model's table, plus any sub-events
    /// the reducer wants appended to the parent.
    Changes {
        /// Opaque changes payload handed verbatim to `apply_changes`.
        changes: Value,
        /// Sub-events to append to the parent event, in order.
        sub_events: Vec<(String, Value)>,
    },
}

impl ReduceOutcome {
    /// Shorthand for a reducer that only changes its table, with no sub-events.
    pub fn changes(changes: Value) -> Self {
        ReduceOutcome::Changes {
            changes,
            sub_events: Vec::new(),
        }
    }
}

/// Handed to preprocessors: a read-only pool connection, the event mutably (a
/// preprocessor may canonicalize `data`), and `dispatch` to append sub-events
/// (spec §4.4: "dispatch(type,data) appends a sub-event to event.events").
/// Preprocessors run strictly sequentially, so exclusive `&mut Event` access
/// is handed to one at a time.
pub struct PreprocessContext<'a> {
    pub(crate) ro_pool: &'a SqlitePool,
    pub(crate) event: &'a mut Event,
}

impl<'a> PreprocessContext<'a> {
    /// The read-only pool. Compliant models only ever `SELECT` through it; see
    /// [`Model::set_writable`] for the write-isolation contract.
    pub fn ro_pool(&self) -> &SqlitePool {
        self.ro_pool
    }

    /// The event being processed, as seen so far (earlier preprocessors may
    /// have already mutated it or appended sub-events).
    pub fn event(&self) -> &Event {
        self.event
    }

    /// Mutable access, for canonicalizing `data`. Retain the same `v` and a
    /// non-empty `type` - the pipeline checks this after the call and converts
    /// a violation into `_preprocess_<name>`.
    pub fn event_mut(&mut self) -> &mut Event {
        self.event
    }

    /// Appends a sub-event to the parent, inheriting its `v`.
    pub fn dispatch(&mut self, kind: impl Into<String>, data: Value) {
        self.event.dispatch_sub_event(kind, data);
    }
}

/// Handed to reducers: a read-only pool connection and a read-only view of the
/// event. Reducers run concurrently and are pure, so they describe sub-events
/// to append via their returned [`ReduceOutcome`] instead of dispatching
/// directly (spec §4.4 Reduce phase).
pub struct ReduceContext<'a> {
    pub(crate) ro_pool: &'a SqlitePool,
    pub(crate) event: &'a Event,
}

impl<'a> ReduceContext<'a> {
    /// The read-only pool.
    pub fn ro_pool(&self) -> &SqlitePool {
        self.ro_pool
    }

    /// The event being reduced, after all preprocessors have run.
    pub fn event(&self) -> &Event {
        self.event
    }
}

/// Handed to derivers: the RW connection mid-transaction, the event, and the
/// full per-model `result` produced by the reduce phase (spec §4.4 Apply phase).
pub struct DeriveContext<'a> {
    pub(crate) conn: &'a mut SqliteConnection,
    pub(crate) event: &'a Event,
    pub(crate) result: &'a std::collections::BTreeMap<String, Value>,
}

impl<'a> DeriveContext<'a> {
    /// The write connection, inside the enclosing transaction and `handle` savepoint.
    pub fn conn(&mut self) -> &mut SqliteConnection {
        self.conn
    }

    /// The event being processed.
    pub fn event(&self) -> &Event {
        self.event
    }

    /// Every model's reducer output for this event.
    pub fn result(&self) -> &std::collections::BTreeMap<String, Value> {
        self.result
    }
}

/// A toggle a model can consult before performing a write, set by the registry
/// at the start/end of the apply phase (spec §4.2: "Between phases, models are
/// read-only: any write attempt must fail."). Store one of these in your model
/// and check `is_writable()` inside `apply_changes`/`derive` if your model's
/// storage layer cannot otherwise enforce it.
#[derive(Clone, Default)]
pub struct WritableFlag(Arc<AtomicBool>);

impl WritableFlag {
    pub fn new() -> Self {
        WritableFlag(Arc::new(AtomicBool::new(false)))
    }

    pub fn set(&self, writable: bool) {
        self.0.store(writable, Ordering::SeqCst);
    }

    pub fn is_writable(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A user-defined model (spec §3 "Model"): owns tables in the underlying store
/// and exposes some subset of {preprocessor, reducer, applyChanges, deriver}.
#[async_trait]
pub trait Model: Send + Sync {
    /// Unique non-empty identifier. `"metadata"` is reserved.
    fn name(&self) -> &str;

    /// Whether this model wants to run during the preprocess phase.
    fn has_preprocessor(&self) -> bool {
        false
    }

    /// Whether this model wants to run during the reduce phase.
    fn has_reducer(&self) -> bool {
        false
    }

    /// Whether this model wants to run during the derive phase.
    fn has_deriver(&self) -> bool {
        false
    }

    /// Canonicalizes the event before reducers run. May mutate `ctx.event_mut()`'s
    /// `data`, append sub-events via `ctx.dispatch`, but must retain the same
    /// `v` and a non-empty `type` - the pipeline checks this after the call
    /// and converts a violation into `_preprocess_<name>` (spec §4.4).
    async fn preprocess(&self, _ctx: &mut PreprocessContext<'_>) -> Result<(), ModelError> {
        Ok(())
    }

    /// Pure function from `(self, event)` to a change description for this
    /// model's own table (spec §4.4 Reduce phase).
    async fn reduce(&self, _ctx: &ReduceContext<'_>) -> Result<ReduceOutcome, ModelError> {
        Ok(ReduceOutcome::NoChange)
    }

    /// Applies this model's `changes` (as returned by `reduce`) to its table.
    /// Called only for models whose name appears in `result` (spec §4.4 Apply phase).
    async fn apply_changes(&self, _changes: &Value, _conn: &mut SqliteConnection) -> Result<(), ModelError> {
        Ok(())
    }

    /// Post-apply routine allowed to write to the RW store (spec §4.4, Deriver
    /// in the GLOSSARY).
    async fn derive(&self, _ctx: &mut DeriveContext<'_>) -> Result<(), ModelError> {
        Ok(())
    }

    /// Toggled by the pipeline at the start/end of the apply phase (spec §4.2).
    /// Default is a no-op; models that can't otherwise enforce read-only access
    /// outside the apply phase should store a [`WritableFlag`] and consult it.
    fn set_writable(&self, _writable: bool) {}
}
