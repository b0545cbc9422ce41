//! The persistent [`Event`] record (spec §3) and the phase-tagged error keys (spec §7).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Model name reserved for the engine's own bookkeeping; never a legal model name.
pub const RESERVED_MODEL_NAME: &str = "metadata";

/// The per-event recursion limit (spec §4.4): an event emitting sub-events nested
/// more than this many levels deep fails with `_handle`.
pub const MAX_RECURSION_DEPTH: u32 = 100;

/// An atomic, ordered fact recorded in the queue with version `v`.
///
/// Sub-events (spec §3, §4.4) are represented by nesting further `Event` values
/// under `events`; they share the parent's `v` and are not independently
/// ordered in the queue - only the top-level event carries a `v` assigned by
/// the queue itself. The same struct is reused so the pipeline can recurse
/// uniformly over parent and child.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    /// Strictly monotonic, gap-free version. Assigned at enqueue time for
    /// top-level events; copied from the parent for sub-events.
    pub v: i64,

    /// Non-empty event type, preserved through preprocessors.
    #[serde(rename = "type")]
    pub kind: String,

    /// Opaque payload.
    pub data: Value,

    /// Wall-clock seconds at enqueue time (advisory).
    pub ts: i64,

    /// `{modelName -> changes}` produced by reducers. Absent before processing,
    /// present (possibly empty) after success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<BTreeMap<String, Value>>,

    /// `{phase-tagged key -> stringified error}`. Present iff processing failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<BTreeMap<String, String>>,

    /// Snapshot of `result` captured when an apply/derive failure rolls back.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_result: Option<BTreeMap<String, Value>>,

    /// Ordered list of sub-events appended during preprocessing, reducing, or
    /// deriving.
    #[serde(default)]
    pub events: Vec<Event>,
}

impl Event {
    /// Builds a brand-new, unprocessed event. `v` is filled in by the queue at
    /// `add` time (pass `0` here; callers should not rely on this value before
    /// the queue assigns the real one).
    pub fn new(v: i64, kind: impl Into<String>, data: Value, ts: i64) -> Self {
        Event {
            v,
            kind: kind.into(),
            data,
            ts,
            result: None,
            error: None,
            failed_result: None,
            events: Vec::new(),
        }
    }

    /// A sub-event inherits the parent's `v`; it is otherwise a regular event.
    pub fn sub_event(v: i64, kind: impl Into<String>, data: Value) -> Self {
        Event {
            v,
            kind: kind.into(),
            data,
            ts: 0,
            result: None,
            error: None,
            failed_result: None,
            events: Vec::new(),
        }
    }

    /// Whether this event committed with an `error` map (spec §3 invariant: error
    /// events never advance the version).
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Clears `result`/`error` in preparation for (re)processing, as the polling
    /// loop does before handing the event to the pipeline (spec §4.6). Also
    /// clears `events`: a retried event's preprocess/reduce phases regenerate
    /// sub-events from scratch, so any left over from an earlier failed
    /// attempt would otherwise duplicate alongside the freshly-dispatched ones.
    pub fn reset_for_processing(&mut self) {
        self.result = None;
        self.error = None;
        self.events.clear();
    }

    /// Moves `result` into `failed_result` and clears `result`, as happens when
    /// an apply/derive failure rolls back the transaction (spec §4.4).
    pub fn fail_apply(&mut self) {
        self.failed_result = self.result.take();
    }

    /// Inserts (or merges into) the `error` map.
    pub fn push_error(&mut self, key: impl Into<String>, message: impl std::fmt::Display) {
        self.error
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), message.to_string());
    }

    /// Appends a sub-event to be processed (recursively) after this event's own
    /// apply phase succeeds.
    pub fn dispatch_sub_event(&mut self, kind: impl Into<String>, data: Value) {
        self.events.push(Event::sub_event(self.v, kind, data));
    }
}

/// Error key for a preprocessor failure or invariant violation.
pub fn preprocess_error_key(model: &str) -> String {
    format!("_preprocess_{model}")
}

/// Error key for a reducer failure.
pub fn reduce_error_key(model: &str) -> String {
    format!("reduce_{model}")
}

/// Error key used when `applyChanges` fails.
pub const APPLY_ERROR_KEY: &str = "_apply-apply";

/// Error key used when persisting `user_version` fails.
pub const APPLY_VERSION_ERROR_KEY: &str = "_apply-version";

/// Error key used when a deriver fails.
pub const APPLY_DERIVE_ERROR_KEY: &str = "_apply-derive";

/// Error key for recursion-limit and sub-event failures.
pub const HANDLE_ERROR_KEY: &str = "_handle";

/// Error key for exceptions outside the normal handlers (transaction machinery).
pub const SQLITE_ERROR_KEY: &str = "_SQLite";
