//! The Event Pipeline (C4, spec §4.4): preprocess → reduce → apply → derive
//! for a single event, aggregating per-model errors and recursing into
//! sub-events.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;

use serde_json::Value;
use sqlx::{SqliteConnection, SqlitePool};
use tracing::Instrument;

use crate::event::{
    self, Event, APPLY_DERIVE_ERROR_KEY, APPLY_ERROR_KEY, APPLY_VERSION_ERROR_KEY, HANDLE_ERROR_KEY,
};
use crate::model::{DeriveContext, PreprocessContext, ReduceContext, ReduceOutcome};
use crate::registry::ModelRegistry;
use crate::version::VersionOracle;

/// Runs the four-phase pipeline for a single event against one registry.
/// Stateless beyond the registry/RO-pool references it holds; a fresh
/// `Pipeline` can be built per call or kept around for the engine's lifetime.
pub struct Pipeline<'a> {
    registry: &'a ModelRegistry,
    ro_pool: &'a SqlitePool,
    recursion_limit: u32,
}

impl<'a> Pipeline<'a> {
    pub fn new(registry: &'a ModelRegistry, ro_pool: &'a SqlitePool, recursion_limit: u32) -> Self {
        Pipeline {
            registry,
            ro_pool,
            recursion_limit,
        }
    }

    /// Processes `event` at recursion `depth`, mutating it in place with the
    /// outcome. `is_top_level` gates the `user_version` write to the true
    /// top-level event (spec §4.4: "only if this is the top-level event (d=0)").
    ///
    /// Never returns an `Err`: model failures are captured onto `event.error`
    /// (spec §7); callers should check `event.is_error()` after this resolves.
    pub fn handle<'b>(
        &'b self,
        conn: &'b mut SqliteConnection,
        event: &'b mut Event,
        depth: u32,
        is_top_level: bool,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + 'b>> {
        let span = tracing::debug_span!("eventcore.pipeline.handle", v = event.v, depth, is_top_level);
        Box::pin(
            async move {
                if depth > self.recursion_limit {
                    event.push_error(HANDLE_ERROR_KEY, "events recursing too deep");
                    return;
                }

                if !self.preprocess(event).await {
                    return;
                }

                let Some(result) = self.reduce(event).await else {
                    return;
                };

                self.apply(conn, event, &result, is_top_level).await;
                event.result = Some(result);

                if event.is_error() {
                    event.fail_apply();
                    return;
                }

                let sub_events = std::mem::take(&mut event.events);
                let mut processed = Vec::with_capacity(sub_events.len());

                for (i, mut sub) in sub_events.into_iter().enumerate() {
                    self.handle(conn, &mut sub, depth + 1, false).await;
                    let sub_failed = sub.is_error();
                    processed.push(sub);

                    if sub_failed {
                        event.events = processed;
                        event.push_error(HANDLE_ERROR_KEY, format!("subevent {i} failed"));
                        event.fail_apply();
                        return;
                    }
                }

                event.events = processed;
            }
            .instrument(span),
        )
    }

    /// Preprocess phase: sequential over preprocessors (spec §4.4). Returns
    /// `false` (with `event.error` already set) on the first violation.
    #[tracing::instrument(name = "eventcore.pipeline.preprocess", skip(self, event), fields(v = event.v))]
    async fn preprocess(&self, event: &mut Event) -> bool {
        for model in self.registry.preprocessors() {
            let before_v = event.v;

            let mut ctx = PreprocessContext {
                ro_pool: self.ro_pool,
                event,
            };

            match model.preprocess(&mut ctx).await {
                Ok(()) => {
                    if event.v != before_v || event.kind.is_empty() {
                        event.v = before_v;
                        event.push_error(
                            event::preprocess_error_key(model.name()),
                            "preprocessor must retain the same v and a non-empty type",
                        );
                        return false;
                    }
                }
                Err(e) => {
                    event.push_error(event::preprocess_error_key(model.name()), e);
                    return false;
                }
            }
        }

        true
    }

    /// Reduce phase: concurrent across reducers (spec §4.4). On success,
    /// returns the merged `{modelName -> changes}` result and appends any
    /// sub-events the reducers requested. On any reducer error, aggregates
    /// every failing reducer's error onto `event.error` and returns `None`.
    #[tracing::instrument(name = "eventcore.pipeline.reduce", skip(self, event), fields(v = event.v))]
    async fn reduce(&self, event: &mut Event) -> Option<BTreeMap<String, Value>> {
        let reducers = self.registry.reducers();

        let calls = reducers.iter().map(|model| {
            let ctx = ReduceContext {
                ro_pool: self.ro_pool,
                event: &*event,
            };
            async move { (model.name().to_string(), model.reduce(&ctx).await) }
        });

        let outcomes = futures::future::join_all(calls).await;

        let mut result = BTreeMap::new();
        let mut errors = BTreeMap::new();
        let mut sub_events = Vec::new();

        for (name, outcome) in outcomes {
            match outcome {
                Ok(ReduceOutcome::NoChange) => {}
                Ok(ReduceOutcome::Changes { changes, sub_events: subs }) => {
                    result.insert(name, changes);
                    sub_events.extend(subs);
                }
                Err(e) => {
                    errors.insert(event::reduce_error_key(&name), e.to_string());
                }
            }
        }

        if !errors.is_empty() {
            event.error.get_or_insert_with(BTreeMap::new).extend(errors);
            return None;
        }

        for (kind, data) in sub_events {
            event.dispatch_sub_event(kind, data);
        }

        Some(result)
    }

    /// Apply phase (spec §4.4): sets every RW model writable, applies each
    /// model's changes, persists `user_version` for top-level events, then
    /// runs derivers - all against the single RW connection, so "concurrently"
    /// here means settle-all error aggregation rather than true parallel
    /// execution (the connection only ever allows one writer at a time, same
    /// as the rest of this single-writer engine). The first error in each
    /// sub-phase is recorded; peers still run to completion.
    #[tracing::instrument(name = "eventcore.pipeline.apply", skip(self, conn, event, result), fields(v = event.v, is_top_level))]
    async fn apply(
        &self,
        conn: &mut SqliteConnection,
        event: &mut Event,
        result: &BTreeMap<String, Value>,
        is_top_level: bool,
    ) {
        self.registry.set_all_writable(true);

        let mut apply_error: Option<String> = None;
        for (name, changes) in result {
            if let Some(model) = self.registry.get(name) {
                if let Err(e) = model.apply_changes(changes, conn).await {
                    if apply_error.is_none() {
                        apply_error = Some(e.to_string());
                    }
                }
            }
        }
        if let Some(msg) = apply_error {
            event.push_error(APPLY_ERROR_KEY, msg);
        }

        if event.error.is_none() && is_top_level {
            if let Err(e) = VersionOracle::set(conn, event.v).await {
                event.push_error(APPLY_VERSION_ERROR_KEY, e);
            }
        }

        if event.error.is_none() {
            let mut derive_error: Option<String> = None;

            for model in self.registry.derivers() {
                let outcome = {
                    let mut ctx = DeriveContext {
                        conn: &mut *conn,
                        event: &*event,
                        result,
                    };
                    model.derive(&mut ctx).await
                };

                if let Err(e) = outcome {
                    if derive_error.is_none() {
                        derive_error = Some(e.to_string());
                    }
                }
            }

            if let Some(msg) = derive_error {
                event.push_error(APPLY_DERIVE_ERROR_KEY, msg);
            }
        }

        self.registry.set_all_writable(false);
    }
}
