//! An event-sourced database engine layered on an embedded SQLite store.
//!
//! An [`Engine`] holds a durable, gap-free, append-only [`Event`] log (the
//! queue) and a set of user-defined [`Model`]s that derive their own tables
//! from it. Every event runs through a four-phase pipeline - preprocess,
//! reduce, apply, derive - inside one write transaction, so a model's tables
//! are always consistent with the event that produced them. A single
//! cooperative polling loop drains the queue in order; callers either fire
//! an event and await its own processing (`dispatch`), fire one without
//! waiting (`enqueue`), or wait for a version someone else dispatched to
//! settle (`handled_version`, `wait_for_queue`).

mod engine;
mod error;
mod event;
mod model;
mod options;
mod pipeline;
mod queue;
mod registry;
mod store;
mod version;
mod waiter;

pub use engine::Engine;
pub use error::{EngineError, ModelError, QueueError, RegistryError};
pub use event::Event;
pub use model::{DeriveContext, Model, PreprocessContext, ReduceContext, ReduceOutcome, WritableFlag};
pub use options::{EngineOptions, QueueLocation};
pub use queue::EventQueue;
pub use store::StoreLocation;
pub use waiter::Notification;
