//! Error types returned by the engine's public surface and its internal collaborators.

use crate::event::Event;

/// Errors raised by the event queue (C1).
#[derive(thiserror::Error, Debug)]
pub enum QueueError {
    /// `add` was called with an empty `type`.
    #[error("event type must not be empty")]
    InvalidEvent,

    /// Underlying sqlite failure.
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),

    /// Failure serializing/deserializing the `data`/`result`/`error`/`events` columns.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Errors raised while running a single model's capability (preprocessor, reducer,
/// `applyChanges`, deriver). Models surface their own domain error as `Custom`; the
/// pipeline is responsible for tagging it with the phase and model name before it
/// reaches the event's `error` map.
#[derive(thiserror::Error, Debug)]
pub enum ModelError {
    /// Underlying sqlite failure while a model touched its own tables.
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),

    /// Failure serializing/deserializing a model's changes payload.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// A model-defined write attempted outside of the apply phase, or any other
    /// domain-specific failure a model wants to surface verbatim.
    #[error("{0}")]
    Custom(Box<dyn std::error::Error + Send + Sync>),
}

impl ModelError {
    /// Convenience constructor for model authors who just want a string error.
    pub fn custom(msg: impl Into<String>) -> Self {
        ModelError::Custom(msg.into().into())
    }
}

/// Errors raised by [`crate::registry::ModelRegistry`] construction.
#[derive(thiserror::Error, Debug)]
pub enum RegistryError {
    /// Two models were registered under the same name.
    #[error("duplicate model name: {0}")]
    DuplicateName(String),

    /// `"metadata"` is reserved for the engine's own bookkeeping.
    #[error("model name \"metadata\" is reserved")]
    ReservedName,

    /// A model declared none of preprocessor/reducer/deriver.
    #[error("model {0} must implement at least one of preprocessor, reducer, or deriver")]
    NoCapabilities(String),

    /// A model's name was empty.
    #[error("model name must not be empty")]
    EmptyName,
}

/// Top-level error returned from the engine's public async surface
/// (`dispatch`, `enqueue`, `wait_for_queue`, `handled_version`, `close`).
#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    /// See [`QueueError`].
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// See [`RegistryError`].
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// Underlying sqlite failure outside of the queue (version oracle, store handles).
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),

    /// The polling loop gave up after `max_retry` consecutive failures.
    #[error("giving up on event {0}")]
    GivingUp(i64),

    /// The event this caller was waiting on committed with an `error` map.
    /// Carries the full record (spec §3: `error`, `failedResult`, and any
    /// sub-events already appended before the failure), not just the top-level
    /// error map, so callers can inspect exactly what a sub-event failure did.
    #[error("event {} failed: {:?}", .0.v, .0.error)]
    EventFailed(Box<Event>),

    /// `Engine::close` was called while this caller was still waiting.
    #[error("engine closed while awaiting version {0}")]
    Closed(i64),
}
