//! The event queue (C1, spec §4.1): an append-only ordered log of events
//! keyed by strictly increasing version `v`.

mod migrations;

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::{Row, SqlitePool};
use tokio::sync::Notify;

use crate::error::QueueError;
use crate::event::Event;

/// How often a blocking `get_next` re-polls the store while waiting for a
/// local wake-up that might not arrive (e.g. another process appended the
/// row), per spec §4.1.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Append-only ordered log of events (spec §4.1).
#[async_trait]
pub trait EventQueue: Send + Sync {
    /// Appends a new event, assigning the next `v` atomically. `kind` must be
    /// non-empty, else `QueueError::InvalidEvent`.
    async fn add(&self, kind: &str, data: Value, ts: i64) -> Result<Event, QueueError>;

    /// Point lookup by version.
    async fn get(&self, v: i64) -> Result<Option<Event>, QueueError>;

    /// Returns the next event with `v > after_v`. When `no_block` is `false`,
    /// suspends (polling at [`POLL_INTERVAL`], waking early on a local `add`)
    /// until such an event exists.
    async fn get_next(&self, after_v: i64, no_block: bool) -> Result<Option<Event>, QueueError>;

    /// Upserts by `v`; used to record processing result/error back into the row.
    async fn set(&self, event: &Event) -> Result<(), QueueError>;

    /// Highest enqueued `v` (not necessarily processed).
    async fn latest_version(&self) -> Result<i64, QueueError>;

    /// Closes the underlying connection(s). Safe to call more than once;
    /// reopens lazily on next use (spec §9 "Backoff & connection reset").
    async fn close(&self);
}

/// A [`EventQueue`] backed by a SQLite table (see [`migrations::run`] for the
/// schema). `add`/`set` go through `pool`, which per spec §9 should be the
/// same pool as the engine's RW store whenever the queue file and RW file
/// coincide, so writes participate in the same transaction.
pub struct SqliteEventQueue {
    pool: SqlitePool,
    notify: Notify,
    poll_interval: Duration,
}

impl SqliteEventQueue {
    /// Runs the queue table migration and wraps `pool`, polling at
    /// [`POLL_INTERVAL`] while blocked in `get_next`.
    pub async fn new(pool: SqlitePool) -> Result<Self, QueueError> {
        Self::with_poll_interval(pool, POLL_INTERVAL).await
    }

    /// Same as [`SqliteEventQueue::new`], but with a caller-chosen poll
    /// interval (spec §5 "Configuration": short intervals for tests).
    pub async fn with_poll_interval(pool: SqlitePool, poll_interval: Duration) -> Result<Self, QueueError> {
        migrations::run(&pool).await?;
        Ok(SqliteEventQueue {
            pool,
            notify: Notify::new(),
            poll_interval,
        })
    }

    fn row_to_event(row: QueueRow) -> Result<Event, QueueError> {
        Ok(Event {
            v: row.v,
            kind: row.kind,
            data: serde_json::from_str(&row.data)?,
            ts: row.ts,
            result: row.result.map(|s| serde_json::from_str(&s)).transpose()?,
            error: row.error.map(|s| serde_json::from_str(&s)).transpose()?,
            failed_result: row.failed_result.map(|s| serde_json::from_str(&s)).transpose()?,
            events: serde_json::from_str(&row.events)?,
        })
    }
}

struct QueueRow {
    v: i64,
    kind: String,
    ts: i64,
    data: String,
    result: Option<String>,
    error: Option<String>,
    failed_result: Option<String>,
    events: String,
}

impl<'r> sqlx::FromRow<'r, sqlx::sqlite::SqliteRow> for QueueRow {
    fn from_row(row: &'r sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(QueueRow {
            v: row.try_get("v")?,
            kind: row.try_get("type")?,
            ts: row.try_get("ts")?,
            data: row.try_get("data")?,
            result: row.try_get("result")?,
            error: row.try_get("error")?,
            failed_result: row.try_get("failed_result")?,
            events: row.try_get("events")?,
        })
    }
}

#[async_trait]
impl EventQueue for SqliteEventQueue {
    async fn add(&self, kind: &str, data: Value, ts: i64) -> Result<Event, QueueError> {
        if kind.is_empty() {
            return Err(QueueError::InvalidEvent);
        }

        let mut tx = self.pool.begin().await?;

        let next_v: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(v), 0) + 1 FROM queue")
            .fetch_one(&mut *tx)
            .await?;

        let data_json = serde_json::to_string(&data)?;

        sqlx::query(
            "INSERT INTO queue (v, type, ts, data, result, error, failed_result, events) \
             VALUES (?, ?, ?, ?, NULL, NULL, NULL, '[]')",
        )
        .bind(next_v)
        .bind(kind)
        .bind(ts)
        .bind(&data_json)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        self.notify.notify_waiters();

        Ok(Event::new(next_v, kind, data, ts))
    }

    async fn get(&self, v: i64) -> Result<Option<Event>, QueueError> {
        let row: Option<QueueRow> = sqlx::query_as("SELECT * FROM queue WHERE v = ?")
            .bind(v)
            .fetch_optional(&self.pool)
            .await?;

        row.map(Self::row_to_event).transpose()
    }

    async fn get_next(&self, after_v: i64, no_block: bool) -> Result<Option<Event>, QueueError> {
        loop {
            let row: Option<QueueRow> = sqlx::query_as("SELECT * FROM queue WHERE v > ? ORDER BY v LIMIT 1")
                .bind(after_v)
                .fetch_optional(&self.pool)
                .await?;

            if let Some(row) = row {
                return Ok(Some(Self::row_to_event(row)?));
            }

            if no_block {
                return Ok(None);
            }

            let notified = self.notify.notified();
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    async fn set(&self, event: &Event) -> Result<(), QueueError> {
        let data_json = serde_json::to_string(&event.data)?;
        let result_json = event.result.as_ref().map(serde_json::to_string).transpose()?;
        let error_json = event.error.as_ref().map(serde_json::to_string).transpose()?;
        let failed_result_json = event.failed_result.as_ref().map(serde_json::to_string).transpose()?;
        let events_json = serde_json::to_string(&event.events)?;

        sqlx::query(
            "INSERT INTO queue (v, type, ts, data, result, error, failed_result, events) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(v) DO UPDATE SET \
                type = excluded.type, ts = excluded.ts, data = excluded.data, \
                result = excluded.result, error = excluded.error, \
                failed_result = excluded.failed_result, events = excluded.events",
        )
        .bind(event.v)
        .bind(&event.kind)
        .bind(event.ts)
        .bind(&data_json)
        .bind(&result_json)
        .bind(&error_json)
        .bind(&failed_result_json)
        .bind(&events_json)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn latest_version(&self) -> Result<i64, QueueError> {
        let v: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(v), 0) FROM queue")
            .fetch_one(&self.pool)
            .await?;
        Ok(v)
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

/// Helper used by the polling loop to bind `set` to a specific transactional
/// connection instead of the pool (spec §4.6: "resultQueue ... is a separate
/// connection to the RW file's queue table so `set` participates in the RW
/// transaction correctly").
pub(crate) async fn set_on_connection(
    conn: &mut sqlx::SqliteConnection,
    event: &Event,
) -> Result<(), QueueError> {
    let data_json = serde_json::to_string(&event.data)?;
    let result_json = event.result.as_ref().map(serde_json::to_string).transpose()?;
    let error_json = event.error.as_ref().map(serde_json::to_string).transpose()?;
    let failed_result_json = event.failed_result.as_ref().map(serde_json::to_string).transpose()?;
    let events_json = serde_json::to_string(&event.events)?;

    sqlx::query(
        "INSERT INTO queue (v, type, ts, data, result, error, failed_result, events) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT(v) DO UPDATE SET \
            type = excluded.type, ts = excluded.ts, data = excluded.data, \
            result = excluded.result, error = excluded.error, \
            failed_result = excluded.failed_result, events = excluded.events",
    )
    .bind(event.v)
    .bind(&event.kind)
    .bind(event.ts)
    .bind(&data_json)
    .bind(&result_json)
    .bind(&error_json)
    .bind(&failed_result_json)
    .bind(&events_json)
    .execute(&mut *conn)
    .await?;

    Ok(())
}
