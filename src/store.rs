//! The underlying SQLite store handles (spec §5 "Shared resources", §6
//! "Underlying store contract"). A thin wrapper over `sqlx::SqlitePool`
//! providing the savepoint vocabulary the pipeline needs, plus the
//! handle-aliasing rules spec §9 calls out:
//!
//! - when the queue file equals the RW file (and isn't `:memory:`), the queue
//!   shares the RW connection for result writes, avoiding a writer-vs-writer
//!   deadlock on the same file;
//! - when the underlying file is `:memory:`, the RO handle is the same pool as
//!   RW, since separate `:memory:` connections see different, empty databases.

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Executor, SqliteConnection, SqlitePool};

/// Where the database lives. Mirrors the teacher's `Pool<T>`/`test_pool`
/// split between a real file and an in-memory, single-connection test pool.
#[derive(Debug, Clone)]
pub enum StoreLocation {
    /// A file on disk, shared across processes.
    File(String),
    /// An ephemeral, process-local database. Every handle must share one pool,
    /// since separate `:memory:` connections are separate databases.
    Memory,
}

impl StoreLocation {
    fn is_memory(&self) -> bool {
        matches!(self, StoreLocation::Memory)
    }
}

/// The three store handles the engine opens against one logical database
/// (spec §5): a single-connection read-write pool (single-writer
/// serialization), a multi-connection read-only pool, and - when they'd
/// otherwise be the same file - a queue pool aliasing the RW pool.
pub struct StoreHandles {
    pub rw: SqlitePool,
    pub ro: SqlitePool,
    /// The pool `queue::SqliteEventQueue::set` writes result rows through.
    /// Aliases `rw` whenever the queue file and the RW file are the same
    /// physical database, so `set` participates in the same transaction the
    /// pipeline is running inside.
    pub queue: SqlitePool,
    location: StoreLocation,
    ro_aliases_rw: bool,
}

impl StoreHandles {
    /// Opens RW/RO/queue handles for a store living at `location`, creating
    /// the file if needed.
    pub async fn open(location: StoreLocation) -> Result<Self, sqlx::Error> {
        let rw = open_pool(&location, 1, false).await?;
        let ro_aliases_rw = location.is_memory();
        let ro = if ro_aliases_rw {
            rw.clone()
        } else {
            open_pool(&location, 4, true).await?
        };
        let queue = rw.clone();

        Ok(StoreHandles {
            rw,
            ro,
            queue,
            location,
            ro_aliases_rw,
        })
    }

    /// Closes all three handles. Safe to call more than once; reopening after
    /// close happens lazily the next time a pool method is used, same as the
    /// teacher's `EventStore::close`.
    pub async fn close(&self) {
        self.rw.close().await;
        if !self.ro_aliases_rw {
            self.ro.close().await;
        }
    }

    pub fn location(&self) -> &StoreLocation {
        &self.location
    }
}

pub(crate) async fn open_pool(
    location: &StoreLocation,
    max_connections: u32,
    read_only: bool,
) -> Result<SqlitePool, sqlx::Error> {
    let options = match location {
        StoreLocation::Memory => SqliteConnectOptions::new()
            .in_memory(true)
            .create_if_missing(true),
        StoreLocation::File(path) => SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .read_only(read_only),
    };

    SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await
}

/// Issues `SAVEPOINT <name>` on the given connection (spec §6: "Named
/// savepoints: SAVEPOINT x, RELEASE SAVEPOINT x, ROLLBACK TO SAVEPOINT x,
/// nestable.").
pub async fn savepoint(conn: &mut SqliteConnection, name: &str) -> Result<(), sqlx::Error> {
    conn.execute(format!("SAVEPOINT {name}").as_str()).await.map(|_| ())
}

/// Issues `RELEASE SAVEPOINT <name>`.
pub async fn release_savepoint(conn: &mut SqliteConnection, name: &str) -> Result<(), sqlx::Error> {
    conn.execute(format!("RELEASE SAVEPOINT {name}").as_str())
        .await
        .map(|_| ())
}

/// Issues `ROLLBACK TO SAVEPOINT <name>`.
pub async fn rollback_to_savepoint(conn: &mut SqliteConnection, name: &str) -> Result<(), sqlx::Error> {
    conn.execute(format!("ROLLBACK TO SAVEPOINT {name}").as_str())
        .await
        .map(|_| ())
}

/// Reads the persistent `user_version` pragma.
pub async fn read_user_version(conn: &mut SqliteConnection) -> Result<i64, sqlx::Error> {
    let row: (i64,) = sqlx::query_as("PRAGMA user_version").fetch_one(conn).await?;
    Ok(row.0)
}

/// Writes the persistent `user_version` pragma. `PRAGMA` statements don't take
/// bound parameters, so the value is interpolated; it's always an `i64` we
/// produced ourselves (never user input), mirroring how the teacher interpolates
/// the aggregate name into its own DDL.
pub async fn write_user_version(conn: &mut SqliteConnection, v: i64) -> Result<(), sqlx::Error> {
    conn.execute(format!("PRAGMA user_version = {v}").as_str())
        .await
        .map(|_| ())
}
