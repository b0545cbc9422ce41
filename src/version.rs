//! The Version Oracle (C3, spec §4.3): reads/writes the single persistent
//! `user_version`, coalescing concurrent reads into one underlying query
//! (spec §9 "Single-flight reads").

use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use sqlx::SqlitePool;
use tokio::sync::Mutex;

use crate::store;

type InFlight = Shared<BoxFuture<'static, Result<i64, Arc<sqlx::Error>>>>;

/// Caches a single in-flight read of `PRAGMA user_version`; bursts of
/// concurrent `get()` calls collapse into one query. The cached future is
/// cleared once it resolves, so the next `get()` issues a fresh read.
pub struct VersionOracle {
    pool: SqlitePool,
    inflight: Mutex<Option<InFlight>>,
}

impl VersionOracle {
    pub fn new(pool: SqlitePool) -> Self {
        VersionOracle {
            pool,
            inflight: Mutex::new(None),
        }
    }

    /// Returns the persisted `user_version`.
    pub async fn get(&self) -> Result<i64, Arc<sqlx::Error>> {
        let fut = {
            let mut guard = self.inflight.lock().await;
            match &*guard {
                Some(fut) => fut.clone(),
                None => {
                    let pool = self.pool.clone();
                    let fut: InFlight = async move {
                        let mut conn = pool.acquire().await.map_err(Arc::new)?;
                        store::read_user_version(&mut conn).await.map_err(Arc::new)
                    }
                    .boxed()
                    .shared();
                    *guard = Some(fut.clone());
                    fut
                }
            }
        };

        let result = fut.await;
        *self.inflight.lock().await = None;
        result
    }

    /// Persists `v` as the new `user_version`. Callers must only invoke this
    /// from inside the pipeline's apply transaction, with `v` equal to the
    /// previous version plus one (spec §4.3).
    pub async fn set(conn: &mut sqlx::SqliteConnection, v: i64) -> Result<(), sqlx::Error> {
        store::write_user_version(conn, v).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqliteConnectOptions;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn memory_pool() -> SqlitePool {
        let options = SqliteConnectOptions::new().in_memory(true);
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn reads_default_zero() {
        let oracle = VersionOracle::new(memory_pool().await);
        assert_eq!(oracle.get().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let pool = memory_pool().await;
        let mut conn = pool.acquire().await.unwrap();
        VersionOracle::set(&mut conn, 7).await.unwrap();
        drop(conn);

        let oracle = VersionOracle::new(pool);
        assert_eq!(oracle.get().await.unwrap(), 7);
    }

    #[tokio::test]
    async fn concurrent_gets_coalesce() {
        let oracle = Arc::new(VersionOracle::new(memory_pool().await));
        let a = oracle.clone();
        let b = oracle.clone();
        let (ra, rb) = tokio::join!(
            tokio::spawn(async move { a.get().await.unwrap() }),
            tokio::spawn(async move { b.get().await.unwrap() }),
        );
        assert_eq!(ra.unwrap(), 0);
        assert_eq!(rb.unwrap(), 0);
    }
}
