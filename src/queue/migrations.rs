//! Creates the queue table. Idempotent, run once at construction - grounded in
//! the teacher's `DatabaseSetup::run`/`Migrations::run` (`CREATE TABLE IF NOT
//! EXISTS` inside one transaction).

use sqlx::SqlitePool;

pub(crate) async fn run(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;

    sqlx::query(
        "
        CREATE TABLE IF NOT EXISTS queue
        (
            v INTEGER PRIMARY KEY,
            type TEXT NOT NULL,
            ts INTEGER NOT NULL,
            data TEXT NOT NULL,
            result TEXT,
            error TEXT,
            failed_result TEXT,
            events TEXT NOT NULL DEFAULT '[]'
        )
        ",
    )
    .execute(&mut *tx)
    .await?;

    tx.commit().await
}
