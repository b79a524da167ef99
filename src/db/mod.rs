pub mod models;
pub mod queries;

use std::{str::FromStr, time::Duration};

use anyhow::Result;
use sqlx::{
    Pool, Sqlite,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
};

/// Writers queue on the database lock for this long before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(10);

pub async fn init_pool(database_url: &str) -> Result<Pool<Sqlite>> {
    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(BUSY_TIMEOUT);
    let pool = SqlitePoolOptions::new().connect_with(options).await?;

    // Run migrations
    sqlx::migrate!("./migrations").run(&pool).await?;

    Ok(pool)
}

/// Current time as unix milliseconds, the unit every timestamp column uses.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Single-connection in-memory database with the schema applied.
///
/// A pool of one keeps every query on the same `:memory:` database.
#[cfg(test)]
pub async fn test_pool() -> Pool<Sqlite> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

/// Fresh on-disk database behind a pool of several connections, set up the
/// way [`init_pool`] sets up production. Use it where queries must really
/// run side by side.
#[cfg(test)]
pub async fn file_test_pool() -> Pool<Sqlite> {
    let path = std::env::temp_dir().join(format!(
        "loyalty-sync-test-{}.db",
        rand::random::<u64>()
    ));
    let url = format!("sqlite://{}?mode=rwc", path.display());
    let pool = init_pool(&url).await.unwrap();
    assert!(pool.options().get_max_connections() > 1);
    pool
}
