//! Connection pool setup and idempotent schema migration.
//!
//! Grounded on `wirewarden-api/src/db/mod.rs::{create_pool, migrate}`, with
//! the pool narrowed to a single writer connection (spec.md §4.4 "one
//! writer connection to avoid contention") and write-ahead journaling plus
//! foreign-key enforcement turned on per connection, as spec.md §4.4/§5
//! require.

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;

use crate::StoreError;

/// Open (creating if absent) the SQLite database at `path` and apply
/// migrations. Returns a pool capped at one connection, matching the
/// single-writer model in spec.md §4.4/§5.
pub async fn open(path: &str) -> Result<SqlitePool, StoreError> {
    let options = SqliteConnectOptions::from_str(path)
        .map_err(|e| StoreError::Database(sqlx::Error::Configuration(Box::new(e))))?
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?;

    migrate(&pool).await?;
    Ok(pool)
}

/// Apply the schema. Safe to call repeatedly: migrations are tracked and
/// skipped once applied (spec.md §8 "applying the schema twice to an
/// empty store is a no-op").
pub async fn migrate(pool: &SqlitePool) -> Result<(), StoreError> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| StoreError::Database(sqlx::Error::Migrate(Box::new(e))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn migrate_twice_is_noop() {
        let pool = open("sqlite::memory:").await.unwrap();
        migrate(&pool).await.unwrap();
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM domain_groups")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count.0, 0);
    }
}
