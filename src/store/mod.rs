//! Relational persistence.
//!
//! One SQLite database holds streams, alerts, content flags, the review
//! queue, notification subscriptions, and saved profiles. Row access is
//! plain async functions over `&SqlitePool`, grouped per entity in the
//! submodules; no business logic lives here.

mod schema;
pub mod alerts;
pub mod profiles;
pub mod review;
pub mod streams;
pub mod subs;
pub mod types;

use chrono::Utc;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    SqlitePool,
};

use crate::error::Error;

/// Open (creating if missing) the database at `path` and apply the schema.
pub async fn open(path: &str) -> anyhow::Result<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(options)
        .await?;

    apply_schema(&pool).await?;
    Ok(pool)
}

/// In-memory database for tests and throwaway runs.
pub async fn open_in_memory() -> anyhow::Result<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .in_memory(true)
        .foreign_keys(true);

    // A single connection: each :memory: connection is its own database.
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?;

    apply_schema(&pool).await?;
    Ok(pool)
}

async fn apply_schema(pool: &SqlitePool) -> Result<(), Error> {
    let mut tx = pool.begin().await?;

    for statement in split_statements(schema::SCHEMA) {
        sqlx::query(&statement).execute(&mut *tx).await?;
    }

    sqlx::query(
        "INSERT INTO schema_version (id, version, applied_at) VALUES (1, ?1, ?2)
         ON CONFLICT(id) DO UPDATE SET version = excluded.version",
    )
    .bind(schema::SCHEMA_VERSION)
    .bind(Utc::now().timestamp_millis())
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    tracing::debug!(version = schema::SCHEMA_VERSION, "schema applied");
    Ok(())
}

/// Split the schema blob into individual statements.
///
/// SQLite's text protocol executes one statement per query; `;` inside the
/// schema only ever terminates statements (no triggers or string literals
/// containing semicolons).
fn split_statements(sql: &str) -> Vec<String> {
    sql.split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty() && !s.lines().all(|l| l.trim().starts_with("--") || l.trim().is_empty()))
        .map(|s| format!("{s};"))
        .collect()
}

/// Millisecond timestamp → [`chrono::DateTime`], saturating on nonsense.
pub(crate) fn from_millis(ms: i64) -> chrono::DateTime<Utc> {
    chrono::DateTime::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
}

/// `SELECT 1` round-trip, used by the health endpoint.
pub async fn ping(pool: &SqlitePool) -> Result<(), Error> {
    sqlx::query_scalar::<_, i64>("SELECT 1").fetch_one(pool).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn schema_applies_on_fresh_database() {
        let pool = open_in_memory().await.expect("open in-memory store");

        let version: i32 = sqlx::query_scalar("SELECT version FROM schema_version WHERE id = 1")
            .fetch_one(&pool)
            .await
            .expect("schema_version row present");
        assert_eq!(version, schema::SCHEMA_VERSION);
    }

    #[tokio::test]
    async fn schema_apply_is_idempotent() {
        let pool = open_in_memory().await.unwrap();
        apply_schema(&pool).await.expect("second apply must succeed");
    }

    #[tokio::test]
    async fn all_tables_exist() {
        let pool = open_in_memory().await.unwrap();
        for table in [
            "streams",
            "alerts",
            "content_flags",
            "review_queue",
            "push_subscriptions",
            "sms_recipients",
            "chat_recipients",
            "user_profiles",
        ] {
            let present: bool = sqlx::query_scalar(
                "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type = 'table' AND name = ?1",
            )
            .bind(table)
            .fetch_one(&pool)
            .await
            .unwrap();
            assert!(present, "table {table} missing");
        }
    }

    #[tokio::test]
    async fn ping_succeeds_on_open_pool() {
        let pool = open_in_memory().await.unwrap();
        assert!(ping(&pool).await.is_ok());
    }
}
