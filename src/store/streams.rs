//! Stream rows.

use sqlx::{Row, SqlitePool};

use crate::error::Error;

use super::types::{Scenario, StreamPrefs, StreamRecord, StreamStatus};

pub async fn insert(pool: &SqlitePool, stream: &StreamRecord) -> Result<(), Error> {
    let prefs = stream
        .preferences
        .as_ref()
        .map(|p| serde_json::to_string(p).unwrap_or_default());

    sqlx::query(
        r#"INSERT INTO streams
           (id, name, user_id, scenario, status, started_at, ended_at,
            frame_count, alert_count, last_ping, preferences)
           VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"#,
    )
    .bind(&stream.id)
    .bind(&stream.name)
    .bind(&stream.user_id)
    .bind(stream.scenario.as_str())
    .bind(stream.status.as_str())
    .bind(stream.started_at.timestamp_millis())
    .bind(stream.ended_at.map(|t| t.timestamp_millis()))
    .bind(stream.frame_count)
    .bind(stream.alert_count)
    .bind(stream.last_ping.timestamp_millis())
    .bind(prefs)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn get(pool: &SqlitePool, id: &str) -> Result<Option<StreamRecord>, Error> {
    let row = sqlx::query("SELECT * FROM streams WHERE id = ?1")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    row.map(record_from_row).transpose()
}

pub async fn list(pool: &SqlitePool) -> Result<Vec<StreamRecord>, Error> {
    let rows = sqlx::query("SELECT * FROM streams ORDER BY started_at DESC")
        .fetch_all(pool)
        .await?;
    rows.into_iter().map(record_from_row).collect()
}

pub async fn set_status(
    pool: &SqlitePool,
    id: &str,
    status: StreamStatus,
    ended_at: Option<i64>,
) -> Result<bool, Error> {
    let result = sqlx::query(
        "UPDATE streams SET status = ?2, ended_at = COALESCE(?3, ended_at) WHERE id = ?1",
    )
    .bind(id)
    .bind(status.as_str())
    .bind(ended_at)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Flush in-memory counters. Counts are absolute, not deltas.
pub async fn flush_counters(
    pool: &SqlitePool,
    id: &str,
    frame_count: i64,
    alert_count: i64,
    last_ping: i64,
) -> Result<(), Error> {
    sqlx::query(
        "UPDATE streams SET frame_count = ?2, alert_count = ?3, last_ping = ?4 WHERE id = ?1",
    )
    .bind(id)
    .bind(frame_count)
    .bind(alert_count)
    .bind(last_ping)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn set_preferences(
    pool: &SqlitePool,
    id: &str,
    prefs: &StreamPrefs,
) -> Result<bool, Error> {
    let json = serde_json::to_string(prefs)
        .map_err(|e| Error::InvalidInput(format!("unserializable preferences: {e}")))?;
    let result = sqlx::query("UPDATE streams SET preferences = ?2 WHERE id = ?1")
        .bind(id)
        .bind(json)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn delete(pool: &SqlitePool, id: &str) -> Result<bool, Error> {
    let result = sqlx::query("DELETE FROM streams WHERE id = ?1")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

fn record_from_row(row: sqlx::sqlite::SqliteRow) -> Result<StreamRecord, Error> {
    let scenario: String = row.try_get("scenario")?;
    let status: String = row.try_get("status")?;
    let prefs: Option<String> = row.try_get("preferences")?;

    Ok(StreamRecord {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        user_id: row.try_get("user_id")?,
        scenario: Scenario::parse(&scenario)
            .ok_or_else(|| Error::Parse(format!("bad scenario `{scenario}` in streams row")))?,
        status: StreamStatus::parse(&status)
            .ok_or_else(|| Error::Parse(format!("bad status `{status}` in streams row")))?,
        started_at: super::from_millis(row.try_get("started_at")?),
        ended_at: row
            .try_get::<Option<i64>, _>("ended_at")?
            .map(super::from_millis),
        frame_count: row.try_get("frame_count")?,
        alert_count: row.try_get("alert_count")?,
        last_ping: super::from_millis(row.try_get("last_ping")?),
        preferences: prefs.and_then(|p| serde_json::from_str(&p).ok()),
    })
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::store;
    use crate::store::types::{Scenario, StreamStatus};

    fn sample(id: &str, scenario: Scenario) -> StreamRecord {
        StreamRecord {
            id: id.into(),
            name: Some("Living Room".into()),
            user_id: Some("u-1".into()),
            scenario,
            status: StreamStatus::Active,
            started_at: Utc::now(),
            ended_at: None,
            frame_count: 0,
            alert_count: 0,
            last_ping: Utc::now(),
            preferences: None,
        }
    }

    #[tokio::test]
    async fn insert_and_get_round_trip() {
        let pool = store::open_in_memory().await.unwrap();
        insert(&pool, &sample("s-1", Scenario::Pet)).await.unwrap();

        let fetched = get(&pool, "s-1").await.unwrap().expect("row exists");
        assert_eq!(fetched.id, "s-1");
        assert_eq!(fetched.scenario, Scenario::Pet);
        assert_eq!(fetched.status, StreamStatus::Active);
        assert_eq!(fetched.name.as_deref(), Some("Living Room"));
    }

    #[tokio::test]
    async fn get_returns_none_for_unknown_id() {
        let pool = store::open_in_memory().await.unwrap();
        assert!(get(&pool, "nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn set_status_stamps_ended_at_once() {
        let pool = store::open_in_memory().await.unwrap();
        insert(&pool, &sample("s-1", Scenario::Baby)).await.unwrap();

        let ended = Utc::now().timestamp_millis();
        assert!(
            set_status(&pool, "s-1", StreamStatus::Disconnected, Some(ended))
                .await
                .unwrap()
        );

        let fetched = get(&pool, "s-1").await.unwrap().unwrap();
        assert_eq!(fetched.status, StreamStatus::Disconnected);
        assert_eq!(fetched.ended_at.unwrap().timestamp_millis(), ended);

        // A later status change without a timestamp keeps the original ended_at.
        set_status(&pool, "s-1", StreamStatus::Disconnected, None)
            .await
            .unwrap();
        let again = get(&pool, "s-1").await.unwrap().unwrap();
        assert_eq!(again.ended_at.unwrap().timestamp_millis(), ended);
    }

    #[tokio::test]
    async fn flush_counters_writes_absolute_values() {
        let pool = store::open_in_memory().await.unwrap();
        insert(&pool, &sample("s-1", Scenario::Elderly)).await.unwrap();

        let ping = Utc::now().timestamp_millis();
        flush_counters(&pool, "s-1", 42, 3, ping).await.unwrap();

        let fetched = get(&pool, "s-1").await.unwrap().unwrap();
        assert_eq!(fetched.frame_count, 42);
        assert_eq!(fetched.alert_count, 3);
    }

    #[tokio::test]
    async fn preferences_round_trip_as_json() {
        let pool = store::open_in_memory().await.unwrap();
        insert(&pool, &sample("s-1", Scenario::Pet)).await.unwrap();

        let prefs = StreamPrefs {
            motion_sensitivity: Some(0.42),
            notify_sms: Some(false),
            ..Default::default()
        };
        assert!(set_preferences(&pool, "s-1", &prefs).await.unwrap());

        let fetched = get(&pool, "s-1").await.unwrap().unwrap();
        let stored = fetched.preferences.expect("preferences present");
        assert_eq!(stored.motion_sensitivity, Some(0.42));
        assert_eq!(stored.notify_sms, Some(false));
    }

    #[tokio::test]
    async fn delete_removes_row() {
        let pool = store::open_in_memory().await.unwrap();
        insert(&pool, &sample("s-1", Scenario::Pet)).await.unwrap();
        assert!(delete(&pool, "s-1").await.unwrap());
        assert!(get(&pool, "s-1").await.unwrap().is_none());
        assert!(!delete(&pool, "s-1").await.unwrap());
    }
}
