//! Alert and content-flag rows.

use sqlx::{Row, SqlitePool};

use crate::error::Error;

use super::types::{Alert, AlertType, ContentFlag, FlagStatus, Severity};

pub async fn insert(pool: &SqlitePool, alert: &Alert) -> Result<(), Error> {
    let mut tx = pool.begin().await?;
    insert_alert_tx(&mut tx, alert).await?;
    tx.commit().await?;
    Ok(())
}

/// Atomically insert an alert together with its content flag and the flag's
/// review-queue entry. Either everything lands or nothing does.
pub async fn insert_with_flag(
    pool: &SqlitePool,
    alert: &Alert,
    flag: &ContentFlag,
    review_item_id: &str,
    anonymized: bool,
    blur_level: u8,
) -> Result<(), Error> {
    let mut tx = pool.begin().await?;
    insert_alert_tx(&mut tx, alert).await?;
    insert_flag_tx(&mut tx, flag).await?;

    sqlx::query(
        r#"INSERT INTO review_queue
           (id, flag_id, status, tier, created_at, anonymized, blur_level)
           VALUES (?1, ?2, 'pending', ?3, ?4, ?5, ?6)"#,
    )
    .bind(review_item_id)
    .bind(&flag.id)
    .bind(flag.tier as i64)
    .bind(flag.created_at.timestamp_millis())
    .bind(anonymized)
    .bind(blur_level as i64)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}

async fn insert_alert_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    alert: &Alert,
) -> Result<(), Error> {
    sqlx::query(
        r#"INSERT INTO alerts
           (id, stream_id, alert_type, severity, title, body, created_at,
            acknowledged, acknowledged_at, escalation_level)
           VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"#,
    )
    .bind(&alert.id)
    .bind(&alert.stream_id)
    .bind(alert.alert_type.as_str())
    .bind(alert.severity.as_str())
    .bind(&alert.title)
    .bind(&alert.body)
    .bind(alert.created_at.timestamp_millis())
    .bind(alert.acknowledged)
    .bind(alert.acknowledged_at.map(|t| t.timestamp_millis()))
    .bind(alert.escalation_level as i64)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn insert_flag_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    flag: &ContentFlag,
) -> Result<(), Error> {
    sqlx::query(
        r#"INSERT INTO content_flags
           (id, stream_id, frame_id, tier, categories, status, created_at)
           VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"#,
    )
    .bind(&flag.id)
    .bind(&flag.stream_id)
    .bind(&flag.frame_id)
    .bind(flag.tier as i64)
    .bind(flag.categories.join(","))
    .bind(flag.status.as_str())
    .bind(flag.created_at.timestamp_millis())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

pub async fn get(pool: &SqlitePool, id: &str) -> Result<Option<Alert>, Error> {
    let row = sqlx::query("SELECT * FROM alerts WHERE id = ?1")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    row.map(alert_from_row).transpose()
}

/// Alerts for one stream, newest first.
pub async fn list_for_stream(
    pool: &SqlitePool,
    stream_id: &str,
    limit: i64,
) -> Result<Vec<Alert>, Error> {
    let rows = sqlx::query(
        "SELECT * FROM alerts WHERE stream_id = ?1 ORDER BY created_at DESC LIMIT ?2",
    )
    .bind(stream_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    rows.into_iter().map(alert_from_row).collect()
}

/// Stamp acknowledgement. Returns `false` when already acknowledged or absent
/// — callers treat both as "nothing to do", keeping the operation idempotent.
pub async fn acknowledge(pool: &SqlitePool, id: &str, at_millis: i64) -> Result<bool, Error> {
    let result = sqlx::query(
        "UPDATE alerts SET acknowledged = 1, acknowledged_at = ?2
         WHERE id = ?1 AND acknowledged = 0",
    )
    .bind(id)
    .bind(at_millis)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Persist the escalation level; never lowers it.
pub async fn set_level(pool: &SqlitePool, id: &str, level: u8) -> Result<(), Error> {
    sqlx::query("UPDATE alerts SET escalation_level = MAX(escalation_level, ?2) WHERE id = ?1")
        .bind(id)
        .bind(level as i64)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn get_flag(pool: &SqlitePool, id: &str) -> Result<Option<ContentFlag>, Error> {
    let row = sqlx::query("SELECT * FROM content_flags WHERE id = ?1")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    row.map(flag_from_row).transpose()
}

pub async fn insert_flag(pool: &SqlitePool, flag: &ContentFlag) -> Result<(), Error> {
    let mut tx = pool.begin().await?;
    insert_flag_tx(&mut tx, flag).await?;
    tx.commit().await?;
    Ok(())
}

pub async fn set_flag_status(
    pool: &SqlitePool,
    id: &str,
    status: FlagStatus,
) -> Result<bool, Error> {
    let result = sqlx::query("UPDATE content_flags SET status = ?2 WHERE id = ?1")
        .bind(id)
        .bind(status.as_str())
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn list_flags(pool: &SqlitePool, limit: i64) -> Result<Vec<ContentFlag>, Error> {
    let rows = sqlx::query("SELECT * FROM content_flags ORDER BY created_at DESC LIMIT ?1")
        .bind(limit)
        .fetch_all(pool)
        .await?;
    rows.into_iter().map(flag_from_row).collect()
}

fn alert_from_row(row: sqlx::sqlite::SqliteRow) -> Result<Alert, Error> {
    let alert_type: String = row.try_get("alert_type")?;
    let severity: String = row.try_get("severity")?;

    Ok(Alert {
        id: row.try_get("id")?,
        stream_id: row.try_get("stream_id")?,
        alert_type: AlertType::parse(&alert_type)
            .ok_or_else(|| Error::Parse(format!("bad alert_type `{alert_type}`")))?,
        severity: Severity::parse(&severity)
            .ok_or_else(|| Error::Parse(format!("bad severity `{severity}`")))?,
        title: row.try_get("title")?,
        body: row.try_get("body")?,
        created_at: super::from_millis(row.try_get("created_at")?),
        acknowledged: row.try_get("acknowledged")?,
        acknowledged_at: row
            .try_get::<Option<i64>, _>("acknowledged_at")?
            .map(super::from_millis),
        escalation_level: row.try_get::<i64, _>("escalation_level")? as u8,
    })
}

fn flag_from_row(row: sqlx::sqlite::SqliteRow) -> Result<ContentFlag, Error> {
    let status: String = row.try_get("status")?;
    let categories: String = row.try_get("categories")?;

    Ok(ContentFlag {
        id: row.try_get("id")?,
        stream_id: row.try_get("stream_id")?,
        frame_id: row.try_get("frame_id")?,
        tier: row.try_get::<i64, _>("tier")? as u8,
        categories: categories
            .split(',')
            .filter(|c| !c.is_empty())
            .map(str::to_string)
            .collect(),
        status: FlagStatus::parse(&status)
            .ok_or_else(|| Error::Parse(format!("bad flag status `{status}`")))?,
        created_at: super::from_millis(row.try_get("created_at")?),
    })
}
