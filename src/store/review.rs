//! Review-queue rows.
//!
//! The claim path is a single conditional UPDATE so two reviewers can never
//! hold the same lease: SQLite's deferred transactions would make a
//! select-then-update racy, the one-statement form is atomic.

use sqlx::{Row, SqlitePool};

use crate::error::Error;

use super::types::{FlagStatus, ReviewItem};

/// Enqueue a review item for an existing content flag.
pub async fn enqueue(
    pool: &SqlitePool,
    item_id: &str,
    flag_id: &str,
    tier: u8,
    created_at_millis: i64,
    anonymized: bool,
    blur_level: u8,
) -> Result<(), Error> {
    sqlx::query(
        r#"INSERT INTO review_queue
           (id, flag_id, status, tier, created_at, anonymized, blur_level)
           VALUES (?1, ?2, 'pending', ?3, ?4, ?5, ?6)"#,
    )
    .bind(item_id)
    .bind(flag_id)
    .bind(tier as i64)
    .bind(created_at_millis)
    .bind(anonymized)
    .bind(blur_level as i64)
    .execute(pool)
    .await?;
    Ok(())
}

/// Atomically claim the highest-priority pending item for `reviewer_id`.
///
/// Priority is tier descending, then oldest first. Returns `None` when
/// nothing is pending.
pub async fn claim_next(
    pool: &SqlitePool,
    reviewer_id: &str,
    now_millis: i64,
) -> Result<Option<ReviewItem>, Error> {
    let claimed: Option<String> = sqlx::query_scalar(
        r#"UPDATE review_queue
           SET status = 'assigned', assigned_to = ?1, assigned_at = ?2
           WHERE id = (
               SELECT id FROM review_queue
               WHERE status = 'pending'
               ORDER BY tier DESC, created_at ASC
               LIMIT 1
           )
           RETURNING id"#,
    )
    .bind(reviewer_id)
    .bind(now_millis)
    .fetch_optional(pool)
    .await?;

    match claimed {
        Some(id) => get(pool, &id).await,
        None => Ok(None),
    }
}

pub async fn get(pool: &SqlitePool, item_id: &str) -> Result<Option<ReviewItem>, Error> {
    let row = sqlx::query(
        r#"SELECT rq.*, cf.stream_id AS cf_stream_id, cf.frame_id AS cf_frame_id,
                  cf.categories AS cf_categories
           FROM review_queue rq
           JOIN content_flags cf ON cf.id = rq.flag_id
           WHERE rq.id = ?1"#,
    )
    .bind(item_id)
    .fetch_optional(pool)
    .await?;
    row.map(item_from_row).transpose()
}

pub async fn list(pool: &SqlitePool, limit: i64) -> Result<Vec<ReviewItem>, Error> {
    let rows = sqlx::query(
        r#"SELECT rq.*, cf.stream_id AS cf_stream_id, cf.frame_id AS cf_frame_id,
                  cf.categories AS cf_categories
           FROM review_queue rq
           JOIN content_flags cf ON cf.id = rq.flag_id
           ORDER BY rq.status = 'pending' DESC, rq.tier DESC, rq.created_at ASC
           LIMIT ?1"#,
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;
    rows.into_iter().map(item_from_row).collect()
}

/// Record a decision. The update only applies while `reviewer_id` holds the
/// lease; `false` means someone else owns it (or it was never assigned).
pub async fn resolve(
    pool: &SqlitePool,
    item_id: &str,
    reviewer_id: &str,
    status: FlagStatus,
    decision: &str,
    notes: Option<&str>,
    reviewed_at_millis: i64,
    force_tier: Option<u8>,
) -> Result<bool, Error> {
    let result = sqlx::query(
        r#"UPDATE review_queue
           SET status = ?3, decision = ?4, notes = ?5, reviewed_at = ?6,
               tier = COALESCE(?7, tier)
           WHERE id = ?1 AND assigned_to = ?2 AND status = 'assigned'"#,
    )
    .bind(item_id)
    .bind(reviewer_id)
    .bind(status.as_str())
    .bind(decision)
    .bind(notes)
    .bind(reviewed_at_millis)
    .bind(force_tier.map(|t| t as i64))
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Escalated items return to the pending pool at tier 4 so a privileged
/// reviewer can pick them up.
pub async fn requeue_escalated(pool: &SqlitePool, item_id: &str) -> Result<(), Error> {
    sqlx::query(
        r#"UPDATE review_queue
           SET status = 'pending', assigned_to = NULL, assigned_at = NULL, tier = 4
           WHERE id = ?1 AND status = 'escalated'"#,
    )
    .bind(item_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Return leases assigned before `cutoff_millis` to the pending pool.
/// Returns how many were reclaimed.
pub async fn expire_leases(pool: &SqlitePool, cutoff_millis: i64) -> Result<u64, Error> {
    let result = sqlx::query(
        r#"UPDATE review_queue
           SET status = 'pending', assigned_to = NULL, assigned_at = NULL
           WHERE status = 'assigned' AND assigned_at < ?1"#,
    )
    .bind(cutoff_millis)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

/// Administrative status override for a flag's queue row, bypassing leases.
/// Used by the flag-action surface, not the reviewer flow.
pub async fn set_status_for_flag(
    pool: &SqlitePool,
    flag_id: &str,
    status: FlagStatus,
    force_tier: Option<u8>,
) -> Result<bool, Error> {
    let result = sqlx::query(
        r#"UPDATE review_queue
           SET status = ?2, tier = COALESCE(?3, tier),
               assigned_to = NULL, assigned_at = NULL
           WHERE flag_id = ?1"#,
    )
    .bind(flag_id)
    .bind(status.as_str())
    .bind(force_tier.map(|t| t as i64))
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn count_pending(pool: &SqlitePool) -> Result<i64, Error> {
    let count =
        sqlx::query_scalar("SELECT COUNT(*) FROM review_queue WHERE status = 'pending'")
            .fetch_one(pool)
            .await?;
    Ok(count)
}

fn item_from_row(row: sqlx::sqlite::SqliteRow) -> Result<ReviewItem, Error> {
    let status: String = row.try_get("status")?;
    let categories: String = row.try_get("cf_categories")?;

    Ok(ReviewItem {
        id: row.try_get("id")?,
        flag_id: row.try_get("flag_id")?,
        stream_id: row.try_get("cf_stream_id")?,
        frame_id: row.try_get("cf_frame_id")?,
        tier: row.try_get::<i64, _>("tier")? as u8,
        categories: categories
            .split(',')
            .filter(|c| !c.is_empty())
            .map(str::to_string)
            .collect(),
        status: FlagStatus::parse(&status)
            .ok_or_else(|| Error::Parse(format!("bad review status `{status}`")))?,
        created_at: super::from_millis(row.try_get("created_at")?),
        assigned_to: row.try_get("assigned_to")?,
        assigned_at: row
            .try_get::<Option<i64>, _>("assigned_at")?
            .map(super::from_millis),
        reviewed_at: row
            .try_get::<Option<i64>, _>("reviewed_at")?
            .map(super::from_millis),
        decision: row.try_get("decision")?,
        notes: row.try_get("notes")?,
        anonymized: row.try_get("anonymized")?,
        blur_level: row.try_get::<i64, _>("blur_level")? as u8,
    })
}
