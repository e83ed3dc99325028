//! Saved monitoring profile rows.

use sqlx::{Row, SqlitePool};

use crate::error::Error;

use super::types::{Scenario, UserProfile};

pub async fn insert(pool: &SqlitePool, profile: &UserProfile) -> Result<(), Error> {
    let prefs = serde_json::to_string(&profile.preferences)
        .map_err(|e| Error::InvalidInput(format!("unserializable preferences: {e}")))?;

    sqlx::query(
        r#"INSERT INTO user_profiles (id, user_id, name, scenario, preferences, active, created_at)
           VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"#,
    )
    .bind(&profile.id)
    .bind(&profile.user_id)
    .bind(&profile.name)
    .bind(profile.scenario.as_str())
    .bind(prefs)
    .bind(profile.active)
    .bind(profile.created_at.timestamp_millis())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn list(pool: &SqlitePool) -> Result<Vec<UserProfile>, Error> {
    let rows = sqlx::query("SELECT * FROM user_profiles ORDER BY created_at DESC")
        .fetch_all(pool)
        .await?;
    rows.into_iter().map(profile_from_row).collect()
}

pub async fn delete(pool: &SqlitePool, id: &str) -> Result<bool, Error> {
    let result = sqlx::query("DELETE FROM user_profiles WHERE id = ?1")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Mark one profile active and deactivate its owner's others in one
/// transaction. Returns `false` when the profile does not exist.
pub async fn activate(pool: &SqlitePool, id: &str) -> Result<bool, Error> {
    let mut tx = pool.begin().await?;

    let owner: Option<Option<String>> =
        sqlx::query_scalar("SELECT user_id FROM user_profiles WHERE id = ?1")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;

    let Some(owner) = owner else {
        return Ok(false);
    };

    sqlx::query("UPDATE user_profiles SET active = 0 WHERE user_id IS ?1")
        .bind(&owner)
        .execute(&mut *tx)
        .await?;
    sqlx::query("UPDATE user_profiles SET active = 1 WHERE id = ?1")
        .bind(id)
        .execute(&mut *tx)
        .await?;

    tx.commit().await?;
    Ok(true)
}

fn profile_from_row(row: sqlx::sqlite::SqliteRow) -> Result<UserProfile, Error> {
    let scenario: String = row.try_get("scenario")?;
    let prefs: String = row.try_get("preferences")?;

    Ok(UserProfile {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        name: row.try_get("name")?,
        scenario: Scenario::parse(&scenario)
            .ok_or_else(|| Error::Parse(format!("bad scenario `{scenario}` in profile row")))?,
        preferences: serde_json::from_str(&prefs)
            .map_err(|e| Error::Parse(format!("bad profile preferences: {e}")))?,
        active: row.try_get("active")?,
        created_at: super::from_millis(row.try_get("created_at")?),
    })
}
