//! Notification subscription rows.
//!
//! Each channel has its own table keyed by the channel's natural identifier,
//! so registering the same endpoint/number/chat twice upserts into a single
//! logical subscription.

use sqlx::{Row, SqlitePool};

use crate::error::Error;

use super::types::PushSubscription;

pub async fn upsert_push(pool: &SqlitePool, sub: &PushSubscription) -> Result<(), Error> {
    sqlx::query(
        r#"INSERT INTO push_subscriptions (endpoint, p256dh, auth, user_id, created_at)
           VALUES (?1, ?2, ?3, ?4, ?5)
           ON CONFLICT(endpoint) DO UPDATE SET
               p256dh = excluded.p256dh,
               auth = excluded.auth,
               user_id = excluded.user_id"#,
    )
    .bind(&sub.endpoint)
    .bind(&sub.p256dh)
    .bind(&sub.auth)
    .bind(&sub.user_id)
    .bind(chrono::Utc::now().timestamp_millis())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn list_push(pool: &SqlitePool) -> Result<Vec<PushSubscription>, Error> {
    let rows = sqlx::query("SELECT * FROM push_subscriptions")
        .fetch_all(pool)
        .await?;
    rows.into_iter()
        .map(|row| {
            Ok(PushSubscription {
                endpoint: row.try_get("endpoint")?,
                p256dh: row.try_get("p256dh")?,
                auth: row.try_get("auth")?,
                user_id: row.try_get("user_id")?,
            })
        })
        .collect()
}

/// Prune a push endpoint the provider reported permanently gone (404/410).
pub async fn remove_push(pool: &SqlitePool, endpoint: &str) -> Result<bool, Error> {
    let result = sqlx::query("DELETE FROM push_subscriptions WHERE endpoint = ?1")
        .bind(endpoint)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn upsert_sms(
    pool: &SqlitePool,
    e164: &str,
    user_id: Option<&str>,
) -> Result<(), Error> {
    sqlx::query(
        r#"INSERT INTO sms_recipients (e164, user_id, created_at)
           VALUES (?1, ?2, ?3)
           ON CONFLICT(e164) DO UPDATE SET user_id = excluded.user_id"#,
    )
    .bind(e164)
    .bind(user_id)
    .bind(chrono::Utc::now().timestamp_millis())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn list_sms(pool: &SqlitePool) -> Result<Vec<String>, Error> {
    let rows = sqlx::query_scalar("SELECT e164 FROM sms_recipients")
        .fetch_all(pool)
        .await?;
    Ok(rows)
}

pub async fn upsert_chat(
    pool: &SqlitePool,
    chat_id: &str,
    user_id: Option<&str>,
) -> Result<(), Error> {
    sqlx::query(
        r#"INSERT INTO chat_recipients (chat_id, user_id, created_at)
           VALUES (?1, ?2, ?3)
           ON CONFLICT(chat_id) DO UPDATE SET user_id = excluded.user_id"#,
    )
    .bind(chat_id)
    .bind(user_id)
    .bind(chrono::Utc::now().timestamp_millis())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn list_chat(pool: &SqlitePool) -> Result<Vec<String>, Error> {
    let rows = sqlx::query_scalar("SELECT chat_id FROM chat_recipients")
        .fetch_all(pool)
        .await?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store;

    fn sub(endpoint: &str) -> PushSubscription {
        PushSubscription {
            endpoint: endpoint.into(),
            p256dh: "BKey".into(),
            auth: "auth-secret".into(),
            user_id: Some("u-1".into()),
        }
    }

    #[tokio::test]
    async fn push_subscription_dedupes_by_endpoint() {
        let pool = store::open_in_memory().await.unwrap();
        upsert_push(&pool, &sub("https://push.example/ep1")).await.unwrap();

        // Same endpoint with refreshed keys: still one logical subscription.
        let mut refreshed = sub("https://push.example/ep1");
        refreshed.p256dh = "BNewKey".into();
        upsert_push(&pool, &refreshed).await.unwrap();

        let all = list_push(&pool).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].p256dh, "BNewKey");
    }

    #[tokio::test]
    async fn remove_push_prunes_gone_endpoint() {
        let pool = store::open_in_memory().await.unwrap();
        upsert_push(&pool, &sub("https://push.example/ep1")).await.unwrap();
        assert!(remove_push(&pool, "https://push.example/ep1").await.unwrap());
        assert!(list_push(&pool).await.unwrap().is_empty());
        assert!(!remove_push(&pool, "https://push.example/ep1").await.unwrap());
    }

    #[tokio::test]
    async fn sms_and_chat_recipients_dedupe() {
        let pool = store::open_in_memory().await.unwrap();
        upsert_sms(&pool, "+15550001111", None).await.unwrap();
        upsert_sms(&pool, "+15550001111", Some("u-1")).await.unwrap();
        assert_eq!(list_sms(&pool).await.unwrap().len(), 1);

        upsert_chat(&pool, "12345", None).await.unwrap();
        upsert_chat(&pool, "12345", None).await.unwrap();
        assert_eq!(list_chat(&pool).await.unwrap(), vec!["12345".to_string()]);
    }
}
