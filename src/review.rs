//! Human-review queue.
//!
//! Flagged content is leased to one reviewer at a time, highest tier first.
//! Decisions apply their side effects here: dismissing or blocking the flag,
//! ending the offending stream, banning its user. Tier-3/4 items are
//! anonymized for non-privileged reviewers — they see a stable hash instead
//! of the raw stream id.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use tracing::{info, warn};
use uuid::Uuid;

use crate::banlist::BanList;
use crate::error::Error;
use crate::profiles;
use crate::store;
use crate::store::types::{ContentFlag, FlagStatus, ReviewDecision, ReviewItem};
use crate::streams::StreamManager;

pub struct ReviewQueue {
    pool: SqlitePool,
    streams: Arc<StreamManager>,
    banlist: Arc<BanList>,
    lease_timeout: Duration,
}

impl ReviewQueue {
    pub fn new(
        pool: SqlitePool,
        streams: Arc<StreamManager>,
        banlist: Arc<BanList>,
        lease_timeout: Duration,
    ) -> Self {
        Self { pool, streams, banlist, lease_timeout }
    }

    /// Insert a standalone flag (one not created by the pipeline's atomic
    /// alert+flag path) and queue it for review.
    pub async fn enqueue(&self, flag: &ContentFlag) -> Result<(), Error> {
        store::alerts::insert_flag(&self.pool, flag).await?;
        store::review::enqueue(
            &self.pool,
            &Uuid::new_v4().to_string(),
            &flag.id,
            flag.tier,
            flag.created_at.timestamp_millis(),
            flag.tier >= 3,
            profiles::blur_level(flag.tier),
        )
        .await?;
        info!(flag = %flag.id, tier = flag.tier, "flag queued for review");
        Ok(())
    }

    /// Lease the highest-priority pending item to `reviewer_id`.
    ///
    /// Non-privileged reviewers get anonymized tier-3/4 items: the stream id
    /// is replaced by a stable hash.
    pub async fn next_for_reviewer(
        &self,
        reviewer_id: &str,
        privileged: bool,
    ) -> Result<Option<ReviewItem>, Error> {
        let item =
            store::review::claim_next(&self.pool, reviewer_id, Utc::now().timestamp_millis())
                .await?;
        Ok(item.map(|mut item| {
            if item.anonymized && !privileged {
                item.stream_id = redacted_stream_id(&item.stream_id);
            }
            item
        }))
    }

    /// Apply a reviewer's decision. Only the current lessee may submit.
    pub async fn submit(
        &self,
        item_id: &str,
        reviewer_id: &str,
        decision: ReviewDecision,
        notes: Option<&str>,
    ) -> Result<(), Error> {
        let item = store::review::get(&self.pool, item_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("review item {item_id}")))?;

        let now = Utc::now().timestamp_millis();
        let (queue_status, force_tier) = match decision {
            ReviewDecision::Safe | ReviewDecision::Block | ReviewDecision::Ban => {
                (FlagStatus::Reviewed, None)
            }
            ReviewDecision::Escalate => (FlagStatus::Escalated, Some(4)),
        };

        let applied = store::review::resolve(
            &self.pool,
            item_id,
            reviewer_id,
            queue_status,
            decision.as_str(),
            notes,
            now,
            force_tier,
        )
        .await?;
        if !applied {
            return Err(Error::Conflict(format!(
                "review item {item_id} is not leased to {reviewer_id}"
            )));
        }

        match decision {
            ReviewDecision::Safe => {
                store::alerts::set_flag_status(&self.pool, &item.flag_id, FlagStatus::Dismissed)
                    .await?;
            }
            ReviewDecision::Block => {
                store::alerts::set_flag_status(&self.pool, &item.flag_id, FlagStatus::Blocked)
                    .await?;
                self.end_stream(&item.stream_id).await;
            }
            ReviewDecision::Escalate => {
                store::alerts::set_flag_status(&self.pool, &item.flag_id, FlagStatus::Escalated)
                    .await?;
                // Back into the pending pool at tier 4 for a privileged pickup.
                store::review::requeue_escalated(&self.pool, item_id).await?;
            }
            ReviewDecision::Ban => {
                store::alerts::set_flag_status(&self.pool, &item.flag_id, FlagStatus::Blocked)
                    .await?;
                if let Ok(Some(stream)) = self.streams.get(&item.stream_id).await {
                    if let Some(user) = &stream.user_id {
                        if let Err(e) = self.banlist.ban(user).await {
                            warn!(user = %user, error = %e, "ban persist failed");
                        }
                    }
                }
                self.end_stream(&item.stream_id).await;
            }
        }

        info!(
            item = %item_id,
            reviewer = %reviewer_id,
            decision = decision.as_str(),
            "review decision applied"
        );
        Ok(())
    }

    /// Return expired leases to the pending pool.
    pub async fn sweep_expired(&self) -> Result<u64, Error> {
        let cutoff = Utc::now().timestamp_millis() - self.lease_timeout.as_millis() as i64;
        let reclaimed = store::review::expire_leases(&self.pool, cutoff).await?;
        if reclaimed > 0 {
            info!(reclaimed, "expired review leases returned to pending");
        }
        Ok(reclaimed)
    }

    async fn end_stream(&self, stream_id: &str) {
        if let Err(e) = self.streams.end(stream_id).await {
            warn!(stream = %stream_id, error = %e, "stream end from review failed");
        }
    }
}

/// Stable, non-reversible stand-in for a stream id.
fn redacted_stream_id(stream_id: &str) -> String {
    let digest = Sha256::digest(stream_id.as_bytes());
    let hex: String = digest.iter().take(8).map(|b| format!("{b:02x}")).collect();
    format!("anon-{hex}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::store::types::{Scenario, StreamStatus};

    struct Fixture {
        queue: ReviewQueue,
        pool: SqlitePool,
        streams: Arc<StreamManager>,
        banlist: Arc<BanList>,
    }

    async fn fixture() -> Fixture {
        let pool = store::open_in_memory().await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let banlist = Arc::new(BanList::load(&dir.path().join("bans.json")).await.unwrap());
        std::mem::forget(dir);
        let streams = Arc::new(StreamManager::new(
            pool.clone(),
            EventBus::new(16),
            Arc::clone(&banlist),
            Duration::from_secs(60),
        ));
        let queue = ReviewQueue::new(
            pool.clone(),
            Arc::clone(&streams),
            Arc::clone(&banlist),
            Duration::from_secs(600),
        );
        Fixture { queue, pool, streams, banlist }
    }

    fn flag(id: &str, stream_id: &str, tier: u8, age_secs: i64) -> ContentFlag {
        ContentFlag {
            id: id.into(),
            stream_id: stream_id.into(),
            frame_id: None,
            tier,
            categories: vec!["sensitive".into()],
            status: FlagStatus::Pending,
            created_at: Utc::now() - chrono::Duration::seconds(age_secs),
        }
    }

    // -----------------------------------------------------------------------
    // Leasing
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn two_reviewers_get_distinct_items_oldest_first() {
        let f = fixture().await;
        f.queue.enqueue(&flag("f-old", "s-1", 3, 120)).await.unwrap();
        f.queue.enqueue(&flag("f-new", "s-1", 3, 10)).await.unwrap();

        let first = f.queue.next_for_reviewer("r1", true).await.unwrap().unwrap();
        let second = f.queue.next_for_reviewer("r2", true).await.unwrap().unwrap();
        assert_eq!(first.flag_id, "f-old");
        assert_eq!(second.flag_id, "f-new");

        assert!(f.queue.next_for_reviewer("r1", true).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn tier_three_items_are_anonymized_for_non_privileged_reviewers() {
        let f = fixture().await;
        f.queue.enqueue(&flag("f-1", "stream-secret", 3, 0)).await.unwrap();

        let item = f.queue.next_for_reviewer("r1", false).await.unwrap().unwrap();
        assert!(item.anonymized);
        assert!(item.stream_id.starts_with("anon-"), "got {}", item.stream_id);
        assert_eq!(item.stream_id, redacted_stream_id("stream-secret"));
        assert_eq!(item.blur_level, 2);
    }

    #[tokio::test]
    async fn privileged_reviewers_see_the_raw_stream_id() {
        let f = fixture().await;
        f.queue.enqueue(&flag("f-1", "stream-secret", 4, 0)).await.unwrap();
        let item = f.queue.next_for_reviewer("r1", true).await.unwrap().unwrap();
        assert_eq!(item.stream_id, "stream-secret");
    }

    #[tokio::test]
    async fn tier_one_items_are_never_anonymized() {
        let f = fixture().await;
        f.queue.enqueue(&flag("f-1", "s-1", 1, 0)).await.unwrap();
        let item = f.queue.next_for_reviewer("r1", false).await.unwrap().unwrap();
        assert!(!item.anonymized);
        assert_eq!(item.stream_id, "s-1");
    }

    // -----------------------------------------------------------------------
    // Decisions
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn safe_dismisses_the_flag_and_leaves_the_stream_alone() {
        let f = fixture().await;
        let stream = f.streams.create(Scenario::Pet, None, None).await.unwrap();
        f.queue.enqueue(&flag("f-1", &stream.id, 2, 0)).await.unwrap();

        let item = f.queue.next_for_reviewer("r1", true).await.unwrap().unwrap();
        f.queue
            .submit(&item.id, "r1", ReviewDecision::Safe, Some("pet toy"))
            .await
            .unwrap();

        let stored = store::alerts::get_flag(&f.pool, "f-1").await.unwrap().unwrap();
        assert_eq!(stored.status, FlagStatus::Dismissed);
        assert_eq!(
            f.streams.get_live(&stream.id).unwrap().status,
            StreamStatus::Active
        );
    }

    #[tokio::test]
    async fn block_ends_the_stream() {
        let f = fixture().await;
        let stream = f.streams.create(Scenario::Pet, None, None).await.unwrap();
        f.queue.enqueue(&flag("f-1", &stream.id, 3, 0)).await.unwrap();

        let item = f.queue.next_for_reviewer("r1", true).await.unwrap().unwrap();
        f.queue
            .submit(&item.id, "r1", ReviewDecision::Block, None)
            .await
            .unwrap();

        let stored = store::alerts::get_flag(&f.pool, "f-1").await.unwrap().unwrap();
        assert_eq!(stored.status, FlagStatus::Blocked);
        let record = store::streams::get(&f.pool, &stream.id).await.unwrap().unwrap();
        assert_eq!(record.status, StreamStatus::Disconnected);
    }

    #[tokio::test]
    async fn escalate_requeues_at_tier_four() {
        let f = fixture().await;
        f.queue.enqueue(&flag("f-1", "s-1", 2, 0)).await.unwrap();

        let item = f.queue.next_for_reviewer("r1", false).await.unwrap().unwrap();
        f.queue
            .submit(&item.id, "r1", ReviewDecision::Escalate, Some("needs senior eyes"))
            .await
            .unwrap();

        // A privileged reviewer picks it back up at tier 4, lease metadata fresh.
        let again = f.queue.next_for_reviewer("r2", true).await.unwrap().unwrap();
        assert_eq!(again.id, item.id);
        assert_eq!(again.tier, 4);
        assert_eq!(again.assigned_to.as_deref(), Some("r2"));
    }

    #[tokio::test]
    async fn ban_ends_the_stream_and_persists_the_user() {
        let f = fixture().await;
        let stream = f
            .streams
            .create(Scenario::Pet, None, Some("u-133".into()))
            .await
            .unwrap();
        f.queue.enqueue(&flag("f-1", &stream.id, 4, 0)).await.unwrap();

        let item = f.queue.next_for_reviewer("r1", true).await.unwrap().unwrap();
        f.queue
            .submit(&item.id, "r1", ReviewDecision::Ban, None)
            .await
            .unwrap();

        assert!(f.banlist.is_banned("u-133").await);
        let record = store::streams::get(&f.pool, &stream.id).await.unwrap().unwrap();
        assert_eq!(record.status, StreamStatus::Disconnected);
    }

    #[tokio::test]
    async fn only_the_lessee_may_submit() {
        let f = fixture().await;
        f.queue.enqueue(&flag("f-1", "s-1", 2, 0)).await.unwrap();
        let item = f.queue.next_for_reviewer("r1", false).await.unwrap().unwrap();

        let err = f
            .queue
            .submit(&item.id, "intruder", ReviewDecision::Safe, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));

        let err = f
            .queue
            .submit("ghost-item", "r1", ReviewDecision::Safe, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    // -----------------------------------------------------------------------
    // Lease expiry
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn expired_lease_returns_item_to_pending() {
        let pool = store::open_in_memory().await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let banlist = Arc::new(BanList::load(&dir.path().join("bans.json")).await.unwrap());
        let streams = Arc::new(StreamManager::new(
            pool.clone(),
            EventBus::new(16),
            Arc::clone(&banlist),
            Duration::from_secs(60),
        ));
        let queue = ReviewQueue::new(pool, streams, banlist, Duration::from_millis(5));

        queue.enqueue(&flag("f-1", "s-1", 2, 0)).await.unwrap();
        queue.next_for_reviewer("r1", false).await.unwrap().unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(queue.sweep_expired().await.unwrap(), 1);

        let reclaimed = queue.next_for_reviewer("r2", false).await.unwrap();
        assert!(reclaimed.is_some());
    }
}
