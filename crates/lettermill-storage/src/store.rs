//! Campaign store - the persistence contract the send engine runs against

use crate::db::DatabasePool;
use crate::models::{Bounce, Campaign, CampaignStatus, Subscriber};
use async_trait::async_trait;
use chrono::{DateTime, Timelike, Utc};
use lettermill_common::config::BounceActions;
use lettermill_common::{Error, Result};
use tracing::{debug, info, warn};

/// Storage contract for the campaign send engine.
///
/// The engine never touches SQL directly; everything it needs from the
/// relational store goes through this trait so tests can substitute an
/// in-memory implementation.
#[async_trait]
pub trait CampaignStore: Send + Sync {
    /// Campaigns in running/scheduled state (whose send time has arrived)
    /// that are not in `exclude`, i.e. have no live pipe yet.
    async fn next_campaigns(&self, exclude: &[i64]) -> Result<Vec<Campaign>>;

    /// Fetch a campaign by id.
    async fn get_campaign(&self, id: i64) -> Result<Campaign>;

    /// Transition a campaign's status.
    async fn update_campaign_status(&self, id: i64, status: CampaignStatus) -> Result<()>;

    /// Fetch up to `limit` not-yet-processed enabled subscribers for the
    /// campaign, ascending by id, advancing the campaign's cursor.
    async fn next_subscribers(&self, campaign_id: i64, limit: usize) -> Result<Vec<Subscriber>>;

    /// Messages recorded as sent for the campaign during the UTC hour of `at`.
    async fn get_campaign_hourly_sent(&self, campaign_id: i64, at: DateTime<Utc>) -> Result<i64>;

    /// Upsert the per-hour sent counter after a successful dispatch.
    async fn increment_campaign_hourly_sent(
        &self,
        campaign_id: i64,
        at: DateTime<Utc>,
    ) -> Result<()>;

    /// Apply accumulated counter deltas and advance the high-water
    /// subscriber id.
    async fn update_campaign_counts(
        &self,
        campaign_id: i64,
        to_send_delta: i64,
        sent_delta: i64,
        last_subscriber_id: i64,
    ) -> Result<()>;

    /// Record a bounce, resolving the subscriber by uuid or email and
    /// applying the configured bounce action at the threshold.
    async fn record_bounce(&self, bounce: &Bounce) -> Result<()>;
}

/// Postgres-backed campaign store
#[derive(Clone)]
pub struct PgCampaignStore {
    db: DatabasePool,
    bounce_actions: BounceActions,
}

impl PgCampaignStore {
    pub fn new(db: DatabasePool, bounce_actions: BounceActions) -> Self {
        Self { db, bounce_actions }
    }
}

#[async_trait]
impl CampaignStore for PgCampaignStore {
    async fn next_campaigns(&self, exclude: &[i64]) -> Result<Vec<Campaign>> {
        let campaigns = sqlx::query_as::<_, Campaign>(
            r#"
            SELECT * FROM campaigns
            WHERE status IN ('running', 'scheduled')
              AND (send_at IS NULL OR send_at <= NOW())
              AND NOT (id = ANY($1))
            ORDER BY id
            "#,
        )
        .bind(exclude)
        .fetch_all(self.db.pool())
        .await
        .map_err(|e| Error::Database(format!("error fetching campaigns: {}", e)))?;

        Ok(campaigns)
    }

    async fn get_campaign(&self, id: i64) -> Result<Campaign> {
        sqlx::query_as::<_, Campaign>("SELECT * FROM campaigns WHERE id = $1")
            .bind(id)
            .fetch_optional(self.db.pool())
            .await
            .map_err(|e| Error::Database(format!("error fetching campaign {}: {}", id, e)))?
            .ok_or_else(|| Error::NotFound(format!("campaign {}", id)))
    }

    async fn update_campaign_status(&self, id: i64, status: CampaignStatus) -> Result<()> {
        sqlx::query("UPDATE campaigns SET status = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(status.as_str())
            .execute(self.db.pool())
            .await
            .map_err(|e| Error::Database(format!("error updating campaign {} status: {}", id, e)))?;

        Ok(())
    }

    async fn next_subscribers(&self, campaign_id: i64, limit: usize) -> Result<Vec<Subscriber>> {
        // The batch fetch and the cursor advance happen in one transaction so
        // a requeued pipe can't see the same subscribers twice even before
        // the sent counters are flushed.
        let mut tx = self
            .db
            .pool()
            .begin()
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        let subs = sqlx::query_as::<_, Subscriber>(
            r#"
            SELECT s.id, s.uuid, s.email, s.name, s.attribs, s.status
            FROM subscribers s
            WHERE s.status = 'enabled'
              AND s.id > (SELECT last_subscriber_id FROM campaigns WHERE id = $1)
              AND EXISTS (
                  SELECT 1 FROM subscriber_lists sl
                  JOIN campaign_lists cl ON cl.list_id = sl.list_id
                  WHERE cl.campaign_id = $1 AND sl.subscriber_id = s.id
              )
            ORDER BY s.id
            LIMIT $2
            "#,
        )
        .bind(campaign_id)
        .bind(limit as i64)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| Error::Database(format!("error fetching subscribers: {}", e)))?;

        if let Some(last) = subs.last() {
            sqlx::query(
                r#"
                UPDATE campaigns
                SET last_subscriber_id = GREATEST(last_subscriber_id, $2)
                WHERE id = $1
                "#,
            )
            .bind(campaign_id)
            .bind(last.id)
            .execute(&mut *tx)
            .await
            .map_err(|e| Error::Database(format!("error advancing cursor: {}", e)))?;
        }

        tx.commit()
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        Ok(subs)
    }

    async fn get_campaign_hourly_sent(&self, campaign_id: i64, at: DateTime<Utc>) -> Result<i64> {
        let count: Option<(i32,)> = sqlx::query_as(
            r#"
            SELECT sent_count FROM campaign_send_quota
            WHERE campaign_id = $1 AND date = $2 AND hour = $3
            "#,
        )
        .bind(campaign_id)
        .bind(at.date_naive())
        .bind(at.hour() as i16)
        .fetch_optional(self.db.pool())
        .await
        .map_err(|e| Error::Database(format!("error fetching hourly sent count: {}", e)))?;

        Ok(count.map(|(c,)| c as i64).unwrap_or(0))
    }

    async fn increment_campaign_hourly_sent(
        &self,
        campaign_id: i64,
        at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO campaign_send_quota (campaign_id, date, hour, sent_count)
            VALUES ($1, $2, $3, 1)
            ON CONFLICT (campaign_id, date, hour)
            DO UPDATE SET sent_count = campaign_send_quota.sent_count + 1
            "#,
        )
        .bind(campaign_id)
        .bind(at.date_naive())
        .bind(at.hour() as i16)
        .execute(self.db.pool())
        .await
        .map_err(|e| Error::Database(format!("error upserting hourly sent count: {}", e)))?;

        Ok(())
    }

    async fn update_campaign_counts(
        &self,
        campaign_id: i64,
        to_send_delta: i64,
        sent_delta: i64,
        last_subscriber_id: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE campaigns
            SET to_send = to_send + $2,
                sent = sent + $3,
                last_subscriber_id = GREATEST(last_subscriber_id, $4),
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(campaign_id)
        .bind(to_send_delta as i32)
        .bind(sent_delta as i32)
        .bind(last_subscriber_id)
        .execute(self.db.pool())
        .await
        .map_err(|e| Error::Database(format!("error updating campaign counts: {}", e)))?;

        Ok(())
    }

    async fn record_bounce(&self, bounce: &Bounce) -> Result<()> {
        // Re-validate UUIDs defensively; malformed values fall back to the
        // email lookup.
        let subscriber_uuid = valid_uuid_or_empty(&bounce.subscriber_uuid);
        let campaign_uuid = valid_uuid_or_empty(&bounce.campaign_uuid);

        let mut tx = self
            .db
            .pool()
            .begin()
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        // Resolve the subscriber: uuid first, email fallback.
        let subscriber_id: Option<(i64,)> = if !subscriber_uuid.is_empty() {
            sqlx::query_as("SELECT id FROM subscribers WHERE uuid = $1::uuid")
                .bind(&subscriber_uuid)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| Error::Database(e.to_string()))?
        } else if !bounce.email.is_empty() {
            sqlx::query_as("SELECT id FROM subscribers WHERE email = LOWER($1)")
                .bind(&bounce.email)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| Error::Database(e.to_string()))?
        } else {
            None
        };

        let Some((subscriber_id,)) = subscriber_id else {
            // Not an error: the address may have been deleted since the send.
            warn!(
                email = %bounce.email,
                subscriber_uuid = %subscriber_uuid,
                "bounced subscriber not found"
            );
            return Ok(());
        };

        let campaign_id: Option<(i64,)> = if !campaign_uuid.is_empty() {
            sqlx::query_as("SELECT id FROM campaigns WHERE uuid = $1::uuid")
                .bind(&campaign_uuid)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| Error::Database(e.to_string()))?
        } else {
            None
        };

        sqlx::query(
            r#"
            INSERT INTO bounces (subscriber_id, campaign_id, type, source, meta, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(subscriber_id)
        .bind(campaign_id.map(|(id,)| id))
        .bind(bounce.bounce_type.as_str())
        .bind(&bounce.source)
        .bind(&bounce.meta)
        .bind(bounce.created_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| Error::Database(format!("error recording bounce: {}", e)))?;

        // Apply the configured action once the per-type count hits the
        // threshold.
        let action = match bounce.bounce_type {
            crate::models::BounceType::Hard => &self.bounce_actions.hard,
            crate::models::BounceType::Soft => &self.bounce_actions.soft,
            crate::models::BounceType::Complaint => &self.bounce_actions.complaint,
        };

        if action.action != "none" {
            let (count,): (i64,) = sqlx::query_as(
                "SELECT COUNT(*) FROM bounces WHERE subscriber_id = $1 AND type = $2",
            )
            .bind(subscriber_id)
            .bind(bounce.bounce_type.as_str())
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

            if count >= action.count {
                match action.action.as_str() {
                    "blocklist" => {
                        sqlx::query(
                            "UPDATE subscribers SET status = 'blocklisted' WHERE id = $1",
                        )
                        .bind(subscriber_id)
                        .execute(&mut *tx)
                        .await
                        .map_err(|e| Error::Database(e.to_string()))?;

                        info!(
                            subscriber_id,
                            count, "blocklisted subscriber after bounces"
                        );
                    }
                    "delete" => {
                        sqlx::query("DELETE FROM subscribers WHERE id = $1")
                            .bind(subscriber_id)
                            .execute(&mut *tx)
                            .await
                            .map_err(|e| Error::Database(e.to_string()))?;

                        info!(subscriber_id, count, "deleted subscriber after bounces");
                    }
                    other => {
                        warn!(action = other, "unknown bounce action, ignoring");
                    }
                }
            }
        }

        tx.commit()
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        debug!(
            email = %bounce.email,
            campaign_uuid = %campaign_uuid,
            r#type = %bounce.bounce_type,
            "bounce recorded"
        );

        Ok(())
    }
}

/// Returns the input if it parses as a UUID, the empty string otherwise.
fn valid_uuid_or_empty(s: &str) -> String {
    if !s.is_empty() && uuid::Uuid::parse_str(s).is_ok() {
        s.to_string()
    } else {
        String::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_uuid_or_empty() {
        assert_eq!(
            valid_uuid_or_empty("550e8400-e29b-41d4-a716-446655440000"),
            "550e8400-e29b-41d4-a716-446655440000"
        );
        assert_eq!(valid_uuid_or_empty("not-a-uuid"), "");
        assert_eq!(valid_uuid_or_empty(""), "");
    }
}
