//! A durable report request queue stored in the shared SQLite file.
//!
//! Delivery rules:
//! - Messages with the same key (user id) are handed out strictly in publish order: only the oldest
//!   outstanding message of a key can be claimed, so a second request for a user waits until the
//!   first one is acknowledged.
//! - A claim is a lease. If the consumer does not acknowledge within the visibility timeout (it
//!   crashed, say), the message becomes claimable again and is redelivered.
//! - Acknowledging deletes the message.
//! - A queue handle made [`SqliteQueue::private`] only claims the messages it published itself,
//!   and shared handles never claim those. An in-process worker therefore cannot take requests
//!   another process is waiting on, and a standalone worker cannot take its requests.

use crate::db::Db;
use crate::error::{ErrorType, IntoResult};
use crate::model::ReportRequest;
use crate::transport::{
    with_retry, Delivery, RequestConsumer, RequestPublisher, RetryConfig, WireMessage,
};
use crate::Result;
use anyhow::Context;
use chrono::Utc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};
use uuid::Uuid;

const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

const CLAIM_SQL: &str = "\
UPDATE report_request
SET claimed_by = ?, claimed_at = ?, attempts = attempts + 1
WHERE seq = (
    SELECT r.seq FROM report_request r
    WHERE r.owner IS ?
      AND (r.claimed_at IS NULL OR r.claimed_at <= ?)
      AND NOT EXISTS (
          SELECT 1 FROM report_request p
          WHERE p.msg_key = r.msg_key AND p.owner IS r.owner AND p.seq < r.seq
      )
    ORDER BY r.seq
    LIMIT 1
)
RETURNING seq, correlation_id, msg_key, msg_value, attempts";

#[derive(Debug, Clone)]
pub struct SqliteQueue {
    db: Db,
    consumer_id: String,
    owner: Option<String>,
    visibility_timeout: Duration,
    poll_interval: Duration,
    retry: RetryConfig,
}

impl SqliteQueue {
    pub fn new(db: Db) -> Self {
        Self {
            db,
            consumer_id: Uuid::new_v4().to_string(),
            owner: None,
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            retry: RetryConfig::default(),
        }
    }

    /// Scopes this handle and its clones to their own messages: what they publish is invisible to
    /// every other handle, and they claim nothing else.
    pub fn private(mut self) -> Self {
        self.owner = Some(self.consumer_id.clone());
        self
    }

    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Number of messages not yet acknowledged, claimed or not.
    pub async fn depth(&self) -> Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM report_request")
            .fetch_one(self.db.pool())
            .await
            .context("Failed to count queued report requests")
            .pub_result(ErrorType::Transport)
    }

    async fn insert(&self, message: &WireMessage) -> Result<()> {
        sqlx::query(
            "INSERT INTO report_request (correlation_id, msg_key, msg_value, owner, enqueued_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&message.correlation_id)
        .bind(&message.key)
        .bind(&message.value)
        .bind(&self.owner)
        .bind(Utc::now().timestamp_millis())
        .execute(self.db.pool())
        .await
        .context("Failed to enqueue report request")
        .pub_result(ErrorType::Transport)?;
        Ok(())
    }

    /// Claims the next deliverable message, if there is one.
    async fn claim(&self) -> Result<Option<Delivery>> {
        let now = Utc::now().timestamp_millis();
        let lease = i64::try_from(self.visibility_timeout.as_millis()).unwrap_or(i64::MAX);
        let row: Option<(i64, String, String, String, i64)> = sqlx::query_as(CLAIM_SQL)
            .bind(&self.consumer_id)
            .bind(now)
            .bind(&self.owner)
            .bind(now.saturating_sub(lease))
            .fetch_optional(self.db.pool())
            .await
            .context("Failed to claim report request")
            .pub_result(ErrorType::Transport)?;

        Ok(row.map(|(seq, correlation_id, key, value, attempts)| Delivery {
            receipt: seq,
            message: WireMessage {
                correlation_id,
                key,
                value,
            },
            attempt: attempts,
        }))
    }
}

#[async_trait::async_trait]
impl RequestPublisher for SqliteQueue {
    async fn publish(&self, request: &ReportRequest) -> Result<()> {
        let message = WireMessage::encode(request);
        with_retry(&self.retry, "publish", || self.insert(&message)).await?;
        trace!(correlation_id = %request.correlation_id, key = %message.key, "Published report request");
        Ok(())
    }
}

#[async_trait::async_trait]
impl RequestConsumer for SqliteQueue {
    async fn next(&self, cancel: &CancellationToken) -> Result<Option<Delivery>> {
        loop {
            if cancel.is_cancelled() {
                return Ok(None);
            }
            if let Some(delivery) = self.claim().await? {
                if delivery.attempt > 1 {
                    debug!(
                        receipt = delivery.receipt,
                        attempt = delivery.attempt,
                        "Redelivering report request"
                    );
                }
                return Ok(Some(delivery));
            }
            tokio::select! {
                _ = cancel.cancelled() => return Ok(None),
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        let result = sqlx::query("DELETE FROM report_request WHERE seq = ? AND claimed_by = ?")
            .bind(delivery.receipt)
            .bind(&self.consumer_id)
            .execute(self.db.pool())
            .await
            .context("Failed to acknowledge report request")
            .pub_result(ErrorType::Transport)?;
        if result.rows_affected() == 0 {
            // our lease ran out and another consumer owns the message now
            debug!(receipt = delivery.receipt, "Acknowledged a message we no longer hold");
        }
        Ok(())
    }
}
