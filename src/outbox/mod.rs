//! Durable outbox for externally observable side effects. Every webhook
//! call, Slack alert, and outbound queue publish is recorded before delivery
//! is attempted, decoupling "the business transition committed" from "a
//! third party observed it". Records are never deleted.

mod dispatcher;
mod worker;

pub use dispatcher::{OutboxDispatcher, OutboxPolicy};
pub use worker::OutboxWorker;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Row, Sqlite, SqlitePool, sqlite::SqliteRow};
use tracing::{error, warn};
use url::Url;

use crate::error::OutboxError;
use crate::model::ParseEnumError;
use crate::queue::QUEUE_DEAD_LETTER;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutboxPayload {
    Slack {
        text: String,
    },
    Webhook {
        url: Url,
        event: String,
        data: serde_json::Value,
    },
    Queue {
        queue: String,
        dedup_key: Option<String>,
        message: serde_json::Value,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboxStatus {
    Pending,
    Delivering,
    Delivered,
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Delivering => "DELIVERING",
            Self::Delivered => "DELIVERED",
            Self::Failed => "FAILED",
        }
    }
}

impl std::str::FromStr for OutboxStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "DELIVERING" => Ok(Self::Delivering),
            "DELIVERED" => Ok(Self::Delivered),
            "FAILED" => Ok(Self::Failed),
            other => Err(ParseEnumError {
                kind: "outbox status",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OutboxEvent {
    pub id: i64,
    pub payload: OutboxPayload,
    pub status: OutboxStatus,
    pub attempts: i64,
    pub available_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
}

/// Pending/failed totals reported by the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutboxBacklog {
    pub pending: i64,
    pub delivering: i64,
    pub failed: i64,
}

fn row_to_event(row: &SqliteRow) -> Result<OutboxEvent, OutboxError> {
    let payload_json: String = row.try_get("payload")?;
    let status_str: String = row.try_get("status")?;

    let status = status_str
        .parse::<OutboxStatus>()
        .map_err(|e| OutboxError::Persistence(e.into()))?;

    Ok(OutboxEvent {
        id: row.try_get("id")?,
        payload: serde_json::from_str(&payload_json)?,
        status,
        attempts: row.try_get("attempts")?,
        available_at: row
            .try_get::<chrono::NaiveDateTime, _>("available_at")?
            .and_utc(),
        last_error: row.try_get("last_error")?,
        created_at: row
            .try_get::<chrono::NaiveDateTime, _>("created_at")?
            .and_utc(),
        delivered_at: row
            .try_get::<Option<chrono::NaiveDateTime>, _>("delivered_at")?
            .map(|dt| dt.and_utc()),
    })
}

pub struct Outbox {
    pool: SqlitePool,
    dispatcher: OutboxDispatcher,
}

impl Outbox {
    pub fn new(pool: SqlitePool, dispatcher: OutboxDispatcher) -> Self {
        Self { pool, dispatcher }
    }

    /// Records the event and attempts delivery immediately. Use from code
    /// paths that are not inside an open database transaction.
    pub async fn enqueue(&self, payload: OutboxPayload) -> Result<i64, OutboxError> {
        let event_id = insert_event(&self.pool, &payload).await?;
        self.deliver(event_id).await?;
        Ok(event_id)
    }

    /// Records the event inside the caller's transaction without attempting
    /// delivery; the worker picks it up after commit. Keeps network calls
    /// out of open write transactions.
    pub async fn enqueue_within(
        &self,
        sql_tx: &mut sqlx::Transaction<'_, Sqlite>,
        payload: OutboxPayload,
    ) -> Result<i64, OutboxError> {
        let payload_json = serde_json::to_string(&payload)?;
        let result = sqlx::query("INSERT INTO outbox_events (payload) VALUES (?1)")
            .bind(&payload_json)
            .execute(&mut **sql_tx)
            .await?;

        Ok(result.last_insert_rowid())
    }

    /// Claims and delivers one record. Losing the claim race (or finding the
    /// record not yet due) is a quiet no-op.
    pub async fn deliver(&self, event_id: i64) -> Result<(), OutboxError> {
        if !claim_for_delivery(&self.pool, event_id).await? {
            return Ok(());
        }

        let event = find_event(&self.pool, event_id)
            .await?
            .ok_or(OutboxError::RecordNotFound(event_id))?;

        match self.dispatcher.dispatch(&event.payload).await {
            Ok(()) => mark_delivered(&self.pool, event_id).await,
            Err(reason) => {
                let attempts = event.attempts + 1;
                if attempts >= self.dispatcher.policy().max_attempts {
                    error!(
                        event_id,
                        attempts, reason, "outbox delivery permanently failed"
                    );
                    mark_failed(&self.pool, event_id, attempts, &reason).await?;
                    self.raise_permanent_failure(&event, &reason).await;
                    Ok(())
                } else {
                    let delay = self.dispatcher.policy().backoff_delay_secs(attempts);
                    warn!(
                        event_id,
                        attempts, delay, reason, "outbox delivery failed, backing off"
                    );
                    mark_retry(&self.pool, event_id, attempts, delay, &reason).await
                }
            }
        }
    }

    /// Redelivers every due record. Returns how many were attempted.
    pub async fn sweep_due(&self, limit: i64) -> Result<usize, OutboxError> {
        release_stale_deliveries(&self.pool).await?;

        let due = due_event_ids(&self.pool, limit).await?;
        let attempted = due.len();

        for event_id in due {
            self.deliver(event_id).await?;
        }

        Ok(attempted)
    }

    pub async fn backlog(&self) -> Result<OutboxBacklog, OutboxError> {
        backlog(&self.pool).await
    }

    /// Best-effort alerting for a permanently failed record. Failures here
    /// are logged and never propagated into the primary failure path.
    async fn raise_permanent_failure(&self, event: &OutboxEvent, reason: &str) {
        let text = format!(
            "outbox event {} exhausted retries: {reason}",
            event.id
        );
        if let Err(e) = self.dispatcher.slack().post(&text).await {
            warn!("failed to raise slack alert for dead outbox event: {e}");
        }

        let dead_letter = serde_json::json!({
            "outbox_event_id": event.id,
            "payload": event.payload,
            "reason": reason,
        });
        if let Err(e) = self
            .dispatcher
            .queue()
            .post_message(QUEUE_DEAD_LETTER, None, &dead_letter)
            .await
        {
            warn!("failed to dead-letter outbox event {}: {e}", event.id);
        }
    }
}

async fn insert_event(pool: &SqlitePool, payload: &OutboxPayload) -> Result<i64, OutboxError> {
    let payload_json = serde_json::to_string(payload)?;
    let result = sqlx::query("INSERT INTO outbox_events (payload) VALUES (?1)")
        .bind(&payload_json)
        .execute(pool)
        .await?;

    Ok(result.last_insert_rowid())
}

pub async fn find_event(
    pool: &SqlitePool,
    event_id: i64,
) -> Result<Option<OutboxEvent>, OutboxError> {
    let row = sqlx::query(
        r#"
        SELECT id, payload, status, attempts, available_at, last_error, created_at, delivered_at
        FROM outbox_events
        WHERE id = ?1
        "#,
    )
    .bind(event_id)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(row_to_event).transpose()
}

/// Conditional PENDING→DELIVERING claim; the affected-row count decides who
/// wins a concurrent delivery race.
async fn claim_for_delivery(pool: &SqlitePool, event_id: i64) -> Result<bool, OutboxError> {
    let result = sqlx::query(
        r#"
        UPDATE outbox_events
        SET status = 'DELIVERING', available_at = CURRENT_TIMESTAMP
        WHERE id = ?1 AND status = 'PENDING' AND available_at <= CURRENT_TIMESTAMP
        "#,
    )
    .bind(event_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

async fn mark_delivered(pool: &SqlitePool, event_id: i64) -> Result<(), OutboxError> {
    sqlx::query(
        r#"
        UPDATE outbox_events
        SET status = 'DELIVERED', delivered_at = CURRENT_TIMESTAMP
        WHERE id = ?1
        "#,
    )
    .bind(event_id)
    .execute(pool)
    .await?;

    Ok(())
}

async fn mark_retry(
    pool: &SqlitePool,
    event_id: i64,
    attempts: i64,
    delay_secs: i64,
    reason: &str,
) -> Result<(), OutboxError> {
    let delay_modifier = format!("+{delay_secs} seconds");
    sqlx::query(
        r#"
        UPDATE outbox_events
        SET status = 'PENDING',
            attempts = ?2,
            available_at = datetime('now', ?3),
            last_error = ?4
        WHERE id = ?1
        "#,
    )
    .bind(event_id)
    .bind(attempts)
    .bind(&delay_modifier)
    .bind(reason)
    .execute(pool)
    .await?;

    Ok(())
}

async fn mark_failed(
    pool: &SqlitePool,
    event_id: i64,
    attempts: i64,
    reason: &str,
) -> Result<(), OutboxError> {
    sqlx::query(
        r#"
        UPDATE outbox_events
        SET status = 'FAILED', attempts = ?2, last_error = ?3
        WHERE id = ?1
        "#,
    )
    .bind(event_id)
    .bind(attempts)
    .bind(reason)
    .execute(pool)
    .await?;

    Ok(())
}

async fn due_event_ids(pool: &SqlitePool, limit: i64) -> Result<Vec<i64>, OutboxError> {
    let ids: Vec<i64> = sqlx::query_scalar(
        r#"
        SELECT id FROM outbox_events
        WHERE status = 'PENDING' AND available_at <= CURRENT_TIMESTAMP
        ORDER BY id ASC
        LIMIT ?1
        "#,
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(ids)
}

/// Returns DELIVERING records abandoned by a crash to PENDING so the worker
/// can reclaim them.
async fn release_stale_deliveries(pool: &SqlitePool) -> Result<(), OutboxError> {
    const STALE_DELIVERY_MINUTES: i64 = 10;

    let threshold = format!("-{STALE_DELIVERY_MINUTES} minutes");
    let result = sqlx::query(
        r#"
        UPDATE outbox_events
        SET status = 'PENDING'
        WHERE status = 'DELIVERING' AND available_at <= datetime('now', ?1)
        "#,
    )
    .bind(&threshold)
    .execute(pool)
    .await?;

    if result.rows_affected() > 0 {
        warn!(
            "released {} stale outbox deliveries back to pending",
            result.rows_affected()
        );
    }

    Ok(())
}

async fn backlog(pool: &SqlitePool) -> Result<OutboxBacklog, OutboxError> {
    let count = |status: &'static str| {
        let pool = pool.clone();
        async move {
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM outbox_events WHERE status = ?1")
                .bind(status)
                .fetch_one(&pool)
                .await
        }
    };

    Ok(OutboxBacklog {
        pending: count("PENDING").await?,
        delivering: count("DELIVERING").await?,
        failed: count("FAILED").await?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{RecordingQueue, RecordingSlack, RecordingWebhooks, setup_test_db};
    use std::sync::Arc;

    fn test_outbox(pool: SqlitePool) -> (Outbox, Arc<RecordingWebhooks>, Arc<RecordingSlack>) {
        let webhooks = Arc::new(RecordingWebhooks::default());
        let slack = Arc::new(RecordingSlack::default());
        let queue = Arc::new(RecordingQueue::default());
        let dispatcher = OutboxDispatcher::new(
            webhooks.clone(),
            slack.clone(),
            queue,
            OutboxPolicy::default(),
        );
        (Outbox::new(pool, dispatcher), webhooks, slack)
    }

    fn webhook_payload() -> OutboxPayload {
        OutboxPayload::Webhook {
            url: Url::parse("https://partner.example/hooks").unwrap(),
            event: "transaction.processing".to_string(),
            data: serde_json::json!({ "id": "t-1" }),
        }
    }

    #[tokio::test]
    async fn enqueue_delivers_immediately() {
        let pool = setup_test_db().await;
        let (outbox, webhooks, _) = test_outbox(pool.clone());

        let event_id = outbox.enqueue(webhook_payload()).await.unwrap();

        assert_eq!(webhooks.sent().len(), 1);
        let event = find_event(&pool, event_id).await.unwrap().unwrap();
        assert_eq!(event.status, OutboxStatus::Delivered);
        assert!(event.delivered_at.is_some());
    }

    #[tokio::test]
    async fn enqueue_within_defers_delivery_to_the_worker() {
        let pool = setup_test_db().await;
        let (outbox, webhooks, _) = test_outbox(pool.clone());

        let mut sql_tx = pool.begin().await.unwrap();
        let event_id = outbox
            .enqueue_within(&mut sql_tx, webhook_payload())
            .await
            .unwrap();
        sql_tx.commit().await.unwrap();

        assert!(webhooks.sent().is_empty());
        let event = find_event(&pool, event_id).await.unwrap().unwrap();
        assert_eq!(event.status, OutboxStatus::Pending);

        let attempted = outbox.sweep_due(100).await.unwrap();
        assert_eq!(attempted, 1);
        assert_eq!(webhooks.sent().len(), 1);
    }

    #[tokio::test]
    async fn failed_delivery_backs_off_and_stays_pending() {
        let pool = setup_test_db().await;
        let (outbox, webhooks, _) = test_outbox(pool.clone());
        webhooks.fail_next(1);

        let event_id = outbox.enqueue(webhook_payload()).await.unwrap();

        let event = find_event(&pool, event_id).await.unwrap().unwrap();
        assert_eq!(event.status, OutboxStatus::Pending);
        assert_eq!(event.attempts, 1);
        assert!(event.last_error.is_some());
        assert!(event.available_at > Utc::now());

        // Not yet due, so a sweep attempts nothing.
        assert_eq!(outbox.sweep_due(100).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn exhausted_retries_mark_failed_and_raise_alerts() {
        let pool = setup_test_db().await;
        let webhooks = Arc::new(RecordingWebhooks::default());
        let slack = Arc::new(RecordingSlack::default());
        let queue = Arc::new(RecordingQueue::default());
        let policy = OutboxPolicy {
            max_attempts: 1,
            ..OutboxPolicy::default()
        };
        let dispatcher =
            OutboxDispatcher::new(webhooks.clone(), slack.clone(), queue.clone(), policy);
        let outbox = Outbox::new(pool.clone(), dispatcher);

        webhooks.fail_next(1);
        let event_id = outbox.enqueue(webhook_payload()).await.unwrap();

        let event = find_event(&pool, event_id).await.unwrap().unwrap();
        assert_eq!(event.status, OutboxStatus::Failed);
        assert_eq!(slack.posts().len(), 1);
        assert_eq!(queue.posted_to(QUEUE_DEAD_LETTER).len(), 1);
    }

    #[tokio::test]
    async fn alert_failure_does_not_cascade() {
        let pool = setup_test_db().await;
        let webhooks = Arc::new(RecordingWebhooks::default());
        let slack = Arc::new(RecordingSlack::default());
        slack.fail_next(1);
        let queue = Arc::new(RecordingQueue::default());
        let policy = OutboxPolicy {
            max_attempts: 1,
            ..OutboxPolicy::default()
        };
        let dispatcher =
            OutboxDispatcher::new(webhooks.clone(), slack.clone(), queue.clone(), policy);
        let outbox = Outbox::new(pool.clone(), dispatcher);

        webhooks.fail_next(1);
        let event_id = outbox.enqueue(webhook_payload()).await.unwrap();

        // Slack alert failed, but the primary path still concluded.
        let event = find_event(&pool, event_id).await.unwrap().unwrap();
        assert_eq!(event.status, OutboxStatus::Failed);
        assert_eq!(queue.posted_to(QUEUE_DEAD_LETTER).len(), 1);
    }

    #[tokio::test]
    async fn backlog_counts_by_status() {
        let pool = setup_test_db().await;
        let (outbox, webhooks, _) = test_outbox(pool.clone());

        outbox.enqueue(webhook_payload()).await.unwrap();
        webhooks.fail_next(1);
        outbox.enqueue(webhook_payload()).await.unwrap();

        let backlog = outbox.backlog().await.unwrap();
        assert_eq!(backlog.pending, 1);
        assert_eq!(backlog.delivering, 0);
        assert_eq!(backlog.failed, 0);
    }

    #[tokio::test]
    async fn queue_payload_is_posted_with_dedup_key() {
        let pool = setup_test_db().await;
        let webhooks = Arc::new(RecordingWebhooks::default());
        let slack = Arc::new(RecordingSlack::default());
        let queue = Arc::new(RecordingQueue::default());
        let dispatcher = OutboxDispatcher::new(
            webhooks,
            slack,
            queue.clone(),
            OutboxPolicy::default(),
        );
        let outbox = Outbox::new(pool, dispatcher);

        outbox
            .enqueue(OutboxPayload::Queue {
                queue: "payout-dispatch".to_string(),
                dedup_key: Some("chain-tx-1".to_string()),
                message: serde_json::json!({ "transaction_id": "abc" }),
            })
            .await
            .unwrap();

        let posted = queue.posted_to("payout-dispatch");
        assert_eq!(posted.len(), 1);
        assert_eq!(posted[0].0.as_deref(), Some("chain-tx-1"));
    }
}
