//! Durable local message queue backing the at-least-once transport contract.
//! Producers insert JSON payloads (optionally deduplicated by a stable key);
//! consumer loops claim the oldest unprocessed record, dispatch it, and mark
//! it processed only after the handler returns cleanly — a handler error
//! leaves the record in place for redelivery.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sqlx::{Row, SqlitePool};
use tracing::debug;

use crate::error::QueueError;

/// Inbound deposit notifications produced by listeners, sweeps, and ops
/// replay. Payload: [`crate::deposit::ReceivedCryptoTransaction`].
pub const QUEUE_DEPOSITS: &str = "crypto-deposits";
/// Payout triggers produced by flow steps. Payload: [`PayoutDispatchMessage`].
pub const QUEUE_PAYOUT_DISPATCH: &str = "payout-dispatch";
/// Raw provider status callbacks. Payload:
/// [`crate::transaction::ProviderStatusUpdate`].
pub const QUEUE_PROVIDER_UPDATES: &str = "provider-status";
/// Inbound flow signals. Payload: [`crate::flow::InboundSignal`].
pub const QUEUE_FLOW_SIGNALS: &str = "flow-signals";
/// Outbound event published on completed payouts, consumed by partners.
pub const QUEUE_PAYMENT_SENT: &str = "payment-sent";
/// Terminal parking lot for undeliverable records.
pub const QUEUE_DEAD_LETTER: &str = "dead-letter";

/// Payload for [`QUEUE_PAYOUT_DISPATCH`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, serde::Deserialize)]
pub struct PayoutDispatchMessage {
    pub transaction_id: uuid::Uuid,
}

#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub id: i64,
    pub queue: String,
    pub payload: String,
    pub dedup_key: Option<String>,
    pub attempts: i64,
    pub created_at: DateTime<Utc>,
}

impl QueuedMessage {
    /// Decodes the stored JSON payload into the queue's message type.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, QueueError> {
        Ok(serde_json::from_str(&self.payload)?)
    }
}

/// Inserts a message, deduplicating on `(queue, dedup_key)` when a key is
/// given. Returns false when an identical key was already enqueued.
pub async fn enqueue_message<T: Serialize>(
    pool: &SqlitePool,
    queue: &str,
    dedup_key: Option<&str>,
    payload: &T,
) -> Result<bool, QueueError> {
    let payload_json = serde_json::to_string(payload)?;

    let result = sqlx::query(
        r#"
        INSERT OR IGNORE INTO message_queue (queue, payload, dedup_key)
        VALUES (?1, ?2, ?3)
        "#,
    )
    .bind(queue)
    .bind(&payload_json)
    .bind(dedup_key)
    .execute(pool)
    .await?;

    let inserted = result.rows_affected() > 0;
    if !inserted {
        debug!(queue, ?dedup_key, "duplicate message suppressed");
    }

    Ok(inserted)
}

/// Returns the oldest unprocessed message on the queue, if any.
pub async fn next_unprocessed(
    pool: &SqlitePool,
    queue: &str,
) -> Result<Option<QueuedMessage>, QueueError> {
    let row = sqlx::query(
        r#"
        SELECT id, queue, payload, dedup_key, attempts, created_at
        FROM message_queue
        WHERE queue = ?1 AND processed = 0
        ORDER BY id ASC
        LIMIT 1
        "#,
    )
    .bind(queue)
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };

    Ok(Some(QueuedMessage {
        id: row.try_get("id")?,
        queue: row.try_get("queue")?,
        payload: row.try_get("payload")?,
        dedup_key: row.try_get("dedup_key")?,
        attempts: row.try_get("attempts")?,
        created_at: row
            .try_get::<chrono::NaiveDateTime, _>("created_at")?
            .and_utc(),
    }))
}

pub async fn mark_processed(pool: &SqlitePool, message_id: i64) -> Result<(), QueueError> {
    sqlx::query(
        r#"
        UPDATE message_queue
        SET processed = 1, processed_at = CURRENT_TIMESTAMP
        WHERE id = ?1
        "#,
    )
    .bind(message_id)
    .execute(pool)
    .await?;

    Ok(())
}

/// Bumps the redelivery counter after a handler error.
pub async fn record_attempt(pool: &SqlitePool, message_id: i64) -> Result<(), QueueError> {
    sqlx::query("UPDATE message_queue SET attempts = attempts + 1 WHERE id = ?1")
        .bind(message_id)
        .execute(pool)
        .await?;

    Ok(())
}

pub async fn count_unprocessed(pool: &SqlitePool, queue: &str) -> Result<i64, QueueError> {
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM message_queue WHERE queue = ?1 AND processed = 0")
            .bind(queue)
            .fetch_one(pool)
            .await?;

    Ok(count)
}

/// Publisher half of the queue transport contract. The outbox delivers
/// `Queue`-kind payloads through this seam.
#[async_trait]
pub trait QueuePublisher: Send + Sync {
    async fn post_message(
        &self,
        queue: &str,
        dedup_key: Option<&str>,
        message: &serde_json::Value,
    ) -> Result<(), QueueError>;
}

/// Publishes into the local durable queue.
#[derive(Debug, Clone)]
pub struct LocalQueuePublisher {
    pool: SqlitePool,
}

impl LocalQueuePublisher {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl QueuePublisher for LocalQueuePublisher {
    async fn post_message(
        &self,
        queue: &str,
        dedup_key: Option<&str>,
        message: &serde_json::Value,
    ) -> Result<(), QueueError> {
        enqueue_message(&self.pool, queue, dedup_key, message).await?;
        Ok(())
    }
}
