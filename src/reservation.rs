//! Idempotency reservations over the relational store. A reservation is a
//! single row claimed with `INSERT OR IGNORE`; the affected-row count, not a
//! prior read, decides which caller wins. Used to make duplicate deliveries
//! of the same logical operation (payout dispatch, most importantly) safe.

use sqlx::SqlitePool;
use tracing::info;

use crate::error::PersistenceError;

/// Outcome of [`try_reserve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    /// This caller now owns the key and must eventually [`complete`] it.
    Reserved,
    /// Another caller holds the key and has not finished.
    InFlight,
    /// The operation already ran to a terminal outcome.
    Completed,
}

pub fn payout_dispatch_key(transaction_id: uuid::Uuid) -> String {
    format!("payout_dispatch|{transaction_id}")
}

pub async fn try_reserve(pool: &SqlitePool, key: &str) -> Result<Reservation, PersistenceError> {
    let result = sqlx::query(
        "INSERT OR IGNORE INTO idempotency_reservations (key, state) VALUES (?1, 'IN_FLIGHT')",
    )
    .bind(key)
    .execute(pool)
    .await?;

    if result.rows_affected() > 0 {
        return Ok(Reservation::Reserved);
    }

    let state: String = sqlx::query_scalar("SELECT state FROM idempotency_reservations WHERE key = ?1")
        .bind(key)
        .fetch_one(pool)
        .await?;

    match state.as_str() {
        "COMPLETED" => Ok(Reservation::Completed),
        _ => {
            info!(key, "reservation already in flight");
            Ok(Reservation::InFlight)
        }
    }
}

/// Records the terminal outcome for a reserved key. Safe to call twice.
pub async fn complete(pool: &SqlitePool, key: &str) -> Result<(), PersistenceError> {
    sqlx::query(
        r#"
        UPDATE idempotency_reservations
        SET state = 'COMPLETED', updated_at = CURRENT_TIMESTAMP
        WHERE key = ?1
        "#,
    )
    .bind(key)
    .execute(pool)
    .await?;

    Ok(())
}
