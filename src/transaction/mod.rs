//! Persistence for the Transaction aggregate. Every mutation is a
//! conditional update whose affected-row count decides whether the caller's
//! transition actually happened — concurrent consumers coordinate through
//! these predicates, not in-memory state.

pub mod events;
pub mod workflow;

pub use events::TransactionEventDispatcher;
pub use workflow::{ProviderStatusUpdate, TransactionWorkflow};

use std::str::FromStr;

use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use sqlx::{Row, SqlitePool, sqlite::SqliteRow};
use tracing::info;
use uuid::Uuid;

use crate::error::PersistenceError;
use crate::model::{
    Blockchain, CryptoCurrency, FiatCurrency, PaymentMethod, Transaction, TransactionStatus,
};

fn row_to_transaction(row: &SqliteRow) -> Result<Transaction, PersistenceError> {
    let status: String = row.try_get("status")?;
    let blockchain: String = row.try_get("blockchain")?;
    let crypto_currency: String = row.try_get("crypto_currency")?;
    let target_currency: String = row.try_get("target_currency")?;
    let payment_method: String = row.try_get("payment_method")?;
    let source_amount: String = row.try_get("source_amount")?;
    let target_amount: String = row.try_get("target_amount")?;

    Ok(Transaction {
        id: row.try_get("id")?,
        status: status.parse::<TransactionStatus>()?,
        blockchain: blockchain.parse::<Blockchain>()?,
        crypto_currency: crypto_currency.parse::<CryptoCurrency>()?,
        target_currency: target_currency.parse::<FiatCurrency>()?,
        source_amount: Decimal::from_str(&source_amount)?,
        target_amount: Decimal::from_str(&target_amount)?,
        deposit_address: row.try_get("deposit_address")?,
        recipient_account: row.try_get("recipient_account")?,
        payment_method: payment_method.parse::<PaymentMethod>()?,
        qr_code: row.try_get("qr_code")?,
        on_chain_id: row.try_get("on_chain_id")?,
        address_from: row.try_get("address_from")?,
        refund_on_chain_id: row.try_get("refund_on_chain_id")?,
        external_id: row.try_get("external_id")?,
        created_at: row.try_get::<NaiveDateTime, _>("created_at")?.and_utc(),
        updated_at: row.try_get::<NaiveDateTime, _>("updated_at")?.and_utc(),
    })
}

const SELECT_COLUMNS: &str = r#"
    SELECT id, status, blockchain, crypto_currency, target_currency,
           source_amount, target_amount, deposit_address, recipient_account,
           payment_method, qr_code, on_chain_id, address_from,
           refund_on_chain_id, external_id, created_at, updated_at
    FROM transactions
"#;

/// Inserts a freshly quoted transaction. Quote acceptance lives outside this
/// subsystem; this is the entry point it (and the test fixtures) use.
pub async fn insert(pool: &SqlitePool, tx: &Transaction) -> Result<(), PersistenceError> {
    sqlx::query(
        r#"
        INSERT INTO transactions (
            id, status, blockchain, crypto_currency, target_currency,
            source_amount, target_amount, deposit_address, recipient_account,
            payment_method, qr_code, on_chain_id, address_from,
            refund_on_chain_id, external_id
        )
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
        "#,
    )
    .bind(tx.id)
    .bind(tx.status.as_str())
    .bind(tx.blockchain.as_str())
    .bind(tx.crypto_currency.as_str())
    .bind(tx.target_currency.as_str())
    .bind(tx.source_amount.to_string())
    .bind(tx.target_amount.to_string())
    .bind(&tx.deposit_address)
    .bind(&tx.recipient_account)
    .bind(tx.payment_method.as_str())
    .bind(&tx.qr_code)
    .bind(&tx.on_chain_id)
    .bind(&tx.address_from)
    .bind(&tx.refund_on_chain_id)
    .bind(&tx.external_id)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn find(
    pool: &SqlitePool,
    transaction_id: Uuid,
) -> Result<Option<Transaction>, PersistenceError> {
    let row = sqlx::query(&format!("{SELECT_COLUMNS} WHERE id = ?1"))
        .bind(transaction_id)
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(row_to_transaction).transpose()
}

pub async fn find_by_on_chain_id(
    pool: &SqlitePool,
    on_chain_id: &str,
) -> Result<Option<Transaction>, PersistenceError> {
    let row = sqlx::query(&format!("{SELECT_COLUMNS} WHERE on_chain_id = ?1"))
        .bind(on_chain_id)
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(row_to_transaction).transpose()
}

pub async fn find_by_external_id(
    pool: &SqlitePool,
    external_id: &str,
) -> Result<Option<Transaction>, PersistenceError> {
    let row = sqlx::query(&format!("{SELECT_COLUMNS} WHERE external_id = ?1"))
        .bind(external_id)
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(row_to_transaction).transpose()
}

/// Conditional status transition. Returns whether this caller won — a false
/// means the precondition no longer held and someone else moved the row.
pub async fn transition(
    pool: &SqlitePool,
    transaction_id: Uuid,
    from: TransactionStatus,
    to: TransactionStatus,
) -> Result<bool, PersistenceError> {
    let result = sqlx::query(
        r#"
        UPDATE transactions
        SET status = ?3, updated_at = CURRENT_TIMESTAMP
        WHERE id = ?1 AND status = ?2
        "#,
    )
    .bind(transaction_id)
    .bind(from.as_str())
    .bind(to.as_str())
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// The deposit-claim transition: AWAITING_PAYMENT → PROCESSING_PAYMENT while
/// recording the on-chain id and depositor in the same statement. A unique
/// violation on on_chain_id (the id already credited elsewhere) loses the
/// claim rather than erroring.
pub async fn begin_processing(
    pool: &SqlitePool,
    transaction_id: Uuid,
    on_chain_id: &str,
    address_from: &str,
) -> Result<bool, PersistenceError> {
    let result = sqlx::query(
        r#"
        UPDATE transactions
        SET status = 'PROCESSING_PAYMENT',
            on_chain_id = ?2,
            address_from = ?3,
            updated_at = CURRENT_TIMESTAMP
        WHERE id = ?1 AND status = 'AWAITING_PAYMENT' AND on_chain_id IS NULL
        "#,
    )
    .bind(transaction_id)
    .bind(on_chain_id)
    .bind(address_from)
    .execute(pool)
    .await;

    match result {
        Ok(result) => Ok(result.rows_affected() > 0),
        Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
            info!(
                %transaction_id,
                on_chain_id, "on-chain id already credited to another transaction"
            );
            Ok(false)
        }
        Err(e) => Err(e.into()),
    }
}

/// Persists a refund id only while none exists: at most one refund per
/// transaction, ever.
pub async fn record_refund(
    pool: &SqlitePool,
    transaction_id: Uuid,
    refund_on_chain_id: &str,
) -> Result<bool, PersistenceError> {
    let result = sqlx::query(
        r#"
        UPDATE transactions
        SET refund_on_chain_id = ?2, updated_at = CURRENT_TIMESTAMP
        WHERE id = ?1 AND refund_on_chain_id IS NULL
        "#,
    )
    .bind(transaction_id)
    .bind(refund_on_chain_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

pub async fn set_external_id(
    pool: &SqlitePool,
    transaction_id: Uuid,
    external_id: &str,
) -> Result<(), PersistenceError> {
    sqlx::query(
        r#"
        UPDATE transactions
        SET external_id = ?2, updated_at = CURRENT_TIMESTAMP
        WHERE id = ?1
        "#,
    )
    .bind(transaction_id)
    .bind(external_id)
    .execute(pool)
    .await?;

    Ok(())
}

/// Finds AWAITING_PAYMENT rows older than the quote TTL. The caller expires
/// each through the usual conditional transition so a racing deposit still
/// wins cleanly.
pub async fn stale_awaiting_payment(
    pool: &SqlitePool,
    ttl_minutes: i64,
) -> Result<Vec<Uuid>, PersistenceError> {
    let threshold = format!("-{ttl_minutes} minutes");
    let ids: Vec<Uuid> = sqlx::query_scalar(
        r#"
        SELECT id FROM transactions
        WHERE status = 'AWAITING_PAYMENT' AND created_at <= datetime('now', ?1)
        "#,
    )
    .bind(&threshold)
    .fetch_all(pool)
    .await?;

    Ok(ids)
}
