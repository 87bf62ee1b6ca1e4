//! Reconciliation cursor: one row per chain recording the highest scanned
//! paging token. Advances are conditional on being forward moves, so
//! concurrent sweeps can never regress the resume point.

use sqlx::SqlitePool;

use crate::error::PersistenceError;
use crate::model::Blockchain;

/// Current resume point, zero before any scan.
pub async fn current(pool: &SqlitePool, blockchain: Blockchain) -> Result<i64, PersistenceError> {
    let token: Option<i64> =
        sqlx::query_scalar("SELECT paging_token FROM chain_cursors WHERE blockchain = ?1")
            .bind(blockchain.as_str())
            .fetch_optional(pool)
            .await?;

    Ok(token.unwrap_or(0))
}

/// Moves the cursor to `paging_token` if that is a forward move. Returns
/// whether anything changed; an older token is a quiet no-op.
pub async fn advance(
    pool: &SqlitePool,
    blockchain: Blockchain,
    paging_token: i64,
) -> Result<bool, PersistenceError> {
    let result = sqlx::query(
        r#"
        INSERT INTO chain_cursors (blockchain, paging_token)
        VALUES (?1, ?2)
        ON CONFLICT(blockchain) DO UPDATE
        SET paging_token = excluded.paging_token, updated_at = CURRENT_TIMESTAMP
        WHERE chain_cursors.paging_token < excluded.paging_token
        "#,
    )
    .bind(blockchain.as_str())
    .bind(paging_token)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}
