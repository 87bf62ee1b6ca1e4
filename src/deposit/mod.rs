//! Deposit verification: reconciling untrusted blockchain feeds into
//! idempotent business transitions. A verifier validates one on-chain event
//! against one quoted transaction; every accepted event becomes a
//! [`ReceivedCryptoTransaction`] published to the deposits queue through the
//! outbox, deduplicated on the on-chain id.

pub mod cursor;
pub mod listener;
pub mod mock;
pub mod reconcile;
pub mod solana;
pub mod stellar;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use base64::Engine;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::error::{OutboxError, VerifierError};
use crate::model::{Blockchain, CryptoCurrency, Transaction, TransactionStatus};
use crate::outbox::{Outbox, OutboxPayload};
use crate::queue::QUEUE_DEPOSITS;
use crate::transaction as transaction_repo;

/// A verified deposit as carried on the deposits queue. This is the only
/// thing the transaction workflow ever learns about a blockchain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceivedCryptoTransaction {
    pub transaction_id: Uuid,
    pub on_chain_id: String,
    pub amount: Decimal,
    pub address_from: String,
    pub blockchain: Blockchain,
    pub crypto_currency: CryptoCurrency,
}

/// Business reasons a notification is not credited. These are expected
/// outcomes, not errors: the ops API maps them to structured `{reason}`
/// responses and the scanners log and move on.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerificationRejection {
    #[error("transaction not found: {0}")]
    TransactionNotFound(Uuid),
    #[error("transaction is not awaiting payment (status {status})")]
    NotAwaitingPayment { status: TransactionStatus },
    #[error("deposit does not match the quoted corridor")]
    CorridorMismatch,
    #[error("on-chain id is already credited to transaction {0}")]
    AlreadyLinked(Uuid),
    #[error("on-chain transaction not found: {0}")]
    OnChainTransactionNotFound(String),
    #[error("transaction failed on-chain")]
    FailedOnChain,
    #[error("memo does not address this transaction")]
    MemoMismatch,
    #[error("no qualifying transfer to the deposit wallet")]
    NoQualifyingTransfer,
}

impl VerificationRejection {
    /// HTTP status the ops endpoints answer with.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::TransactionNotFound(_) | Self::OnChainTransactionNotFound(_) => 404,
            _ => 400,
        }
    }
}

/// Outcome of verifying one notification.
#[derive(Debug, Clone, PartialEq)]
pub enum Verification {
    Verified(ReceivedCryptoTransaction),
    Rejected(VerificationRejection),
}

/// Per-blockchain deposit verification. Implementations differ in how they
/// locate a qualifying transfer, but all honor the same contract: the
/// transaction must be awaiting payment on the matching corridor, the
/// on-chain id must not be credited elsewhere, and the on-chain transaction
/// must have succeeded.
#[async_trait]
pub trait DepositVerifier: Send + Sync {
    fn blockchain(&self) -> Blockchain;

    async fn verify_notification(
        &self,
        on_chain_id: &str,
        transaction_id: Uuid,
    ) -> Result<Verification, VerifierError>;
}

pub struct DepositVerifierRegistry {
    verifiers: HashMap<Blockchain, Arc<dyn DepositVerifier>>,
}

impl DepositVerifierRegistry {
    pub fn new(verifiers: Vec<Arc<dyn DepositVerifier>>) -> Self {
        Self {
            verifiers: verifiers.into_iter().map(|v| (v.blockchain(), v)).collect(),
        }
    }

    pub fn get(&self, blockchain: Blockchain) -> Result<&Arc<dyn DepositVerifier>, VerifierError> {
        self.verifiers
            .get(&blockchain)
            .ok_or(VerifierError::UnsupportedBlockchain(blockchain))
    }
}

/// The shared precondition checks every verifier runs before looking at the
/// chain: status, corridor, and on-chain-id uniqueness.
pub(crate) async fn load_payable(
    pool: &SqlitePool,
    transaction_id: Uuid,
    blockchain: Blockchain,
    on_chain_id: &str,
) -> Result<Result<Transaction, VerificationRejection>, VerifierError> {
    let Some(tx) = transaction_repo::find(pool, transaction_id).await? else {
        return Ok(Err(VerificationRejection::TransactionNotFound(
            transaction_id,
        )));
    };

    if tx.status != TransactionStatus::AwaitingPayment {
        return Ok(Err(VerificationRejection::NotAwaitingPayment {
            status: tx.status,
        }));
    }

    if tx.blockchain != blockchain {
        return Ok(Err(VerificationRejection::CorridorMismatch));
    }

    if let Some(other) = transaction_repo::find_by_on_chain_id(pool, on_chain_id).await?
        && other.id != transaction_id
    {
        return Ok(Err(VerificationRejection::AlreadyLinked(other.id)));
    }

    Ok(Ok(tx))
}

/// Decodes a deposit memo into the transaction it addresses: base64 to
/// exactly 16 bytes, read as a UUID. Anything else is unresolved, not an
/// error.
pub fn memo_to_transaction_id(memo: &str) -> Option<Uuid> {
    let bytes = base64::engine::general_purpose::STANDARD.decode(memo).ok()?;
    let bytes: [u8; 16] = bytes.try_into().ok()?;
    Some(Uuid::from_bytes(bytes))
}

/// Encodes a transaction id the way depositors are instructed to memo it.
pub fn transaction_id_to_memo(transaction_id: Uuid) -> String {
    base64::engine::general_purpose::STANDARD.encode(transaction_id.as_bytes())
}

/// Publishes a verified deposit onto the deposits queue through the outbox.
/// The dedup key is the on-chain id, so the same payment observed by the
/// stream, the sweep, and a manual replay enqueues once.
pub async fn publish_verified(
    outbox: &Outbox,
    msg: &ReceivedCryptoTransaction,
) -> Result<(), OutboxError> {
    outbox
        .enqueue(OutboxPayload::Queue {
            queue: QUEUE_DEPOSITS.to_string(),
            dedup_key: Some(msg.on_chain_id.clone()),
            message: serde_json::to_value(msg)?,
        })
        .await?;

    Ok(())
}
