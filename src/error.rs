//! Domain-specific error types following clean error handling architecture.
//! Separates persistence, transport, and business concerns instead of mixing
//! them into one catch-all.

use uuid::Uuid;

use crate::model::{Blockchain, ParseEnumError, PaymentMethod};

/// Database access and stored-value decoding errors.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("stored value is malformed: {0}")]
    Corrupt(String),
}

impl From<ParseEnumError> for PersistenceError {
    fn from(err: ParseEnumError) -> Self {
        Self::Corrupt(err.to_string())
    }
}

impl From<rust_decimal::Error> for PersistenceError {
    fn from(err: rust_decimal::Error) -> Self {
        Self::Corrupt(format!("decimal: {err}"))
    }
}

impl From<uuid::Error> for PersistenceError {
    fn from(err: uuid::Error) -> Self {
        Self::Corrupt(format!("uuid: {err}"))
    }
}

/// Local message-queue persistence and payload errors.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("payload serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Outbox persistence and delivery errors.
#[derive(Debug, thiserror::Error)]
pub enum OutboxError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("payload serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("persistence error: {0}")]
    Persistence(#[from] PersistenceError),
    #[error("outbox event not found: {0}")]
    RecordNotFound(i64),
}

/// Webhook/Slack delivery errors, absorbed by the outbox retry policy.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("http transport error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("notification endpoint returned status {0}")]
    Status(u16),
    #[error("notifier is not configured: {0}")]
    NotConfigured(&'static str),
}

/// Payout-provider errors.
#[derive(Debug, thiserror::Error)]
pub enum PaymentError {
    #[error("http transport error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("provider error: {0}")]
    Provider(String),
}

/// On-chain wallet/custodian errors.
#[derive(Debug, thiserror::Error)]
pub enum WalletError {
    #[error("http transport error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("custodian error: {0}")]
    Custodian(String),
    #[error("no wallet handler registered for {0}")]
    UnsupportedBlockchain(Blockchain),
    #[error("on-chain transaction not found: {0}")]
    TransactionNotFound(String),
}

/// Flow orchestration errors.
#[derive(Debug, thiserror::Error)]
pub enum FlowError {
    #[error("persistence error: {0}")]
    Persistence(#[from] PersistenceError),
    #[error("transaction not found: {0}")]
    TransactionNotFound(Uuid),
    #[error("no enabled flow definition for corridor {0}")]
    DefinitionNotFound(String),
    #[error("flow instance not found: {0}")]
    InstanceNotFound(Uuid),
    #[error("flow step not found: instance {instance_id} order {step_order}")]
    StepNotFound { instance_id: Uuid, step_order: i64 },
    #[error("no executor registered for step type: {0}")]
    UnknownStepType(String),
    #[error("step config is malformed: {0}")]
    Config(#[from] serde_json::Error),
    #[error("outbox error: {0}")]
    Outbox(#[from] OutboxError),
    #[error("wallet error: {0}")]
    Wallet(#[from] WalletError),
    #[error("no exchange address configured for {0}")]
    ExchangeRouteNotFound(String),
}

impl From<sqlx::Error> for FlowError {
    fn from(err: sqlx::Error) -> Self {
        Self::Persistence(PersistenceError::Database(err))
    }
}

/// Errors surfaced by the transaction workflow. Business-terminal conditions
/// (failed payouts, wrong amounts) are not errors — they become status
/// transitions; this type covers what prevents the workflow from concluding.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("persistence error: {0}")]
    Persistence(#[from] PersistenceError),
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("outbox error: {0}")]
    Outbox(#[from] OutboxError),
    #[error("transaction not found: {0}")]
    TransactionNotFound(Uuid),
    #[error("no payment service registered for {0}")]
    UnsupportedPaymentMethod(PaymentMethod),
    #[error("wallet error: {0}")]
    Wallet(#[from] WalletError),
    #[error("flow error: {0}")]
    Flow(#[from] FlowError),
    #[error("wallet transfer for refund produced no transaction id")]
    RefundWithoutId,
}

impl From<sqlx::Error> for WorkflowError {
    fn from(err: sqlx::Error) -> Self {
        Self::Persistence(PersistenceError::Database(err))
    }
}

/// Infrastructure errors raised by deposit verifiers and reconciliation.
/// Business rejections travel separately as
/// [`crate::deposit::VerificationRejection`].
#[derive(Debug, thiserror::Error)]
pub enum VerifierError {
    #[error("persistence error: {0}")]
    Persistence(#[from] PersistenceError),
    #[error("chain rpc error: {0}")]
    Rpc(#[from] reqwest::Error),
    #[error("chain response is malformed: {0}")]
    MalformedResponse(String),
    #[error("no verifier registered for {0}")]
    UnsupportedBlockchain(Blockchain),
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("outbox error: {0}")]
    Outbox(#[from] OutboxError),
}

impl From<sqlx::Error> for VerifierError {
    fn from(err: sqlx::Error) -> Self {
        Self::Persistence(PersistenceError::Database(err))
    }
}
