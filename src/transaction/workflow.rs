//! The deposit → payout → refund state machine. Handlers are invoked by
//! queue consumers under at-least-once delivery, so every step either claims
//! a conditional transition or observes that someone else already did and
//! falls to a recovery branch. Business-terminal outcomes become status
//! transitions plus notifications; only infrastructure errors propagate so
//! the queue redelivers the message.

use std::sync::Arc;

use rust_decimal::Decimal;
use sqlx::SqlitePool;
use tracing::{info, warn};
use uuid::Uuid;

use crate::deposit::ReceivedCryptoTransaction;
use crate::error::{WalletError, WorkflowError};
use crate::flow::FlowOrchestrator;
use crate::flow::store as flow_store;
use crate::model::{Transaction, TransactionStatus};
use crate::payment::{PaymentRegistry, PaymentStatusClass};
use crate::reservation::{self, Reservation};
use crate::transaction::{self as repo, TransactionEventDispatcher};
use crate::wallet::WalletRegistry;

/// Raw status callback from a payout provider, correlated by external id.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ProviderStatusUpdate {
    pub external_id: String,
    pub raw_status: String,
}

/// Which address a terminal-failure refund resolves to.
enum RefundPath {
    /// The depositor address recorded with the deposit.
    ToSender,
    /// Resolved on demand from the original on-chain transaction.
    ByOnChainId,
}

pub struct TransactionWorkflow {
    pool: SqlitePool,
    events: TransactionEventDispatcher,
    payments: Arc<PaymentRegistry>,
    wallets: Arc<WalletRegistry>,
    orchestrator: Arc<FlowOrchestrator>,
}

impl TransactionWorkflow {
    pub fn new(
        pool: SqlitePool,
        events: TransactionEventDispatcher,
        payments: Arc<PaymentRegistry>,
        wallets: Arc<WalletRegistry>,
        orchestrator: Arc<FlowOrchestrator>,
    ) -> Self {
        Self {
            pool,
            events,
            payments,
            wallets,
            orchestrator,
        }
    }

    /// Entry point for verified deposit messages. Safe under redelivery: the
    /// AWAITING_PAYMENT → PROCESSING_PAYMENT claim is one conditional update,
    /// and the loser takes the recovery branch.
    #[tracing::instrument(skip(self, msg), fields(transaction_id = %msg.transaction_id))]
    pub async fn handle_incoming_deposit(
        &self,
        msg: &ReceivedCryptoTransaction,
    ) -> Result<(), WorkflowError> {
        let claimed = repo::begin_processing(
            &self.pool,
            msg.transaction_id,
            &msg.on_chain_id,
            &msg.address_from,
        )
        .await?;

        if !claimed {
            return self.recover_out_of_band_deposit(msg).await;
        }

        let tx = self.load(msg.transaction_id).await?;
        self.events.processing(&tx).await?;

        if msg.amount < tx.source_amount {
            info!(
                received = %msg.amount,
                quoted = %tx.source_amount,
                "deposit short of quote"
            );
            if repo::transition(
                &self.pool,
                tx.id,
                TransactionStatus::ProcessingPayment,
                TransactionStatus::WrongAmount,
            )
            .await?
            {
                let tx = self.load(tx.id).await?;
                self.events.wrong_amount(&tx, msg.amount).await?;
                self.refund_to_sender(&tx, msg.amount, &msg.address_from)
                    .await?;
            }
            return Ok(());
        }

        self.proceed_to_payout(&tx).await
    }

    /// The transition was already applied by an earlier delivery — or the
    /// transaction is in a state a deposit cannot claim. A late deposit into
    /// an expired quote is refunded, never paid out; everything else is a
    /// logged no-op.
    async fn recover_out_of_band_deposit(
        &self,
        msg: &ReceivedCryptoTransaction,
    ) -> Result<(), WorkflowError> {
        let tx = self.load(msg.transaction_id).await?;

        match tx.status {
            TransactionStatus::PaymentExpired if tx.refund_on_chain_id.is_none() => {
                info!("late deposit into expired quote, refunding to sender");
                self.refund_to_sender(&tx, msg.amount, &msg.address_from)
                    .await
            }
            status => {
                info!(%status, "deposit claim lost, nothing to recover");
                Ok(())
            }
        }
    }

    /// Routes a claimed deposit onward: corridors with an enabled flow
    /// definition go through the orchestrator, the rest dispatch directly.
    async fn proceed_to_payout(&self, tx: &Transaction) -> Result<(), WorkflowError> {
        let definition = flow_store::find_enabled_definition(&self.pool, &tx.corridor())
            .await
            .map_err(crate::error::FlowError::from)?;

        if definition.is_some() {
            self.orchestrator.start_flow(tx.id).await?;
            return Ok(());
        }

        self.dispatch_payout(tx.id).await
    }

    /// Dispatches the fiat payout, guarded by an idempotency reservation so
    /// redelivered triggers cannot double-pay. Every terminal branch
    /// completes the reservation; a successful asynchronous dispatch leaves
    /// it in flight until the provider's callback settles it.
    #[tracing::instrument(skip(self))]
    pub async fn dispatch_payout(&self, transaction_id: Uuid) -> Result<(), WorkflowError> {
        let tx = self.load(transaction_id).await?;
        if tx.status != TransactionStatus::ProcessingPayment {
            info!(status = %tx.status, "payout skipped, transaction is not processing");
            return Ok(());
        }

        let key = reservation::payout_dispatch_key(transaction_id);
        match reservation::try_reserve(&self.pool, &key).await? {
            Reservation::Reserved => {}
            Reservation::InFlight | Reservation::Completed => {
                info!("payout dispatch already reserved, skipping");
                return Ok(());
            }
        }

        let Some(service) = self
            .payments
            .get(tx.payment_method)
            .filter(|s| s.is_enabled())
        else {
            warn!(method = %tx.payment_method, "payment method unsupported or disabled");
            self.fail_payment(&tx, "payment method unsupported or disabled", RefundPath::ToSender)
                .await?;
            reservation::complete(&self.pool, &key).await?;
            return Ok(());
        };

        let dispatch = match service
            .send_payment(&tx.recipient_account, tx.target_amount, tx.qr_code.as_deref())
            .await
        {
            Ok(dispatch) => dispatch,
            Err(e) => {
                warn!("payout dispatch error: {e}");
                self.fail_payment(&tx, "payout dispatch error", RefundPath::ToSender)
                    .await?;
                reservation::complete(&self.pool, &key).await?;
                return Ok(());
            }
        };

        if let Some(external_id) = &dispatch.external_id {
            repo::set_external_id(&self.pool, tx.id, external_id).await?;
        }

        if service.is_async() {
            if dispatch.success {
                info!("async payout dispatched, awaiting provider confirmation");
                return Ok(());
            }
            self.fail_payment(&tx, "provider rejected dispatch", RefundPath::ToSender)
                .await?;
            reservation::complete(&self.pool, &key).await?;
            return Ok(());
        }

        if dispatch.success {
            if repo::transition(
                &self.pool,
                tx.id,
                TransactionStatus::ProcessingPayment,
                TransactionStatus::PaymentCompleted,
            )
            .await?
            {
                let tx = self.load(tx.id).await?;
                self.events.payment_completed(&tx).await?;
            }
        } else {
            self.fail_payment(&tx, "provider returned failure", RefundPath::ToSender)
                .await?;
        }

        reservation::complete(&self.pool, &key).await?;
        Ok(())
    }

    /// Applies a provider's asynchronous status callback. Unknown external
    /// ids and processing-equivalent updates are no-ops.
    #[tracing::instrument(skip(self, msg), fields(external_id = %msg.external_id))]
    pub async fn handle_provider_status_update(
        &self,
        msg: &ProviderStatusUpdate,
    ) -> Result<(), WorkflowError> {
        let Some(tx) = repo::find_by_external_id(&self.pool, &msg.external_id).await? else {
            warn!("provider update for unknown external id, dropping");
            return Ok(());
        };

        let service = self
            .payments
            .get(tx.payment_method)
            .ok_or(WorkflowError::UnsupportedPaymentMethod(tx.payment_method))?;

        let key = reservation::payout_dispatch_key(tx.id);

        match service.map_status(&msg.raw_status) {
            PaymentStatusClass::Processing => {
                info!(raw = %msg.raw_status, "processing-equivalent provider update, ignoring");
                Ok(())
            }
            PaymentStatusClass::Completed => {
                if repo::transition(
                    &self.pool,
                    tx.id,
                    TransactionStatus::ProcessingPayment,
                    TransactionStatus::PaymentCompleted,
                )
                .await?
                {
                    let tx = self.load(tx.id).await?;
                    self.events.payment_completed(&tx).await?;
                }
                reservation::complete(&self.pool, &key).await?;
                Ok(())
            }
            PaymentStatusClass::Failed => {
                self.fail_payment(&tx, &msg.raw_status, RefundPath::ByOnChainId)
                    .await?;
                reservation::complete(&self.pool, &key).await?;
                Ok(())
            }
        }
    }

    async fn fail_payment(
        &self,
        tx: &Transaction,
        reason: &str,
        refund_path: RefundPath,
    ) -> Result<(), WorkflowError> {
        if !repo::transition(
            &self.pool,
            tx.id,
            TransactionStatus::ProcessingPayment,
            TransactionStatus::PaymentFailed,
        )
        .await?
        {
            info!("payment failure already applied elsewhere");
            return Ok(());
        }

        let tx = self.load(tx.id).await?;
        self.events.payment_failed(&tx, reason).await?;

        match refund_path {
            RefundPath::ToSender => match &tx.address_from {
                Some(address) => {
                    let address = address.clone();
                    self.refund_to_sender(&tx, tx.source_amount, &address).await
                }
                None => {
                    warn!("no depositor address recorded, refund requires manual action");
                    Ok(())
                }
            },
            RefundPath::ByOnChainId => self.refund_by_on_chain_id(&tx).await,
        }
    }

    /// Returns the deposit to the given address. Idempotent: an existing
    /// refund id short-circuits, and the conditional refund-id update keeps
    /// the first id when two refunds race.
    pub async fn refund_to_sender(
        &self,
        tx: &Transaction,
        amount: Decimal,
        address: &str,
    ) -> Result<(), WorkflowError> {
        if tx.refund_on_chain_id.is_some() {
            info!("refund already recorded, skipping");
            return Ok(());
        }

        let wallet = self.wallets.get(tx.blockchain)?;
        let transfer = wallet.send(address, amount, tx.crypto_currency).await?;
        if !transfer.success {
            return Err(WorkflowError::Wallet(WalletError::Custodian(
                "refund transfer rejected".to_string(),
            )));
        }
        let refund_id = transfer
            .transaction_id
            .ok_or(WorkflowError::RefundWithoutId)?;

        if repo::record_refund(&self.pool, tx.id, &refund_id).await? {
            self.events.refund_issued(tx, &refund_id, amount).await?;
        } else {
            warn!(refund_id, "refund raced an earlier one, keeping the first id");
        }

        Ok(())
    }

    /// Refund path for failures reported after dispatch, where the sender
    /// address must be resolved from the original on-chain transaction.
    pub async fn refund_by_on_chain_id(&self, tx: &Transaction) -> Result<(), WorkflowError> {
        if tx.refund_on_chain_id.is_some() {
            info!("refund already recorded, skipping");
            return Ok(());
        }

        let Some(on_chain_id) = &tx.on_chain_id else {
            warn!("no on-chain id recorded, refund requires manual action");
            return Ok(());
        };

        let wallet = self.wallets.get(tx.blockchain)?;
        let address = wallet.address_from_transaction(on_chain_id).await?;
        self.refund_to_sender(tx, tx.source_amount, &address).await
    }

    /// Expires stale quotes. Each row goes through the usual conditional
    /// transition, so a deposit racing the sweep still claims cleanly.
    pub async fn expire_stale_quotes(&self, ttl_minutes: i64) -> Result<usize, WorkflowError> {
        let ids = repo::stale_awaiting_payment(&self.pool, ttl_minutes).await?;
        let mut expired = 0;

        for id in ids {
            if repo::transition(
                &self.pool,
                id,
                TransactionStatus::AwaitingPayment,
                TransactionStatus::PaymentExpired,
            )
            .await?
            {
                expired += 1;
                let tx = self.load(id).await?;
                self.events.expired(&tx).await?;
            }
        }

        Ok(expired)
    }

    async fn load(&self, transaction_id: Uuid) -> Result<Transaction, WorkflowError> {
        repo::find(&self.pool, transaction_id)
            .await?
            .ok_or(WorkflowError::TransactionNotFound(transaction_id))
    }
}
