//! Turns transaction transitions into partner/user/Slack notifications and
//! queue publishes, all recorded through the outbox so a crash between the
//! transition and the notification cannot lose the side effect.

use std::sync::Arc;

use rust_decimal::Decimal;
use url::Url;

use crate::error::OutboxError;
use crate::model::Transaction;
use crate::outbox::{Outbox, OutboxPayload};
use crate::queue::QUEUE_PAYMENT_SENT;

#[derive(Clone)]
pub struct TransactionEventDispatcher {
    outbox: Arc<Outbox>,
    partner_webhook_url: Option<Url>,
    user_webhook_url: Option<Url>,
}

impl TransactionEventDispatcher {
    pub fn new(
        outbox: Arc<Outbox>,
        partner_webhook_url: Option<Url>,
        user_webhook_url: Option<Url>,
    ) -> Self {
        Self {
            outbox,
            partner_webhook_url,
            user_webhook_url,
        }
    }

    async fn notify_both(
        &self,
        event: &str,
        data: serde_json::Value,
    ) -> Result<(), OutboxError> {
        for url in [&self.partner_webhook_url, &self.user_webhook_url]
            .into_iter()
            .flatten()
        {
            self.outbox
                .enqueue(OutboxPayload::Webhook {
                    url: url.clone(),
                    event: event.to_string(),
                    data: data.clone(),
                })
                .await?;
        }

        Ok(())
    }

    fn base_data(tx: &Transaction) -> serde_json::Value {
        serde_json::json!({
            "transaction_id": tx.id,
            "status": tx.status,
            "blockchain": tx.blockchain,
            "crypto_currency": tx.crypto_currency,
            "target_currency": tx.target_currency,
        })
    }

    pub async fn processing(&self, tx: &Transaction) -> Result<(), OutboxError> {
        self.notify_both("transaction.processing", Self::base_data(tx))
            .await
    }

    pub async fn wrong_amount(
        &self,
        tx: &Transaction,
        received: Decimal,
    ) -> Result<(), OutboxError> {
        let mut data = Self::base_data(tx);
        data["expected_amount"] = serde_json::json!(tx.source_amount.to_string());
        data["received_amount"] = serde_json::json!(received.to_string());
        self.notify_both("transaction.wrong_amount", data).await
    }

    /// Completed payout: webhooks plus the payment-sent event partners
    /// consume from the queue.
    pub async fn payment_completed(&self, tx: &Transaction) -> Result<(), OutboxError> {
        self.notify_both("payment.completed", Self::base_data(tx))
            .await?;

        self.outbox
            .enqueue(OutboxPayload::Queue {
                queue: QUEUE_PAYMENT_SENT.to_string(),
                dedup_key: Some(tx.id.to_string()),
                message: serde_json::json!({
                    "transaction_id": tx.id,
                    "external_id": tx.external_id,
                    "target_amount": tx.target_amount.to_string(),
                    "target_currency": tx.target_currency,
                }),
            })
            .await?;

        Ok(())
    }

    pub async fn payment_failed(&self, tx: &Transaction, reason: &str) -> Result<(), OutboxError> {
        let mut data = Self::base_data(tx);
        data["reason"] = serde_json::json!(reason);
        self.notify_both("payment.failed", data).await?;

        self.outbox
            .enqueue(OutboxPayload::Slack {
                text: format!("payout failed for transaction {}: {reason}", tx.id),
            })
            .await?;

        Ok(())
    }

    pub async fn refund_issued(
        &self,
        tx: &Transaction,
        refund_on_chain_id: &str,
        amount: Decimal,
    ) -> Result<(), OutboxError> {
        let mut data = Self::base_data(tx);
        data["refund_on_chain_id"] = serde_json::json!(refund_on_chain_id);
        data["refund_amount"] = serde_json::json!(amount.to_string());
        self.notify_both("refund.issued", data).await
    }

    pub async fn expired(&self, tx: &Transaction) -> Result<(), OutboxError> {
        self.notify_both("transaction.expired", Self::base_data(tx))
            .await
    }

    /// Manual ops re-send of the transaction's current status.
    pub async fn status_snapshot(&self, tx: &Transaction) -> Result<(), OutboxError> {
        self.notify_both("transaction.status", Self::base_data(tx))
            .await
    }
}
