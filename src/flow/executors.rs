//! Per-step-type execution strategies. Executors are leaf objects resolved
//! from a capability map built once at startup; each parses its own typed
//! config at the boundary and reports one of three outcomes.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::info;
use url::Url;

use crate::error::FlowError;
use crate::exchange::ExchangeProviderFactory;
use crate::model::Transaction;
use crate::outbox::{Outbox, OutboxPayload};
use crate::queue::{PayoutDispatchMessage, QUEUE_PAYOUT_DISPATCH};
use crate::wallet::WalletRegistry;

use super::{FlowStepInstance, InboundSignal, StepType};

/// Facts a step executes against, rebuilt fresh from the store on every
/// claim. Nothing in memory crosses steps; prior outputs arrive keyed by
/// step order.
#[derive(Debug, Clone)]
pub struct StepRuntime {
    pub transaction: Transaction,
    pub prior_outputs: BTreeMap<i64, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Succeeded {
        output: serde_json::Value,
    },
    /// Suspend until a signal satisfying the correlation bag arrives. A
    /// `None` bag keeps whatever the step instance already carries.
    Waiting {
        correlation: Option<BTreeMap<String, String>>,
    },
    Failed {
        error: String,
    },
}

#[async_trait]
pub trait StepExecutor: Send + Sync {
    fn step_type(&self) -> StepType;

    async fn execute(
        &self,
        step: &FlowStepInstance,
        runtime: &StepRuntime,
    ) -> Result<StepOutcome, FlowError>;

    /// Executors without a signal handler have their waiting steps trivially
    /// marked succeeded when a matching signal arrives.
    fn handles_signals(&self) -> bool {
        false
    }

    async fn on_signal(
        &self,
        step: &FlowStepInstance,
        runtime: &StepRuntime,
        signal: &InboundSignal,
    ) -> Result<StepOutcome, FlowError> {
        let _ = (step, runtime, signal);
        Ok(StepOutcome::Succeeded {
            output: serde_json::Value::Null,
        })
    }
}

pub struct FlowExecutorRegistry {
    executors: HashMap<StepType, Arc<dyn StepExecutor>>,
}

impl FlowExecutorRegistry {
    pub fn new(executors: Vec<Arc<dyn StepExecutor>>) -> Self {
        Self {
            executors: executors.into_iter().map(|e| (e.step_type(), e)).collect(),
        }
    }

    /// The full executor set wired from the production collaborators.
    pub fn standard(
        wallets: Arc<WalletRegistry>,
        exchange: Arc<ExchangeProviderFactory>,
        outbox: Arc<Outbox>,
        partner_webhook_url: Option<Url>,
    ) -> Self {
        Self::new(vec![
            Arc::new(ExchangeTransferExecutor::new(wallets, exchange)),
            Arc::new(PayoutTriggerExecutor::new(outbox.clone())),
            Arc::new(PartnerNoticeExecutor::new(outbox, partner_webhook_url)),
        ])
    }

    pub fn get(&self, step_type: StepType) -> Result<&Arc<dyn StepExecutor>, FlowError> {
        self.executors
            .get(&step_type)
            .ok_or_else(|| FlowError::UnknownStepType(step_type.to_string()))
    }
}

/// Routes the deposited funds to the treasury exchange address, then waits
/// for the exchange-balance signal confirming the funds landed.
pub struct ExchangeTransferExecutor {
    wallets: Arc<WalletRegistry>,
    exchange: Arc<ExchangeProviderFactory>,
}

impl ExchangeTransferExecutor {
    pub fn new(wallets: Arc<WalletRegistry>, exchange: Arc<ExchangeProviderFactory>) -> Self {
        Self { wallets, exchange }
    }
}

#[derive(Debug, Deserialize)]
struct ExchangeBalanceSignal {
    #[serde(default = "confirmed_default")]
    confirmed: bool,
}

fn confirmed_default() -> bool {
    true
}

#[async_trait]
impl StepExecutor for ExchangeTransferExecutor {
    fn step_type(&self) -> StepType {
        StepType::ExchangeTransfer
    }

    async fn execute(
        &self,
        _step: &FlowStepInstance,
        runtime: &StepRuntime,
    ) -> Result<StepOutcome, FlowError> {
        let tx = &runtime.transaction;

        let Some(address) = self
            .exchange
            .exchange_address(tx.blockchain, tx.crypto_currency)
        else {
            return Err(FlowError::ExchangeRouteNotFound(format!(
                "{}/{}",
                tx.blockchain, tx.crypto_currency
            )));
        };

        let wallet = self.wallets.get(tx.blockchain)?;
        let transfer = wallet
            .send(address, tx.source_amount, tx.crypto_currency)
            .await?;

        if !transfer.success {
            return Ok(StepOutcome::Failed {
                error: "treasury transfer rejected by custodian".to_string(),
            });
        }

        info!(
            transfer_id = ?transfer.transaction_id,
            "treasury transfer dispatched, awaiting exchange balance"
        );

        Ok(StepOutcome::Waiting { correlation: None })
    }

    fn handles_signals(&self) -> bool {
        true
    }

    async fn on_signal(
        &self,
        _step: &FlowStepInstance,
        _runtime: &StepRuntime,
        signal: &InboundSignal,
    ) -> Result<StepOutcome, FlowError> {
        let balance: ExchangeBalanceSignal = if signal.payload.is_null() {
            ExchangeBalanceSignal { confirmed: true }
        } else {
            serde_json::from_value(signal.payload.clone())?
        };

        if balance.confirmed {
            Ok(StepOutcome::Succeeded {
                output: signal.payload.clone(),
            })
        } else {
            Ok(StepOutcome::Failed {
                error: "exchange balance not confirmed".to_string(),
            })
        }
    }
}

/// Publishes the payout-trigger queue message through the outbox. The dedup
/// key is the transaction id, so a replayed flow cannot trigger twice.
pub struct PayoutTriggerExecutor {
    outbox: Arc<Outbox>,
}

impl PayoutTriggerExecutor {
    pub fn new(outbox: Arc<Outbox>) -> Self {
        Self { outbox }
    }
}

#[async_trait]
impl StepExecutor for PayoutTriggerExecutor {
    fn step_type(&self) -> StepType {
        StepType::PayoutTrigger
    }

    async fn execute(
        &self,
        _step: &FlowStepInstance,
        runtime: &StepRuntime,
    ) -> Result<StepOutcome, FlowError> {
        let transaction_id = runtime.transaction.id;

        self.outbox
            .enqueue(OutboxPayload::Queue {
                queue: QUEUE_PAYOUT_DISPATCH.to_string(),
                dedup_key: Some(transaction_id.to_string()),
                message: serde_json::to_value(PayoutDispatchMessage { transaction_id })?,
            })
            .await?;

        Ok(StepOutcome::Succeeded {
            output: serde_json::json!({ "payout_trigger_enqueued": true }),
        })
    }
}

#[derive(Debug, Deserialize)]
struct PartnerNoticeConfig {
    event: String,
}

/// Sends a corridor-specific partner notification through the outbox. Has
/// no signal handler.
pub struct PartnerNoticeExecutor {
    outbox: Arc<Outbox>,
    partner_webhook_url: Option<Url>,
}

impl PartnerNoticeExecutor {
    pub fn new(outbox: Arc<Outbox>, partner_webhook_url: Option<Url>) -> Self {
        Self {
            outbox,
            partner_webhook_url,
        }
    }
}

#[async_trait]
impl StepExecutor for PartnerNoticeExecutor {
    fn step_type(&self) -> StepType {
        StepType::PartnerNotice
    }

    async fn execute(
        &self,
        step: &FlowStepInstance,
        runtime: &StepRuntime,
    ) -> Result<StepOutcome, FlowError> {
        let config: PartnerNoticeConfig = if step.config.is_null() {
            PartnerNoticeConfig {
                event: "flow.update".to_string(),
            }
        } else {
            serde_json::from_value(step.config.clone())?
        };

        let Some(url) = &self.partner_webhook_url else {
            info!("no partner webhook configured, notice skipped");
            return Ok(StepOutcome::Succeeded {
                output: serde_json::json!({ "notified": false }),
            });
        };

        self.outbox
            .enqueue(OutboxPayload::Webhook {
                url: url.clone(),
                event: config.event,
                data: serde_json::json!({
                    "transaction_id": runtime.transaction.id,
                    "step_order": step.step_order,
                }),
            })
            .await?;

        Ok(StepOutcome::Succeeded {
            output: serde_json::json!({ "notified": true }),
        })
    }
}
