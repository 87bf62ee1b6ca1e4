//! Shared test fixtures: database setup, transaction builders, recording
//! collaborators, and pre-wired workflow/orchestrator harnesses.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use rust_decimal_macros::dec;
use sqlx::SqlitePool;
use url::Url;
use uuid::Uuid;

use crate::deposit::ReceivedCryptoTransaction;
use crate::error::{NotifyError, QueueError};
use crate::exchange::{ExchangeProviderFactory, ExchangeRoute};
use crate::flow::store as flow_store;
use crate::flow::{
    CompletionPolicy, FlowDefinition, FlowExecutorRegistry, FlowInstance, FlowOrchestrator,
    FlowSnapshot, FlowStatus, FlowStepInstance, InboundSignal, StepSpec, StepStatus, StepType,
    resolve_correlation,
};
use crate::model::{
    Blockchain, Corridor, CryptoCurrency, FiatCurrency, PaymentMethod, Transaction,
    TransactionStatus,
};
use crate::notify::{SlackNotifier, WebhookNotifier};
use crate::outbox::{Outbox, OutboxDispatcher, OutboxPolicy};
use crate::payment::mock::{MockPaymentConfig, MockPaymentService};
use crate::payment::PaymentRegistry;
use crate::queue::QueuePublisher;
use crate::transaction::{TransactionEventDispatcher, TransactionWorkflow};
use crate::wallet::mock::MockWalletHandler;
use crate::wallet::WalletRegistry;

/// Creates an in-memory SQLite database with all migrations applied.
pub async fn setup_test_db() -> SqlitePool {
    let pool = SqlitePool::connect(":memory:").await.unwrap();
    sqlx::migrate!().run(&pool).await.unwrap();
    pool
}

pub const PARTNER_WEBHOOK: &str = "https://partner.example/hooks";
pub const USER_WEBHOOK: &str = "https://user.example/hooks";

/// Builder for quoted transactions with sensible defaults.
pub struct TransactionBuilder {
    tx: Transaction,
}

impl Default for TransactionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionBuilder {
    pub fn new() -> Self {
        Self {
            tx: Transaction {
                id: Uuid::new_v4(),
                status: TransactionStatus::AwaitingPayment,
                blockchain: Blockchain::Stellar,
                crypto_currency: CryptoCurrency::Usdc,
                target_currency: FiatCurrency::Bob,
                source_amount: dec!(100),
                target_amount: dec!(690),
                deposit_address: "GDEPOSITWALLET".to_string(),
                recipient_account: "recipient-account-1".to_string(),
                payment_method: PaymentMethod::QrInstant,
                qr_code: Some("qr-payload".to_string()),
                on_chain_id: None,
                address_from: None,
                refund_on_chain_id: None,
                external_id: None,
                created_at: chrono::Utc::now(),
                updated_at: chrono::Utc::now(),
            },
        }
    }

    #[must_use]
    pub fn source_amount(mut self, amount: rust_decimal::Decimal) -> Self {
        self.tx.source_amount = amount;
        self
    }

    #[must_use]
    pub fn payment_method(mut self, method: PaymentMethod) -> Self {
        self.tx.payment_method = method;
        self
    }

    #[must_use]
    pub fn blockchain(mut self, blockchain: Blockchain) -> Self {
        self.tx.blockchain = blockchain;
        self
    }

    #[must_use]
    pub fn crypto_currency(mut self, currency: CryptoCurrency) -> Self {
        self.tx.crypto_currency = currency;
        self
    }

    #[must_use]
    pub fn status(mut self, status: TransactionStatus) -> Self {
        self.tx.status = status;
        self
    }

    pub fn build(self) -> Transaction {
        self.tx
    }
}

/// The verified deposit message matching the builder's defaults. The
/// on-chain id is derived from the transaction so a repeat call produces the
/// exact same message, as queue redelivery would.
pub fn deposit_message(tx: &Transaction, amount: rust_decimal::Decimal) -> ReceivedCryptoTransaction {
    ReceivedCryptoTransaction {
        transaction_id: tx.id,
        on_chain_id: format!("chain-{}", tx.id),
        amount,
        address_from: "GSENDER".to_string(),
        blockchain: tx.blockchain,
        crypto_currency: tx.crypto_currency,
    }
}

/// Webhook notifier that records every call instead of making one.
#[derive(Default)]
pub struct RecordingWebhooks {
    sent: Mutex<Vec<(Url, String, serde_json::Value)>>,
    failures: AtomicUsize,
}

impl RecordingWebhooks {
    pub fn sent(&self) -> Vec<(Url, String, serde_json::Value)> {
        self.sent.lock().unwrap().clone()
    }

    /// Makes the next `n` deliveries fail.
    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl WebhookNotifier for RecordingWebhooks {
    async fn notify(
        &self,
        url: &Url,
        event: &str,
        data: &serde_json::Value,
    ) -> Result<(), NotifyError> {
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(NotifyError::Status(503));
        }

        self.sent
            .lock()
            .unwrap()
            .push((url.clone(), event.to_string(), data.clone()));
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingSlack {
    posts: Mutex<Vec<String>>,
    failures: AtomicUsize,
}

impl RecordingSlack {
    pub fn posts(&self) -> Vec<String> {
        self.posts.lock().unwrap().clone()
    }

    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl SlackNotifier for RecordingSlack {
    async fn post(&self, text: &str) -> Result<(), NotifyError> {
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(NotifyError::Status(503));
        }

        self.posts.lock().unwrap().push(text.to_string());
        Ok(())
    }
}

/// Queue publisher that records posts per queue name.
#[derive(Default)]
pub struct RecordingQueue {
    posted: Mutex<Vec<(String, Option<String>, serde_json::Value)>>,
}

impl RecordingQueue {
    pub fn posted_to(&self, queue: &str) -> Vec<(Option<String>, serde_json::Value)> {
        self.posted
            .lock()
            .unwrap()
            .iter()
            .filter(|(q, _, _)| q == queue)
            .map(|(_, key, message)| (key.clone(), message.clone()))
            .collect()
    }
}

#[async_trait]
impl QueuePublisher for RecordingQueue {
    async fn post_message(
        &self,
        queue: &str,
        dedup_key: Option<&str>,
        message: &serde_json::Value,
    ) -> Result<(), QueueError> {
        self.posted.lock().unwrap().push((
            queue.to_string(),
            dedup_key.map(str::to_string),
            message.clone(),
        ));
        Ok(())
    }
}

/// Outbox wired to recording collaborators, default policy.
pub fn recording_outbox(
    pool: SqlitePool,
) -> (
    Arc<Outbox>,
    Arc<RecordingWebhooks>,
    Arc<RecordingSlack>,
    Arc<RecordingQueue>,
) {
    let webhooks = Arc::new(RecordingWebhooks::default());
    let slack = Arc::new(RecordingSlack::default());
    let queue = Arc::new(RecordingQueue::default());
    let outbox = Arc::new(Outbox::new(
        pool,
        OutboxDispatcher::new(
            webhooks.clone(),
            slack.clone(),
            queue.clone(),
            OutboxPolicy::default(),
        ),
    ));
    (outbox, webhooks, slack, queue)
}

/// A registry holding one mock wallet for the given chain.
pub fn wallet_registry(blockchain: Blockchain) -> (Arc<WalletRegistry>, Arc<MockWalletHandler>) {
    let wallet = Arc::new(MockWalletHandler::new(blockchain));
    let registry = Arc::new(WalletRegistry::new(vec![wallet.clone()]));
    (registry, wallet)
}

pub fn exchange_factory(address: &str) -> Arc<ExchangeProviderFactory> {
    Arc::new(ExchangeProviderFactory::new(vec![ExchangeRoute {
        blockchain: Blockchain::Stellar,
        crypto_currency: CryptoCurrency::Usdc,
        address: address.to_string(),
    }]))
}

/// A two-step definition exercising the waiting/auto pair, for store tests.
pub fn simple_definition(corridor: Corridor) -> FlowDefinition {
    FlowDefinition {
        id: Uuid::new_v4(),
        corridor,
        fee_bps: 150,
        enabled: true,
        steps: vec![
            StepSpec {
                step_type: StepType::ExchangeTransfer,
                order: 1,
                config: serde_json::Value::Null,
                completion: CompletionPolicy::AwaitSignal,
                signal_match: Some(balance_signal_template()),
            },
            StepSpec {
                step_type: StepType::PayoutTrigger,
                order: 2,
                config: serde_json::Value::Null,
                completion: CompletionPolicy::Auto,
                signal_match: None,
            },
        ],
    }
}

/// The full three-step corridor definition the orchestrator fixtures seed:
/// route funds to the exchange, trigger the payout, notify the partner.
pub fn standard_definition(corridor: Corridor) -> FlowDefinition {
    let mut definition = simple_definition(corridor);
    definition.steps.push(StepSpec {
        step_type: StepType::PartnerNotice,
        order: 3,
        config: serde_json::json!({ "event": "corridor.payout_triggered" }),
        completion: CompletionPolicy::Auto,
        signal_match: None,
    });
    definition
}

fn balance_signal_template() -> BTreeMap<String, String> {
    [
        ("transaction_id".to_string(), "$transaction_id".to_string()),
        ("event".to_string(), "exchange_balance".to_string()),
    ]
    .into_iter()
    .collect()
}

/// The exchange-balance signal the standard definition's first step waits
/// for.
pub fn balance_signal(transaction_id: Uuid, confirmed: bool) -> InboundSignal {
    InboundSignal {
        event_type: "exchange_balance".to_string(),
        correlation: [
            ("transaction_id".to_string(), transaction_id.to_string()),
            ("event".to_string(), "exchange_balance".to_string()),
        ]
        .into_iter()
        .collect(),
        payload: serde_json::json!({ "confirmed": confirmed }),
    }
}

/// Builds instance + step rows from a definition the way `start_flow` does,
/// for store tests that bypass the orchestrator.
pub fn instance_from_definition(
    definition: &FlowDefinition,
    transaction_id: Uuid,
) -> (FlowInstance, Vec<FlowStepInstance>) {
    let mut steps = definition.steps.clone();
    steps.sort_by_key(|s| s.order);

    let snapshot = FlowSnapshot {
        definition_id: definition.id,
        corridor: definition.corridor,
        fee_bps: definition.fee_bps,
        steps,
    };

    let instance = FlowInstance {
        id: Uuid::new_v4(),
        transaction_id,
        definition_id: definition.id,
        status: FlowStatus::InProgress,
        current_step_order: snapshot.first_order(),
        snapshot,
    };

    let step_instances = instance
        .snapshot
        .steps
        .iter()
        .map(|spec| FlowStepInstance {
            id: Uuid::new_v4(),
            flow_instance_id: instance.id,
            step_order: spec.order,
            step_type: spec.step_type,
            status: StepStatus::Ready,
            attempts: 0,
            correlation: spec
                .signal_match
                .as_ref()
                .map(|template| resolve_correlation(template, transaction_id)),
            config: spec.config.clone(),
            input: None,
            output: None,
            error: None,
        })
        .collect();

    (instance, step_instances)
}

/// Fully wired transaction workflow over recording collaborators and a
/// single mock payment provider.
pub struct WorkflowFixture {
    pub workflow: Arc<TransactionWorkflow>,
    pub orchestrator: Arc<FlowOrchestrator>,
    pub outbox: Arc<Outbox>,
    pub payment: Arc<MockPaymentService>,
    pub wallet: Arc<MockWalletHandler>,
    pub webhooks: Arc<RecordingWebhooks>,
    pub slack: Arc<RecordingSlack>,
    pub queue: Arc<RecordingQueue>,
}

impl WorkflowFixture {
    pub async fn new(pool: SqlitePool, payment_config: MockPaymentConfig) -> Self {
        let (outbox, webhooks, slack, queue) = recording_outbox(pool.clone());
        let (wallets, wallet) = wallet_registry(Blockchain::Stellar);

        let payment = Arc::new(MockPaymentService::new(payment_config));
        let payments = Arc::new(PaymentRegistry::new(vec![payment.clone()]));

        let events = TransactionEventDispatcher::new(
            outbox.clone(),
            Some(Url::parse(PARTNER_WEBHOOK).unwrap()),
            Some(Url::parse(USER_WEBHOOK).unwrap()),
        );

        let registry = Arc::new(FlowExecutorRegistry::standard(
            wallets.clone(),
            exchange_factory("GEXCHANGE"),
            outbox.clone(),
            Some(Url::parse(PARTNER_WEBHOOK).unwrap()),
        ));
        let orchestrator = Arc::new(FlowOrchestrator::new(pool.clone(), registry));

        let workflow = Arc::new(TransactionWorkflow::new(
            pool,
            events,
            payments,
            wallets,
            orchestrator.clone(),
        ));

        Self {
            workflow,
            orchestrator,
            outbox,
            payment,
            wallet,
            webhooks,
            slack,
            queue,
        }
    }
}

/// Orchestrator over recording collaborators, optionally with the standard
/// corridor definition seeded.
pub struct OrchestratorFixture {
    pub orchestrator: Arc<FlowOrchestrator>,
    pub wallet: Arc<MockWalletHandler>,
    pub webhooks: Arc<RecordingWebhooks>,
    pub queue: Arc<RecordingQueue>,
}

impl OrchestratorFixture {
    pub async fn with_standard_definition(pool: SqlitePool) -> Self {
        let fixture = Self::without_definitions(pool.clone()).await;
        let definition = standard_definition(Corridor {
            blockchain: Blockchain::Stellar,
            crypto_currency: CryptoCurrency::Usdc,
            target_currency: FiatCurrency::Bob,
        });
        flow_store::insert_definition(&pool, &definition).await.unwrap();
        fixture
    }

    pub async fn without_definitions(pool: SqlitePool) -> Self {
        let (outbox, webhooks, _, queue) = recording_outbox(pool.clone());
        let (wallets, wallet) = wallet_registry(Blockchain::Stellar);

        let registry = Arc::new(FlowExecutorRegistry::standard(
            wallets,
            exchange_factory("GEXCHANGE"),
            outbox,
            Some(Url::parse(PARTNER_WEBHOOK).unwrap()),
        ));
        let orchestrator = Arc::new(FlowOrchestrator::new(pool, registry));

        Self {
            orchestrator,
            wallet,
            webhooks,
            queue,
        }
    }
}
