//! Shared scenario fixtures: the full service stack wired over an in-memory
//! database, mock chain clients, mock providers, and httpmock webhook
//! endpoints.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use httpmock::MockServer;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use sqlx::SqlitePool;
use url::Url;
use uuid::Uuid;

use puente::conductor::{Conductor, ConductorCtx};
use puente::deposit::listener::StellarDepositListener;
use puente::deposit::mock::MockHorizonClient;
use puente::deposit::reconcile::StellarReconciliation;
use puente::deposit::stellar::{StellarConfig, StellarDepositVerifier};
use puente::deposit::{DepositVerifier, DepositVerifierRegistry};
use puente::exchange::{ExchangeProviderFactory, ExchangeRoute};
use puente::flow::store as flow_store;
use puente::flow::{
    CompletionPolicy, FlowDefinition, FlowExecutorRegistry, FlowOrchestrator, StepSpec, StepType,
};
use puente::model::{
    Blockchain, Corridor, CryptoCurrency, FiatCurrency, PaymentMethod, Transaction,
    TransactionStatus,
};
use puente::notify::{HttpWebhookNotifier, SlackWebhookNotifier};
use puente::outbox::{Outbox, OutboxDispatcher, OutboxPolicy};
use puente::payment::PaymentRegistry;
use puente::payment::mock::{MockPaymentConfig, MockPaymentService};
use puente::queue::LocalQueuePublisher;
use puente::transaction::{TransactionEventDispatcher, TransactionWorkflow};
use puente::wallet::WalletRegistry;
use puente::wallet::mock::MockWalletHandler;

pub const USDC_ISSUER: &str = "GISSUERUSDC";
pub const DEPOSIT_WALLET: &str = "GDEPOSITWALLET";

pub struct Scenario {
    pub pool: SqlitePool,
    pub horizon: Arc<MockHorizonClient>,
    pub payment: Arc<MockPaymentService>,
    pub wallet: Arc<MockWalletHandler>,
    pub listener: StellarDepositListener,
    pub reconciliation: StellarReconciliation,
    pub workflow: Arc<TransactionWorkflow>,
    pub orchestrator: Arc<FlowOrchestrator>,
    pub outbox: Arc<Outbox>,
    pub webhook_server: MockServer,
}

impl Scenario {
    pub async fn start(payment_config: MockPaymentConfig) -> Self {
        let pool = SqlitePool::connect(":memory:").await.unwrap();
        sqlx::migrate!().run(&pool).await.unwrap();

        let webhook_server = MockServer::start();
        // Accept everything; individual tests add stricter expectations.
        webhook_server.mock(|when, then| {
            when.path_contains("/");
            then.status(200);
        });

        let http = reqwest::Client::new();
        let outbox = Arc::new(Outbox::new(
            pool.clone(),
            OutboxDispatcher::new(
                Arc::new(HttpWebhookNotifier::new(http.clone())),
                Arc::new(SlackWebhookNotifier::new(
                    http,
                    Some(Url::parse(&webhook_server.url("/slack")).unwrap()),
                )),
                Arc::new(LocalQueuePublisher::new(pool.clone())),
                OutboxPolicy::default(),
            ),
        ));

        let wallet = Arc::new(MockWalletHandler::new(Blockchain::Stellar));
        let wallets = Arc::new(WalletRegistry::new(vec![wallet.clone()]));
        let exchange = Arc::new(ExchangeProviderFactory::new(vec![ExchangeRoute {
            blockchain: Blockchain::Stellar,
            crypto_currency: CryptoCurrency::Usdc,
            address: "GEXCHANGE".to_string(),
        }]));

        let payment = Arc::new(MockPaymentService::new(payment_config));
        let payments = Arc::new(PaymentRegistry::new(vec![payment.clone()]));

        let partner_url = Url::parse(&webhook_server.url("/partner")).unwrap();
        let user_url = Url::parse(&webhook_server.url("/user")).unwrap();
        let events = TransactionEventDispatcher::new(
            outbox.clone(),
            Some(partner_url.clone()),
            Some(user_url),
        );

        let executors = Arc::new(FlowExecutorRegistry::standard(
            wallets.clone(),
            exchange,
            outbox.clone(),
            Some(partner_url),
        ));
        let orchestrator = Arc::new(FlowOrchestrator::new(pool.clone(), executors));

        let workflow = Arc::new(TransactionWorkflow::new(
            pool.clone(),
            events,
            payments,
            wallets,
            orchestrator.clone(),
        ));

        let stellar_config = StellarConfig {
            horizon_url: Url::parse("https://horizon.example").unwrap(),
            deposit_wallet: DEPOSIT_WALLET.to_string(),
            usdc_issuer: USDC_ISSUER.to_string(),
        };
        let horizon = Arc::new(MockHorizonClient::default());
        let verifiers = Arc::new(DepositVerifierRegistry::new(vec![Arc::new(
            StellarDepositVerifier::new(pool.clone(), horizon.clone(), stellar_config.clone()),
        ) as Arc<dyn DepositVerifier>]));

        let listener = StellarDepositListener::new(
            pool.clone(),
            horizon.clone(),
            verifiers.clone(),
            outbox.clone(),
            stellar_config.clone(),
            Duration::from_secs(3600),
        );
        let reconciliation = StellarReconciliation::new(
            pool.clone(),
            horizon.clone(),
            verifiers,
            outbox.clone(),
            stellar_config,
            1_000_000,
            Duration::from_secs(3600),
        );

        Self {
            pool,
            horizon,
            payment,
            wallet,
            listener,
            reconciliation,
            workflow,
            orchestrator,
            outbox,
            webhook_server,
        }
    }

    /// Spawns the queue consumers. The chain scanners are driven explicitly
    /// from each scenario instead.
    pub fn spawn_conductor(&self) -> Conductor {
        Conductor::start(ConductorCtx {
            pool: self.pool.clone(),
            workflow: self.workflow.clone(),
            orchestrator: self.orchestrator.clone(),
            outbox: self.outbox.clone(),
            listener: None,
            reconciliation: None,
            consumer_poll_interval: Duration::from_millis(10),
            outbox_poll_interval: Duration::from_millis(50),
            outbox_report_interval: Duration::from_secs(600),
            quote_ttl_minutes: 60,
            expiry_sweep_interval: Duration::from_secs(3600),
        })
    }

    pub async fn insert_quote(
        &self,
        payment_method: PaymentMethod,
        source_amount: Decimal,
    ) -> Transaction {
        let tx = Transaction {
            id: Uuid::new_v4(),
            status: TransactionStatus::AwaitingPayment,
            blockchain: Blockchain::Stellar,
            crypto_currency: CryptoCurrency::Usdc,
            target_currency: FiatCurrency::Bob,
            source_amount,
            target_amount: dec!(690),
            deposit_address: DEPOSIT_WALLET.to_string(),
            recipient_account: "recipient-account-1".to_string(),
            payment_method,
            qr_code: Some("qr-payload".to_string()),
            on_chain_id: None,
            address_from: None,
            refund_on_chain_id: None,
            external_id: None,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        };
        puente::transaction::insert(&self.pool, &tx).await.unwrap();
        tx
    }

    pub async fn seed_standard_flow(&self) {
        let definition = FlowDefinition {
            id: Uuid::new_v4(),
            corridor: Corridor {
                blockchain: Blockchain::Stellar,
                crypto_currency: CryptoCurrency::Usdc,
                target_currency: FiatCurrency::Bob,
            },
            fee_bps: 150,
            enabled: true,
            steps: vec![
                StepSpec {
                    step_type: StepType::ExchangeTransfer,
                    order: 1,
                    config: serde_json::Value::Null,
                    completion: CompletionPolicy::AwaitSignal,
                    signal_match: Some(
                        [
                            ("transaction_id".to_string(), "$transaction_id".to_string()),
                            ("event".to_string(), "exchange_balance".to_string()),
                        ]
                        .into_iter()
                        .collect::<BTreeMap<_, _>>(),
                    ),
                },
                StepSpec {
                    step_type: StepType::PayoutTrigger,
                    order: 2,
                    config: serde_json::Value::Null,
                    completion: CompletionPolicy::Auto,
                    signal_match: None,
                },
            ],
        };
        flow_store::insert_definition(&self.pool, &definition)
            .await
            .unwrap();
    }

    pub async fn status_of(&self, transaction_id: Uuid) -> TransactionStatus {
        puente::transaction::find(&self.pool, transaction_id)
            .await
            .unwrap()
            .unwrap()
            .status
    }
}

pub fn sync_qr_provider() -> MockPaymentConfig {
    MockPaymentConfig {
        method: PaymentMethod::QrInstant,
        is_async: false,
        enabled: true,
        succeed: true,
        external_id: Some("qr-1".to_string()),
    }
}

pub fn async_bank_provider() -> MockPaymentConfig {
    MockPaymentConfig {
        method: PaymentMethod::BankRail,
        is_async: true,
        enabled: true,
        succeed: true,
        external_id: Some("bt-1001".to_string()),
    }
}

/// Polls until the condition holds or a generous timeout elapses.
pub async fn wait_until<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..250 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached within timeout");
}
