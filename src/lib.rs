//! Crypto-deposit to fiat-payout orchestration: verifies on-chain deposits
//! against quoted transactions, dispatches fiat payouts through local
//! payment providers, and refunds mismatched or failed payments. The store
//! is the single arbiter of truth; every externally visible effect travels
//! through the durable outbox, which is what makes the at-least-once world
//! outside behave as exactly-once from the business's point of view.

use std::sync::Arc;

use rocket::{Ignite, Rocket};
use sqlx::SqlitePool;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

pub mod api;
pub mod conductor;
pub mod config;
pub mod deposit;
pub mod error;
pub mod exchange;
pub mod flow;
pub mod model;
pub mod notify;
pub mod outbox;
pub mod payment;
pub mod queue;
pub mod reservation;
pub mod telemetry;
pub mod transaction;
pub mod wallet;

#[cfg(test)]
pub mod test_utils;

use crate::conductor::{Conductor, ConductorCtx};
use crate::config::{Ctx, PaymentProviderCtx};
use crate::deposit::listener::StellarDepositListener;
use crate::deposit::reconcile::StellarReconciliation;
use crate::deposit::solana::{HttpSolanaRpcClient, SolanaDepositVerifier};
use crate::deposit::stellar::{HorizonClient, HttpHorizonClient, StellarDepositVerifier};
use crate::deposit::{DepositVerifier, DepositVerifierRegistry};
use crate::exchange::ExchangeProviderFactory;
use crate::flow::{FlowExecutorRegistry, FlowOrchestrator};
use crate::model::Blockchain;
use crate::notify::{HttpWebhookNotifier, SlackWebhookNotifier};
use crate::outbox::{Outbox, OutboxDispatcher};
use crate::payment::bank_rail::BankRailService;
use crate::payment::qr_instant::QrInstantService;
use crate::payment::{PaymentRegistry, PaymentService};
use crate::queue::LocalQueuePublisher;
use crate::transaction::{TransactionEventDispatcher, TransactionWorkflow};
use crate::wallet::{CustodianWalletHandler, WalletRegistry};

pub async fn launch(ctx: Ctx) -> anyhow::Result<()> {
    let pool = ctx.get_sqlite_pool().await?;
    sqlx::migrate!().run(&pool).await?;

    let seeded = flow::store::seed_definitions(&pool, &ctx.flows).await?;
    if seeded > 0 {
        info!(seeded, "seeded corridor flow definitions");
    }

    let http = reqwest::Client::new();

    let outbox = Arc::new(Outbox::new(
        pool.clone(),
        OutboxDispatcher::new(
            Arc::new(HttpWebhookNotifier::new(http.clone())),
            Arc::new(SlackWebhookNotifier::new(
                http.clone(),
                ctx.slack_webhook_url.clone(),
            )),
            Arc::new(LocalQueuePublisher::new(pool.clone())),
            ctx.outbox_policy,
        ),
    ));

    let wallets = Arc::new(WalletRegistry::new(vec![
        Arc::new(CustodianWalletHandler::new(
            http.clone(),
            ctx.custodian.clone(),
            Blockchain::Stellar,
        )),
        Arc::new(CustodianWalletHandler::new(
            http.clone(),
            ctx.custodian.clone(),
            Blockchain::Solana,
        )),
    ]));
    let exchange = Arc::new(ExchangeProviderFactory::new(ctx.exchange_routes.clone()));

    let payment_services: Vec<Arc<dyn PaymentService>> = ctx
        .payments
        .iter()
        .map(|provider| match provider {
            PaymentProviderCtx::QrInstant(config) => Arc::new(QrInstantService::new(
                http.clone(),
                config.clone(),
            )) as Arc<dyn PaymentService>,
            PaymentProviderCtx::BankRail(config) => {
                Arc::new(BankRailService::new(http.clone(), config.clone()))
            }
        })
        .collect();
    let payments = Arc::new(PaymentRegistry::new(payment_services));

    let events = TransactionEventDispatcher::new(
        outbox.clone(),
        ctx.partner_webhook_url.clone(),
        ctx.user_webhook_url.clone(),
    );

    let executors = Arc::new(FlowExecutorRegistry::standard(
        wallets.clone(),
        exchange,
        outbox.clone(),
        ctx.partner_webhook_url.clone(),
    ));
    let orchestrator = Arc::new(FlowOrchestrator::new(pool.clone(), executors));

    let workflow = Arc::new(TransactionWorkflow::new(
        pool.clone(),
        events.clone(),
        payments,
        wallets,
        orchestrator.clone(),
    ));

    let horizon: Arc<dyn HorizonClient> = Arc::new(HttpHorizonClient::new(
        http.clone(),
        ctx.stellar.config.horizon_url.clone(),
    ));
    let mut verifier_list: Vec<Arc<dyn DepositVerifier>> =
        vec![Arc::new(StellarDepositVerifier::new(
            pool.clone(),
            horizon.clone(),
            ctx.stellar.config.clone(),
        ))];
    if let Some(solana) = &ctx.solana {
        verifier_list.push(Arc::new(SolanaDepositVerifier::new(
            pool.clone(),
            Arc::new(HttpSolanaRpcClient::new(http.clone(), solana.rpc_url.clone())),
            solana.clone(),
        )));
    }
    let verifiers = Arc::new(DepositVerifierRegistry::new(verifier_list));

    let listener = StellarDepositListener::new(
        pool.clone(),
        horizon.clone(),
        verifiers.clone(),
        outbox.clone(),
        ctx.stellar.config.clone(),
        ctx.stellar.poll_interval,
    );
    let reconciliation = StellarReconciliation::new(
        pool.clone(),
        horizon,
        verifiers.clone(),
        outbox.clone(),
        ctx.stellar.config.clone(),
        ctx.stellar.reconcile_lookback,
        ctx.stellar.reconcile_interval,
    );

    let mut server_task = spawn_server_task(&ctx, &pool, verifiers, outbox.clone(), events);

    let mut conductor = Conductor::start(ConductorCtx {
        pool,
        workflow,
        orchestrator,
        outbox,
        listener: Some(listener),
        reconciliation: Some(reconciliation),
        consumer_poll_interval: ctx.consumer_poll_interval,
        outbox_poll_interval: ctx.outbox_poll_interval,
        outbox_report_interval: ctx.outbox_report_interval,
        quote_ttl_minutes: ctx.quote_ttl_minutes,
        expiry_sweep_interval: ctx.expiry_sweep_interval,
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal, shutting down gracefully");
        }
        result = &mut server_task => {
            match result {
                Ok(Ok(_)) => info!("server completed"),
                Ok(Err(e)) => error!("server failed: {e}"),
                Err(e) => error!("server task panicked: {e}"),
            }
        }
        task = conductor.wait_for_completion() => {
            warn!(task, "background task ended, shutting down");
        }
    }

    conductor.abort_all();
    server_task.abort();

    info!("shutdown complete");
    Ok(())
}

fn spawn_server_task(
    ctx: &Ctx,
    pool: &SqlitePool,
    verifiers: Arc<DepositVerifierRegistry>,
    outbox: Arc<Outbox>,
    events: TransactionEventDispatcher,
) -> JoinHandle<Result<Rocket<Ignite>, rocket::Error>> {
    let rocket_config = rocket::Config::figment()
        .merge(("port", ctx.server_port))
        .merge(("address", "0.0.0.0"));

    let rocket = rocket::custom(rocket_config)
        .mount("/", api::routes())
        .manage(pool.clone())
        .manage(verifiers)
        .manage(outbox)
        .manage(events);

    tokio::spawn(rocket.launch())
}
