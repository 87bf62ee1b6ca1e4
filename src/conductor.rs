//! Owns the background half of the service: the queue consumers feeding the
//! transaction workflow and the flow orchestrator, the outbox worker, the
//! chain scanners, and the expiry sweep. Consumers share no in-memory state;
//! every coordination point is a conditional update in the store, so any
//! number of them can be restarted freely.

use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use sqlx::SqlitePool;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::deposit::ReceivedCryptoTransaction;
use crate::deposit::listener::StellarDepositListener;
use crate::deposit::reconcile::StellarReconciliation;
use crate::error::{FlowError, WorkflowError};
use crate::flow::{FlowOrchestrator, InboundSignal};
use crate::outbox::{Outbox, OutboxWorker};
use crate::queue::{
    self, PayoutDispatchMessage, QUEUE_DEAD_LETTER, QUEUE_DEPOSITS, QUEUE_FLOW_SIGNALS,
    QUEUE_PAYOUT_DISPATCH, QUEUE_PROVIDER_UPDATES, QueuedMessage,
};
use crate::transaction::{ProviderStatusUpdate, TransactionWorkflow};

/// Everything the conductor needs to stand the background tasks up.
pub struct ConductorCtx {
    pub pool: SqlitePool,
    pub workflow: Arc<TransactionWorkflow>,
    pub orchestrator: Arc<FlowOrchestrator>,
    pub outbox: Arc<Outbox>,
    pub listener: Option<StellarDepositListener>,
    pub reconciliation: Option<StellarReconciliation>,
    pub consumer_poll_interval: Duration,
    pub outbox_poll_interval: Duration,
    pub outbox_report_interval: Duration,
    pub quote_ttl_minutes: i64,
    pub expiry_sweep_interval: Duration,
}

/// What a consumer decided about one claimed message.
enum ConsumeError {
    /// Malformed or unprocessable: log, dead-letter, mark processed.
    Drop(String),
    /// Transient: leave unprocessed for redelivery.
    Retry(String),
}

pub struct Conductor {
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl Conductor {
    pub fn start(ctx: ConductorCtx) -> Self {
        let mut tasks: Vec<(&'static str, JoinHandle<()>)> = Vec::new();

        let workflow = ctx.workflow.clone();
        tasks.push((
            "deposit-consumer",
            tokio::spawn(consume_loop(
                ctx.pool.clone(),
                QUEUE_DEPOSITS,
                ctx.consumer_poll_interval,
                move |message| {
                    let workflow = workflow.clone();
                    async move {
                        let msg: ReceivedCryptoTransaction = parse(&message)?;
                        workflow
                            .handle_incoming_deposit(&msg)
                            .await
                            .map_err(classify_workflow_error)
                    }
                    .boxed()
                },
            )),
        ));

        let workflow = ctx.workflow.clone();
        tasks.push((
            "payout-consumer",
            tokio::spawn(consume_loop(
                ctx.pool.clone(),
                QUEUE_PAYOUT_DISPATCH,
                ctx.consumer_poll_interval,
                move |message| {
                    let workflow = workflow.clone();
                    async move {
                        let msg: PayoutDispatchMessage = parse(&message)?;
                        workflow
                            .dispatch_payout(msg.transaction_id)
                            .await
                            .map_err(classify_workflow_error)
                    }
                    .boxed()
                },
            )),
        ));

        let workflow = ctx.workflow.clone();
        tasks.push((
            "provider-update-consumer",
            tokio::spawn(consume_loop(
                ctx.pool.clone(),
                QUEUE_PROVIDER_UPDATES,
                ctx.consumer_poll_interval,
                move |message| {
                    let workflow = workflow.clone();
                    async move {
                        let msg: ProviderStatusUpdate = parse(&message)?;
                        workflow
                            .handle_provider_status_update(&msg)
                            .await
                            .map_err(classify_workflow_error)
                    }
                    .boxed()
                },
            )),
        ));

        let orchestrator = ctx.orchestrator.clone();
        tasks.push((
            "signal-consumer",
            tokio::spawn(consume_loop(
                ctx.pool.clone(),
                QUEUE_FLOW_SIGNALS,
                ctx.consumer_poll_interval,
                move |message| {
                    let orchestrator = orchestrator.clone();
                    async move {
                        let signal: InboundSignal = parse(&message)?;
                        orchestrator
                            .handle_signal(&signal)
                            .await
                            .map(|_| ())
                            .map_err(classify_flow_error)
                    }
                    .boxed()
                },
            )),
        ));

        tasks.push((
            "outbox-worker",
            tokio::spawn(
                OutboxWorker::new(
                    ctx.outbox.clone(),
                    ctx.outbox_poll_interval,
                    ctx.outbox_report_interval,
                )
                .run(),
            ),
        ));

        if let Some(listener) = ctx.listener {
            tasks.push(("stellar-listener", tokio::spawn(listener.run())));
        }
        if let Some(reconciliation) = ctx.reconciliation {
            tasks.push(("stellar-reconciliation", tokio::spawn(reconciliation.run())));
        }

        tasks.push((
            "expiry-sweep",
            tokio::spawn(run_expiry_sweep(
                ctx.workflow,
                ctx.quote_ttl_minutes,
                ctx.expiry_sweep_interval,
            )),
        ));

        info!(task_count = tasks.len(), "conductor started");
        Self { tasks }
    }

    /// Blocks until any task exits and names it. Tasks are loops, so an exit
    /// means something broke and the caller should shut down.
    pub async fn wait_for_completion(&mut self) -> &'static str {
        let (result, index, _) =
            futures_util::future::select_all(self.tasks.iter_mut().map(|(_, handle)| handle))
                .await;
        let name = self.tasks[index].0;

        match result {
            Ok(()) => warn!(task = name, "conductor task exited"),
            Err(e) => error!(task = name, "conductor task panicked: {e}"),
        }

        name
    }

    pub fn abort_all(&self) {
        for (name, handle) in &self.tasks {
            info!(task = name, "aborting conductor task");
            handle.abort();
        }
    }
}

fn parse<T: serde::de::DeserializeOwned>(message: &QueuedMessage) -> Result<T, ConsumeError> {
    message
        .parse()
        .map_err(|e| ConsumeError::Drop(format!("malformed payload: {e}")))
}

fn classify_workflow_error(e: WorkflowError) -> ConsumeError {
    match e {
        WorkflowError::TransactionNotFound(_) => ConsumeError::Drop(e.to_string()),
        other => ConsumeError::Retry(other.to_string()),
    }
}

fn classify_flow_error(e: FlowError) -> ConsumeError {
    match e {
        FlowError::TransactionNotFound(_) | FlowError::InstanceNotFound(_) => {
            ConsumeError::Drop(e.to_string())
        }
        other => ConsumeError::Retry(other.to_string()),
    }
}

/// One at-least-once consumer: claim the oldest unprocessed message, hand it
/// to the handler, and mark it processed only on a clean return. A retryable
/// failure leaves the record in place; a dropped one is dead-lettered so ops
/// can inspect it.
async fn consume_loop<F>(
    pool: SqlitePool,
    queue_name: &'static str,
    poll_interval: Duration,
    handler: F,
) where
    F: Fn(QueuedMessage) -> BoxFuture<'static, Result<(), ConsumeError>> + Send + 'static,
{
    info!(queue = queue_name, "starting consumer");

    loop {
        let message = match queue::next_unprocessed(&pool, queue_name).await {
            Ok(Some(message)) => message,
            Ok(None) => {
                sleep(poll_interval).await;
                continue;
            }
            Err(e) => {
                error!(queue = queue_name, "queue poll failed: {e}");
                sleep(poll_interval).await;
                continue;
            }
        };

        match handler(message.clone()).await {
            Ok(()) => {
                if let Err(e) = queue::mark_processed(&pool, message.id).await {
                    error!(queue = queue_name, message_id = message.id, "mark failed: {e}");
                    sleep(poll_interval).await;
                }
            }
            Err(ConsumeError::Drop(reason)) => {
                warn!(
                    queue = queue_name,
                    message_id = message.id,
                    reason, "dropping message"
                );
                dead_letter(&pool, &message, &reason).await;
                if let Err(e) = queue::mark_processed(&pool, message.id).await {
                    error!(queue = queue_name, message_id = message.id, "mark failed: {e}");
                    sleep(poll_interval).await;
                }
            }
            Err(ConsumeError::Retry(reason)) => {
                warn!(
                    queue = queue_name,
                    message_id = message.id,
                    reason, "handler failed, leaving message for redelivery"
                );
                if let Err(e) = queue::record_attempt(&pool, message.id).await {
                    error!(queue = queue_name, message_id = message.id, "attempt bump failed: {e}");
                }
                sleep(poll_interval).await;
            }
        }
    }
}

/// Best-effort: a dead-letter failure must not take the consumer down.
async fn dead_letter(pool: &SqlitePool, message: &QueuedMessage, reason: &str) {
    let payload = serde_json::json!({
        "queue": message.queue,
        "payload": message.payload,
        "reason": reason,
    });

    if let Err(e) = queue::enqueue_message(pool, QUEUE_DEAD_LETTER, None, &payload).await {
        warn!(message_id = message.id, "failed to dead-letter message: {e}");
    }
}

async fn run_expiry_sweep(
    workflow: Arc<TransactionWorkflow>,
    quote_ttl_minutes: i64,
    interval: Duration,
) {
    info!("starting quote expiry sweep");

    loop {
        sleep(interval).await;

        match workflow.expire_stale_quotes(quote_ttl_minutes).await {
            Ok(0) => {}
            Ok(expired) => info!(expired, "expired stale quotes"),
            Err(e) => error!("expiry sweep failed: {e}"),
        }
    }
}
