//! Reconciliation sweep: re-scans the Stellar payment stream from a rewound
//! cursor to recover events the live listener may have skipped. Page fetches
//! are retried with exponential backoff; the cursor is only advanced to the
//! highest successfully scanned token, and only forward.

use std::sync::Arc;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use sqlx::SqlitePool;
use tracing::{debug, error, info};

use crate::error::VerifierError;
use crate::model::{Blockchain, TransactionStatus};
use crate::outbox::Outbox;
use crate::transaction as transaction_repo;

use super::stellar::{HorizonClient, HorizonPayment, StellarConfig, payment_qualifies};
use super::{DepositVerifierRegistry, Verification, cursor, memo_to_transaction_id,
    publish_verified};

const PAGE_LIMIT: u32 = 200;

fn page_retry_strat() -> ExponentialBuilder {
    const MAX_RETRIES: usize = 8;
    const INITIAL_DELAY: Duration = Duration::from_millis(200);
    const MAX_DELAY: Duration = Duration::from_secs(30);

    ExponentialBuilder::default()
        .with_max_times(MAX_RETRIES)
        .with_min_delay(INITIAL_DELAY)
        .with_max_delay(MAX_DELAY)
        .with_jitter()
}

/// Per-sweep accounting, logged and returned to the ops caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub scanned: usize,
    pub published: usize,
    /// Foreign or already-processed payments.
    pub skipped: usize,
    /// Payments whose memo did not name a known transaction.
    pub unresolved: usize,
}

pub struct StellarReconciliation {
    pool: SqlitePool,
    client: Arc<dyn HorizonClient>,
    verifiers: Arc<DepositVerifierRegistry>,
    outbox: Arc<Outbox>,
    config: StellarConfig,
    /// How far behind the stored cursor each sweep restarts, in paging-token
    /// units.
    lookback: i64,
    sweep_interval: Duration,
}

impl StellarReconciliation {
    pub fn new(
        pool: SqlitePool,
        client: Arc<dyn HorizonClient>,
        verifiers: Arc<DepositVerifierRegistry>,
        outbox: Arc<Outbox>,
        config: StellarConfig,
        lookback: i64,
        sweep_interval: Duration,
    ) -> Self {
        Self {
            pool,
            client,
            verifiers,
            outbox,
            config,
            lookback,
            sweep_interval,
        }
    }

    pub async fn run(self) {
        info!("starting stellar reconciliation sweep");

        loop {
            tokio::time::sleep(self.sweep_interval).await;

            match self.sweep_once().await {
                Ok(report) if report.published > 0 => {
                    info!(?report, "reconciliation recovered missed deposits");
                }
                Ok(report) => debug!(?report, "reconciliation sweep clean"),
                Err(e) => error!("reconciliation sweep failed: {e}"),
            }
        }
    }

    /// One full pass from the rewound cursor to the head of the stream.
    pub async fn sweep_once(&self) -> Result<SweepReport, VerifierError> {
        let stored = cursor::current(&self.pool, Blockchain::Stellar).await?;
        let mut position = stored.saturating_sub(self.lookback);
        let mut highest = stored;
        let mut report = SweepReport::default();
        let retry_strat = page_retry_strat();

        loop {
            let page = (|| async { self.client.payments_after(position, PAGE_LIMIT).await })
                .retry(&retry_strat)
                .await?;

            if page.is_empty() {
                break;
            }

            for payment in &page {
                let Some(token) = payment.paging_token_value() else {
                    continue;
                };
                position = position.max(token);
                highest = highest.max(token);

                report.scanned += 1;
                self.replay(payment, &mut report).await?;
            }

            if page.len() < PAGE_LIMIT as usize {
                break;
            }
        }

        cursor::advance(&self.pool, Blockchain::Stellar, highest).await?;
        Ok(report)
    }

    async fn replay(
        &self,
        payment: &HorizonPayment,
        report: &mut SweepReport,
    ) -> Result<(), VerifierError> {
        if !payment.transaction_successful || !payment_qualifies(&self.config, payment) {
            report.skipped += 1;
            return Ok(());
        }

        let Some(chain_tx) = self.client.transaction(&payment.transaction_hash).await? else {
            report.skipped += 1;
            return Ok(());
        };
        let Some(transaction_id) = chain_tx.memo.as_deref().and_then(memo_to_transaction_id)
        else {
            report.unresolved += 1;
            return Ok(());
        };

        // Already-processed transactions are the common case in a sweep; the
        // status check keeps them from paying the full verification path.
        match transaction_repo::find(&self.pool, transaction_id).await? {
            Some(tx) if tx.status == TransactionStatus::AwaitingPayment => {}
            Some(_) => {
                report.skipped += 1;
                return Ok(());
            }
            None => {
                report.unresolved += 1;
                return Ok(());
            }
        }

        let verifier = self.verifiers.get(Blockchain::Stellar)?;
        match verifier
            .verify_notification(&payment.transaction_hash, transaction_id)
            .await?
        {
            Verification::Verified(msg) => {
                publish_verified(&self.outbox, &msg).await?;
                info!(
                    %transaction_id,
                    on_chain_id = %msg.on_chain_id,
                    "reconciliation replayed a missed deposit"
                );
                report.published += 1;
            }
            Verification::Rejected(rejection) => {
                debug!(%transaction_id, %rejection, "reconciliation rejected payment");
                report.skipped += 1;
            }
        }

        Ok(())
    }
}
