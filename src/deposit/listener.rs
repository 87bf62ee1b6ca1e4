//! Live Stellar ingestion: polls Horizon's payment stream from the persisted
//! cursor and runs each event through the verifier and the outbox. The
//! cursor is advanced *before* an event is processed — a crash between the
//! two skips that one event rather than replaying it forever; the
//! reconciliation sweep exists to pick such gaps back up.

use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;
use tracing::{debug, error, info, warn};

use crate::error::VerifierError;
use crate::model::Blockchain;
use crate::outbox::Outbox;

use super::stellar::{HorizonClient, HorizonPayment, StellarConfig, payment_qualifies};
use super::{DepositVerifierRegistry, Verification, cursor, memo_to_transaction_id,
    publish_verified};

const PAGE_LIMIT: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IngestOutcome {
    Published,
    Skipped,
}

pub struct StellarDepositListener {
    pool: SqlitePool,
    client: Arc<dyn HorizonClient>,
    verifiers: Arc<DepositVerifierRegistry>,
    outbox: Arc<Outbox>,
    config: StellarConfig,
    poll_interval: Duration,
}

impl StellarDepositListener {
    pub fn new(
        pool: SqlitePool,
        client: Arc<dyn HorizonClient>,
        verifiers: Arc<DepositVerifierRegistry>,
        outbox: Arc<Outbox>,
        config: StellarConfig,
        poll_interval: Duration,
    ) -> Self {
        Self {
            pool,
            client,
            verifiers,
            outbox,
            config,
            poll_interval,
        }
    }

    pub async fn run(self) {
        info!("starting stellar deposit listener");

        loop {
            tokio::time::sleep(self.poll_interval).await;

            match self.poll_once().await {
                Ok(0) => {}
                Ok(published) => info!(published, "stellar listener published deposits"),
                Err(e) => error!("stellar listener poll failed: {e}"),
            }
        }
    }

    /// One pass over the payments after the cursor. Returns how many verified
    /// deposits were published.
    pub async fn poll_once(&self) -> Result<usize, VerifierError> {
        let resume = cursor::current(&self.pool, Blockchain::Stellar).await?;
        let payments = self.client.payments_after(resume, PAGE_LIMIT).await?;

        let mut published = 0;
        for payment in payments {
            let Some(token) = payment.paging_token_value() else {
                warn!(token = %payment.paging_token, "unparseable paging token, skipping");
                continue;
            };

            cursor::advance(&self.pool, Blockchain::Stellar, token).await?;

            match self.ingest(&payment).await {
                Ok(IngestOutcome::Published) => published += 1,
                Ok(IngestOutcome::Skipped) => {}
                // The cursor already moved past this event; the sweep will
                // revisit it.
                Err(e) => warn!(
                    hash = %payment.transaction_hash,
                    "failed to ingest payment, leaving it to reconciliation: {e}"
                ),
            }
        }

        Ok(published)
    }

    pub(crate) async fn ingest(
        &self,
        payment: &HorizonPayment,
    ) -> Result<IngestOutcome, VerifierError> {
        if !payment.transaction_successful || !payment_qualifies(&self.config, payment) {
            return Ok(IngestOutcome::Skipped);
        }

        let Some(chain_tx) = self.client.transaction(&payment.transaction_hash).await? else {
            return Ok(IngestOutcome::Skipped);
        };
        let Some(transaction_id) = chain_tx.memo.as_deref().and_then(memo_to_transaction_id)
        else {
            debug!(hash = %payment.transaction_hash, "memo does not resolve to a transaction");
            return Ok(IngestOutcome::Skipped);
        };

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
                    "verified deposit published"
                );
                Ok(IngestOutcome::Published)
            }
            Verification::Rejected(rejection) => {
                info!(%transaction_id, %rejection, "payment rejected");
                Ok(IngestOutcome::Skipped)
            }
        }
    }
}
