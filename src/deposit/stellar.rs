//! Stellar deposit verification over Horizon. A qualifying deposit is a
//! successful payment to the custody wallet in the corridor's asset, whose
//! transaction memo addresses the business transaction.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;
use sqlx::SqlitePool;
use url::Url;
use uuid::Uuid;

use crate::error::VerifierError;
use crate::model::{Blockchain, CryptoCurrency};

use super::{
    DepositVerifier, ReceivedCryptoTransaction, Verification, VerificationRejection, load_payable,
    memo_to_transaction_id,
};

#[derive(Debug, Clone, Deserialize)]
pub struct HorizonTransaction {
    pub hash: String,
    pub successful: bool,
    pub memo: Option<String>,
}

/// One record from Horizon's payments collection. `paging_token` orders the
/// ledger-wide payment stream and feeds the reconciliation cursor.
#[derive(Debug, Clone, Deserialize)]
pub struct HorizonPayment {
    pub paging_token: String,
    pub transaction_hash: String,
    pub from: String,
    pub to: String,
    pub asset_type: String,
    #[serde(default)]
    pub asset_code: Option<String>,
    #[serde(default)]
    pub asset_issuer: Option<String>,
    pub amount: String,
    pub transaction_successful: bool,
}

impl HorizonPayment {
    pub fn paging_token_value(&self) -> Option<i64> {
        self.paging_token.parse().ok()
    }
}

/// The slice of Horizon the deposit layer touches.
#[async_trait]
pub trait HorizonClient: Send + Sync {
    async fn transaction(&self, hash: &str) -> Result<Option<HorizonTransaction>, VerifierError>;

    async fn payments_for_transaction(
        &self,
        hash: &str,
    ) -> Result<Vec<HorizonPayment>, VerifierError>;

    /// Payments strictly after the cursor, ascending, at most `limit`.
    async fn payments_after(
        &self,
        cursor: i64,
        limit: u32,
    ) -> Result<Vec<HorizonPayment>, VerifierError>;
}

#[derive(Debug, Clone)]
pub struct StellarConfig {
    pub horizon_url: Url,
    /// Custody wallet quoted deposits are paid into.
    pub deposit_wallet: String,
    /// Issuer the USDC asset code must be anchored by.
    pub usdc_issuer: String,
}

pub struct HttpHorizonClient {
    client: reqwest::Client,
    base_url: Url,
}

#[derive(Debug, Deserialize)]
struct HorizonPage<T> {
    #[serde(rename = "_embedded")]
    embedded: HorizonEmbedded<T>,
}

#[derive(Debug, Deserialize)]
struct HorizonEmbedded<T> {
    records: Vec<T>,
}

impl HttpHorizonClient {
    pub fn new(client: reqwest::Client, base_url: Url) -> Self {
        Self { client, base_url }
    }

    fn endpoint(&self, path: &str) -> Result<Url, VerifierError> {
        self.base_url
            .join(path)
            .map_err(|e| VerifierError::MalformedResponse(format!("invalid horizon url: {e}")))
    }
}

#[async_trait]
impl HorizonClient for HttpHorizonClient {
    async fn transaction(&self, hash: &str) -> Result<Option<HorizonTransaction>, VerifierError> {
        let url = self.endpoint(&format!("transactions/{hash}"))?;
        let response = self.client.get(url).send().await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = response.error_for_status()?;

        Ok(Some(response.json().await?))
    }

    async fn payments_for_transaction(
        &self,
        hash: &str,
    ) -> Result<Vec<HorizonPayment>, VerifierError> {
        let url = self.endpoint(&format!("transactions/{hash}/payments"))?;
        let page: HorizonPage<HorizonPayment> = self
            .client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(page.embedded.records)
    }

    async fn payments_after(
        &self,
        cursor: i64,
        limit: u32,
    ) -> Result<Vec<HorizonPayment>, VerifierError> {
        let mut url = self.endpoint("payments")?;
        url.query_pairs_mut()
            .append_pair("cursor", &cursor.to_string())
            .append_pair("limit", &limit.to_string())
            .append_pair("order", "asc");

        let page: HorizonPage<HorizonPayment> = self
            .client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(page.embedded.records)
    }
}

/// Cheap prefilter the scanners apply before touching the database: does
/// this payment pay the custody wallet in an asset any corridor accepts.
pub fn payment_qualifies(config: &StellarConfig, payment: &HorizonPayment) -> bool {
    payment.to == config.deposit_wallet
        && (payment.asset_type == "native"
            || (payment.asset_code.as_deref() == Some("USDC")
                && payment.asset_issuer.as_deref() == Some(config.usdc_issuer.as_str())))
}

pub struct StellarDepositVerifier {
    pool: SqlitePool,
    client: Arc<dyn HorizonClient>,
    config: StellarConfig,
}

impl StellarDepositVerifier {
    pub fn new(pool: SqlitePool, client: Arc<dyn HorizonClient>, config: StellarConfig) -> Self {
        Self {
            pool,
            client,
            config,
        }
    }

    /// Whether a payment pays the corridor's asset: native lumens, or USDC
    /// anchored by the configured issuer.
    pub(crate) fn asset_matches(&self, payment: &HorizonPayment, currency: CryptoCurrency) -> bool {
        match currency {
            CryptoCurrency::Xlm => payment.asset_type == "native",
            CryptoCurrency::Usdc => {
                payment.asset_code.as_deref() == Some("USDC")
                    && payment.asset_issuer.as_deref() == Some(self.config.usdc_issuer.as_str())
            }
            CryptoCurrency::Sol => false,
        }
    }

    pub(crate) fn deposit_wallet(&self) -> &str {
        &self.config.deposit_wallet
    }
}

#[async_trait]
impl DepositVerifier for StellarDepositVerifier {
    fn blockchain(&self) -> Blockchain {
        Blockchain::Stellar
    }

    async fn verify_notification(
        &self,
        on_chain_id: &str,
        transaction_id: Uuid,
    ) -> Result<Verification, VerifierError> {
        let tx = match load_payable(&self.pool, transaction_id, Blockchain::Stellar, on_chain_id)
            .await?
        {
            Ok(tx) => tx,
            Err(rejection) => return Ok(Verification::Rejected(rejection)),
        };

        let Some(chain_tx) = self.client.transaction(on_chain_id).await? else {
            return Ok(Verification::Rejected(
                VerificationRejection::OnChainTransactionNotFound(on_chain_id.to_string()),
            ));
        };
        if !chain_tx.successful {
            return Ok(Verification::Rejected(VerificationRejection::FailedOnChain));
        }

        let addressed = chain_tx
            .memo
            .as_deref()
            .and_then(memo_to_transaction_id)
            .is_some_and(|id| id == transaction_id);
        if !addressed {
            return Ok(Verification::Rejected(VerificationRejection::MemoMismatch));
        }

        let payments = self.client.payments_for_transaction(on_chain_id).await?;
        let Some(payment) = payments.iter().find(|p| {
            p.transaction_successful
                && p.to == self.config.deposit_wallet
                && self.asset_matches(p, tx.crypto_currency)
        }) else {
            return Ok(Verification::Rejected(
                VerificationRejection::NoQualifyingTransfer,
            ));
        };

        let amount = Decimal::from_str(&payment.amount).map_err(|e| {
            VerifierError::MalformedResponse(format!("payment amount {}: {e}", payment.amount))
        })?;

        Ok(Verification::Verified(ReceivedCryptoTransaction {
            transaction_id,
            on_chain_id: on_chain_id.to_string(),
            amount,
            address_from: payment.from.clone(),
            blockchain: Blockchain::Stellar,
            crypto_currency: tx.crypto_currency,
        }))
    }
}
