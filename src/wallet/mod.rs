//! On-chain wallet operations behind a custodian seam: sending refunds and
//! treasury transfers, and resolving the sender address of a deposit.

pub mod mock;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;
use url::Url;

use crate::error::WalletError;
use crate::model::{Blockchain, CryptoCurrency};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalletTransfer {
    pub success: bool,
    pub transaction_id: Option<String>,
}

#[async_trait]
pub trait WalletHandler: Send + Sync {
    fn blockchain(&self) -> Blockchain;

    async fn send(
        &self,
        address: &str,
        amount: Decimal,
        crypto_currency: CryptoCurrency,
    ) -> Result<WalletTransfer, WalletError>;

    /// Resolves the depositor address from an on-chain transaction id, for
    /// refunds where the sender is no longer known locally.
    async fn address_from_transaction(&self, on_chain_id: &str) -> Result<String, WalletError>;
}

pub struct WalletRegistry {
    handlers: HashMap<Blockchain, Arc<dyn WalletHandler>>,
}

impl WalletRegistry {
    pub fn new(handlers: Vec<Arc<dyn WalletHandler>>) -> Self {
        Self {
            handlers: handlers.into_iter().map(|h| (h.blockchain(), h)).collect(),
        }
    }

    pub fn get(&self, blockchain: Blockchain) -> Result<&Arc<dyn WalletHandler>, WalletError> {
        self.handlers
            .get(&blockchain)
            .ok_or(WalletError::UnsupportedBlockchain(blockchain))
    }
}

/// Wallet operations delegated to the treasury custodian's HTTP API; keys
/// never live in this process.
#[derive(Debug, Clone)]
pub struct CustodianConfig {
    pub base_url: Url,
    pub api_key: String,
}

pub struct CustodianWalletHandler {
    client: reqwest::Client,
    config: CustodianConfig,
    blockchain: Blockchain,
}

#[derive(Debug, Deserialize)]
struct CustodianTransferResponse {
    success: bool,
    tx_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CustodianTransactionResponse {
    from_address: Option<String>,
}

impl CustodianWalletHandler {
    pub fn new(client: reqwest::Client, config: CustodianConfig, blockchain: Blockchain) -> Self {
        Self {
            client,
            config,
            blockchain,
        }
    }

    fn endpoint(&self, path: &str) -> Result<Url, WalletError> {
        self.config
            .base_url
            .join(path)
            .map_err(|e| WalletError::Custodian(format!("invalid base url: {e}")))
    }
}

#[async_trait]
impl WalletHandler for CustodianWalletHandler {
    fn blockchain(&self) -> Blockchain {
        self.blockchain
    }

    async fn send(
        &self,
        address: &str,
        amount: Decimal,
        crypto_currency: CryptoCurrency,
    ) -> Result<WalletTransfer, WalletError> {
        let response = self
            .client
            .post(self.endpoint("transfers")?)
            .bearer_auth(&self.config.api_key)
            .json(&serde_json::json!({
                "blockchain": self.blockchain,
                "asset": crypto_currency,
                "destination": address,
                "amount": amount.to_string(),
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(WalletError::Custodian(format!(
                "transfer returned status {}",
                response.status()
            )));
        }

        let body: CustodianTransferResponse = response.json().await?;

        Ok(WalletTransfer {
            success: body.success,
            transaction_id: body.tx_id,
        })
    }

    async fn address_from_transaction(&self, on_chain_id: &str) -> Result<String, WalletError> {
        let path = format!("chains/{}/transactions/{on_chain_id}", self.blockchain);
        let response = self
            .client
            .get(self.endpoint(&path)?)
            .bearer_auth(&self.config.api_key)
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(WalletError::TransactionNotFound(on_chain_id.to_string()));
        }
        if !response.status().is_success() {
            return Err(WalletError::Custodian(format!(
                "transaction lookup returned status {}",
                response.status()
            )));
        }

        let body: CustodianTransactionResponse = response.json().await?;
        body.from_address
            .ok_or_else(|| WalletError::TransactionNotFound(on_chain_id.to_string()))
    }
}
