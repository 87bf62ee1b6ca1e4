//! Configurable chain-client mocks for tests and dry runs.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::VerifierError;
use crate::model::Transaction;

use super::stellar::{HorizonClient, HorizonPayment, HorizonTransaction};
use super::solana::{SolanaBalanceDelta, SolanaRpcClient, SolanaTransaction};
use super::transaction_id_to_memo;

/// One on-chain Stellar deposit as Horizon would report it: the transaction
/// record plus its payment operation.
#[derive(Debug, Clone)]
pub struct StellarDeposit {
    pub transaction: HorizonTransaction,
    pub payment: HorizonPayment,
}

/// A USDC deposit correctly addressed to the given quoted transaction.
pub fn stellar_deposit(
    tx: &Transaction,
    hash: &str,
    paging_token: i64,
    amount: rust_decimal::Decimal,
    issuer: &str,
) -> StellarDeposit {
    StellarDeposit {
        transaction: HorizonTransaction {
            hash: hash.to_string(),
            successful: true,
            memo: Some(transaction_id_to_memo(tx.id)),
        },
        payment: HorizonPayment {
            paging_token: paging_token.to_string(),
            transaction_hash: hash.to_string(),
            from: "GSENDER".to_string(),
            to: tx.deposit_address.clone(),
            asset_type: "credit_alphanum4".to_string(),
            asset_code: Some("USDC".to_string()),
            asset_issuer: Some(issuer.to_string()),
            amount: amount.to_string(),
            transaction_successful: true,
        },
    }
}

#[derive(Default)]
pub struct MockHorizonClient {
    deposits: Mutex<Vec<StellarDeposit>>,
}

impl MockHorizonClient {
    pub fn add(&self, deposit: StellarDeposit) {
        self.deposits.lock().unwrap().push(deposit);
    }
}

#[async_trait]
impl HorizonClient for MockHorizonClient {
    async fn transaction(&self, hash: &str) -> Result<Option<HorizonTransaction>, VerifierError> {
        Ok(self
            .deposits
            .lock()
            .unwrap()
            .iter()
            .find(|d| d.transaction.hash == hash)
            .map(|d| d.transaction.clone()))
    }

    async fn payments_for_transaction(
        &self,
        hash: &str,
    ) -> Result<Vec<HorizonPayment>, VerifierError> {
        Ok(self
            .deposits
            .lock()
            .unwrap()
            .iter()
            .filter(|d| d.payment.transaction_hash == hash)
            .map(|d| d.payment.clone())
            .collect())
    }

    async fn payments_after(
        &self,
        cursor: i64,
        limit: u32,
    ) -> Result<Vec<HorizonPayment>, VerifierError> {
        let mut payments: Vec<HorizonPayment> = self
            .deposits
            .lock()
            .unwrap()
            .iter()
            .map(|d| d.payment.clone())
            .filter(|p| p.paging_token_value().is_some_and(|token| token > cursor))
            .collect();
        payments.sort_by_key(|p| p.paging_token_value());
        payments.truncate(limit as usize);
        Ok(payments)
    }
}

/// A token deposit of `raw` base units (6 decimals) landing on
/// `credit_account`, sent by `SenderWallet111`.
pub fn solana_usdc_deposit(mint: &str, credit_account: &str, raw: i128) -> SolanaTransaction {
    SolanaTransaction {
        succeeded: true,
        deltas: vec![
            SolanaBalanceDelta {
                token_account: credit_account.to_string(),
                mint: mint.to_string(),
                owner: "CustodyWallet111".to_string(),
                raw_delta: raw,
                decimals: 6,
            },
            SolanaBalanceDelta {
                token_account: "SenderUsdcAta".to_string(),
                mint: mint.to_string(),
                owner: "SenderWallet111".to_string(),
                raw_delta: -raw,
                decimals: 6,
            },
        ],
    }
}

#[derive(Default)]
pub struct MockSolanaRpc {
    transactions: Mutex<HashMap<String, SolanaTransaction>>,
    token_accounts: Mutex<HashMap<(String, String), String>>,
}

impl MockSolanaRpc {
    pub fn add_transaction(&self, signature: &str, transaction: SolanaTransaction) {
        self.transactions
            .lock()
            .unwrap()
            .insert(signature.to_string(), transaction);
    }

    pub fn set_token_account(&self, wallet: &str, mint: &str, account: &str) {
        self.token_accounts
            .lock()
            .unwrap()
            .insert((wallet.to_string(), mint.to_string()), account.to_string());
    }
}

#[async_trait]
impl SolanaRpcClient for MockSolanaRpc {
    async fn transaction(
        &self,
        signature: &str,
    ) -> Result<Option<SolanaTransaction>, VerifierError> {
        Ok(self.transactions.lock().unwrap().get(signature).cloned())
    }

    async fn token_account_for(
        &self,
        wallet: &str,
        mint: &str,
    ) -> Result<Option<String>, VerifierError> {
        Ok(self
            .token_accounts
            .lock()
            .unwrap()
            .get(&(wallet.to_string(), mint.to_string()))
            .cloned())
    }
}
