//! Solana deposit verification over JSON-RPC. Solana is an account-model
//! chain: the custody wallet holds one associated token account per mint, so
//! a qualifying deposit is a positive balance delta on the derived token
//! account in the corridor's mint. Native SOL moves on the wallet account
//! itself and is modelled as the pseudo-mint `native`.

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
};

pub const NATIVE_MINT: &str = "native";
const NATIVE_DECIMALS: u32 = 9;

/// One balance movement inside a confirmed Solana transaction, already
/// netted from the pre/post balance pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SolanaBalanceDelta {
    /// Token account (or the wallet itself for native SOL).
    pub token_account: String,
    pub mint: String,
    /// Owner wallet behind the token account.
    pub owner: String,
    /// Raw base units, negative for the sending side.
    pub raw_delta: i128,
    pub decimals: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SolanaTransaction {
    pub succeeded: bool,
    pub deltas: Vec<SolanaBalanceDelta>,
}

/// The slice of the Solana RPC surface the deposit layer touches.
#[async_trait]
pub trait SolanaRpcClient: Send + Sync {
    async fn transaction(
        &self,
        signature: &str,
    ) -> Result<Option<SolanaTransaction>, VerifierError>;

    /// Resolves the custody token account for (wallet, mint). The wallet
    /// itself for the native pseudo-mint.
    async fn token_account_for(
        &self,
        wallet: &str,
        mint: &str,
    ) -> Result<Option<String>, VerifierError>;
}

#[derive(Debug, Clone)]
pub struct SolanaConfig {
    pub rpc_url: Url,
    pub deposit_wallet: String,
    pub usdc_mint: String,
}

pub struct SolanaDepositVerifier {
    pool: SqlitePool,
    client: Arc<dyn SolanaRpcClient>,
    config: SolanaConfig,
}

impl SolanaDepositVerifier {
    pub fn new(pool: SqlitePool, client: Arc<dyn SolanaRpcClient>, config: SolanaConfig) -> Self {
        Self {
            pool,
            client,
            config,
        }
    }

    fn mint_for(&self, currency: CryptoCurrency) -> Option<&str> {
        match currency {
            CryptoCurrency::Usdc => Some(self.config.usdc_mint.as_str()),
            CryptoCurrency::Sol => Some(NATIVE_MINT),
            CryptoCurrency::Xlm => None,
        }
    }
}

#[async_trait]
impl DepositVerifier for SolanaDepositVerifier {
    fn blockchain(&self) -> Blockchain {
        Blockchain::Solana
    }

    async fn verify_notification(
        &self,
        on_chain_id: &str,
        transaction_id: Uuid,
    ) -> Result<Verification, VerifierError> {
        let tx = match load_payable(&self.pool, transaction_id, Blockchain::Solana, on_chain_id)
            .await?
        {
            Ok(tx) => tx,
            Err(rejection) => return Ok(Verification::Rejected(rejection)),
        };

        let Some(mint) = self.mint_for(tx.crypto_currency) else {
            return Ok(Verification::Rejected(
                VerificationRejection::CorridorMismatch,
            ));
        };

        let Some(custody_account) = self
            .client
            .token_account_for(&self.config.deposit_wallet, mint)
            .await?
        else {
            return Ok(Verification::Rejected(
                VerificationRejection::NoQualifyingTransfer,
            ));
        };

        let Some(chain_tx) = self.client.transaction(on_chain_id).await? else {
            return Ok(Verification::Rejected(
                VerificationRejection::OnChainTransactionNotFound(on_chain_id.to_string()),
            ));
        };
        if !chain_tx.succeeded {
            return Ok(Verification::Rejected(VerificationRejection::FailedOnChain));
        }

        let Some(credit) = chain_tx
            .deltas
            .iter()
            .find(|d| d.token_account == custody_account && d.mint == mint && d.raw_delta > 0)
        else {
            return Ok(Verification::Rejected(
                VerificationRejection::NoQualifyingTransfer,
            ));
        };

        // The sending side of the same mint names the depositor, which the
        // refund path pays back to.
        let Some(debit) = chain_tx
            .deltas
            .iter()
            .find(|d| d.mint == mint && d.raw_delta < 0)
        else {
            return Ok(Verification::Rejected(
                VerificationRejection::NoQualifyingTransfer,
            ));
        };

        let amount = Decimal::from_i128_with_scale(credit.raw_delta, credit.decimals);

        Ok(Verification::Verified(ReceivedCryptoTransaction {
            transaction_id,
            on_chain_id: on_chain_id.to_string(),
            amount,
            address_from: debit.owner.clone(),
            blockchain: Blockchain::Solana,
            crypto_currency: tx.crypto_currency,
        }))
    }
}

pub struct HttpSolanaRpcClient {
    client: reqwest::Client,
    rpc_url: Url,
}

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct RpcTransaction {
    meta: RpcMeta,
    transaction: RpcTransactionBody,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcMeta {
    err: Option<serde_json::Value>,
    #[serde(default)]
    pre_balances: Vec<u64>,
    #[serde(default)]
    post_balances: Vec<u64>,
    #[serde(default)]
    pre_token_balances: Vec<RpcTokenBalance>,
    #[serde(default)]
    post_token_balances: Vec<RpcTokenBalance>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcTokenBalance {
    account_index: usize,
    mint: String,
    #[serde(default)]
    owner: Option<String>,
    ui_token_amount: RpcTokenAmount,
}

#[derive(Debug, Deserialize)]
struct RpcTokenAmount {
    amount: String,
    decimals: u32,
}

#[derive(Debug, Deserialize)]
struct RpcTransactionBody {
    message: RpcMessage,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcMessage {
    account_keys: Vec<RpcAccountKey>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RpcAccountKey {
    Parsed { pubkey: String },
    Raw(String),
}

impl RpcAccountKey {
    fn pubkey(&self) -> &str {
        match self {
            Self::Parsed { pubkey } => pubkey,
            Self::Raw(pubkey) => pubkey,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RpcTokenAccounts {
    value: Vec<RpcTokenAccountEntry>,
}

#[derive(Debug, Deserialize)]
struct RpcTokenAccountEntry {
    pubkey: String,
}

impl HttpSolanaRpcClient {
    pub fn new(client: reqwest::Client, rpc_url: Url) -> Self {
        Self { client, rpc_url }
    }

    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<Option<T>, VerifierError> {
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });

        let response: RpcResponse<T> = self
            .client
            .post(self.rpc_url.clone())
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(response.result)
    }
}

fn token_deltas(meta: &RpcMeta, keys: &[RpcAccountKey]) -> Vec<SolanaBalanceDelta> {
    let mut deltas = Vec::new();

    // Token-account movements, netted per (account, mint) from the pre/post
    // snapshots the RPC returns.
    for post in &meta.post_token_balances {
        let pre_amount = meta
            .pre_token_balances
            .iter()
            .find(|pre| pre.account_index == post.account_index && pre.mint == post.mint)
            .and_then(|pre| pre.ui_token_amount.amount.parse::<i128>().ok())
            .unwrap_or(0);
        let Ok(post_amount) = post.ui_token_amount.amount.parse::<i128>() else {
            continue;
        };
        let Some(key) = keys.get(post.account_index) else {
            continue;
        };

        let raw_delta = post_amount - pre_amount;
        if raw_delta == 0 {
            continue;
        }

        deltas.push(SolanaBalanceDelta {
            token_account: key.pubkey().to_string(),
            mint: post.mint.clone(),
            owner: post.owner.clone().unwrap_or_else(|| key.pubkey().to_string()),
            raw_delta,
            decimals: post.ui_token_amount.decimals,
        });
    }

    // Native lamport movements on the wallet accounts themselves.
    for (index, (pre, post)) in meta
        .pre_balances
        .iter()
        .zip(meta.post_balances.iter())
        .enumerate()
    {
        let raw_delta = i128::from(*post) - i128::from(*pre);
        let Some(key) = keys.get(index) else {
            continue;
        };
        if raw_delta == 0 {
            continue;
        }

        deltas.push(SolanaBalanceDelta {
            token_account: key.pubkey().to_string(),
            mint: NATIVE_MINT.to_string(),
            owner: key.pubkey().to_string(),
            raw_delta,
            decimals: NATIVE_DECIMALS,
        });
    }

    deltas
}

#[async_trait]
impl SolanaRpcClient for HttpSolanaRpcClient {
    async fn transaction(
        &self,
        signature: &str,
    ) -> Result<Option<SolanaTransaction>, VerifierError> {
        let params = serde_json::json!([
            signature,
            { "encoding": "jsonParsed", "maxSupportedTransactionVersion": 0 },
        ]);

        let Some(tx) = self.call::<RpcTransaction>("getTransaction", params).await? else {
            return Ok(None);
        };

        Ok(Some(SolanaTransaction {
            succeeded: tx.meta.err.is_none(),
            deltas: token_deltas(&tx.meta, &tx.transaction.message.account_keys),
        }))
    }

    async fn token_account_for(
        &self,
        wallet: &str,
        mint: &str,
    ) -> Result<Option<String>, VerifierError> {
        if mint == NATIVE_MINT {
            return Ok(Some(wallet.to_string()));
        }

        let params = serde_json::json!([
            wallet,
            { "mint": mint },
            { "encoding": "jsonParsed" },
        ]);

        let accounts = self
            .call::<RpcTokenAccounts>("getTokenAccountsByOwner", params)
            .await?;

        Ok(accounts.and_then(|a| a.value.into_iter().next().map(|entry| entry.pubkey)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deposit::mock::{MockSolanaRpc, solana_usdc_deposit};
    use crate::test_utils::{TransactionBuilder, setup_test_db};
    use crate::transaction as transaction_repo;
    use rust_decimal_macros::dec;

    const USDC_MINT: &str = "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v";

    fn config() -> SolanaConfig {
        SolanaConfig {
            rpc_url: Url::parse("https://rpc.example").unwrap(),
            deposit_wallet: "CustodyWallet111".to_string(),
            usdc_mint: USDC_MINT.to_string(),
        }
    }

    #[tokio::test]
    async fn token_deposit_on_the_derived_account_verifies() {
        let pool = setup_test_db().await;
        let tx = TransactionBuilder::new()
            .blockchain(Blockchain::Solana)
            .build();
        transaction_repo::insert(&pool, &tx).await.unwrap();

        let rpc = Arc::new(MockSolanaRpc::default());
        rpc.set_token_account("CustodyWallet111", USDC_MINT, "CustodyUsdcAta");
        rpc.add_transaction("sig-1", solana_usdc_deposit(USDC_MINT, "CustodyUsdcAta", 100_000_000));

        let verification = SolanaDepositVerifier::new(pool, rpc, config())
            .verify_notification("sig-1", tx.id)
            .await
            .unwrap();

        let Verification::Verified(msg) = verification else {
            panic!("expected a verified deposit, got {verification:?}");
        };
        // 100_000_000 raw units at 6 decimals.
        assert_eq!(msg.amount, dec!(100));
        assert_eq!(msg.address_from, "SenderWallet111");
    }

    #[tokio::test]
    async fn failed_transaction_is_rejected() {
        let pool = setup_test_db().await;
        let tx = TransactionBuilder::new()
            .blockchain(Blockchain::Solana)
            .build();
        transaction_repo::insert(&pool, &tx).await.unwrap();

        let rpc = Arc::new(MockSolanaRpc::default());
        rpc.set_token_account("CustodyWallet111", USDC_MINT, "CustodyUsdcAta");
        let mut deposit = solana_usdc_deposit(USDC_MINT, "CustodyUsdcAta", 100_000_000);
        deposit.succeeded = false;
        rpc.add_transaction("sig-1", deposit);

        let verification = SolanaDepositVerifier::new(pool, rpc, config())
            .verify_notification("sig-1", tx.id)
            .await
            .unwrap();

        assert_eq!(
            verification,
            Verification::Rejected(VerificationRejection::FailedOnChain)
        );
    }

    #[tokio::test]
    async fn delta_on_a_foreign_account_is_not_credited() {
        let pool = setup_test_db().await;
        let tx = TransactionBuilder::new()
            .blockchain(Blockchain::Solana)
            .build();
        transaction_repo::insert(&pool, &tx).await.unwrap();

        let rpc = Arc::new(MockSolanaRpc::default());
        rpc.set_token_account("CustodyWallet111", USDC_MINT, "CustodyUsdcAta");
        rpc.add_transaction("sig-1", solana_usdc_deposit(USDC_MINT, "SomeOtherAta", 100_000_000));

        let verification = SolanaDepositVerifier::new(pool, rpc, config())
            .verify_notification("sig-1", tx.id)
            .await
            .unwrap();

        assert_eq!(
            verification,
            Verification::Rejected(VerificationRejection::NoQualifyingTransfer)
        );
    }

    #[test]
    fn rpc_meta_nets_pre_and_post_balances() {
        let meta = RpcMeta {
            err: None,
            pre_balances: vec![5_000_000_000, 0],
            post_balances: vec![4_000_000_000, 1_000_000_000],
            pre_token_balances: vec![RpcTokenBalance {
                account_index: 1,
                mint: USDC_MINT.to_string(),
                owner: Some("CustodyWallet111".to_string()),
                ui_token_amount: RpcTokenAmount {
                    amount: "250000".to_string(),
                    decimals: 6,
                },
            }],
            post_token_balances: vec![RpcTokenBalance {
                account_index: 1,
                mint: USDC_MINT.to_string(),
                owner: Some("CustodyWallet111".to_string()),
                ui_token_amount: RpcTokenAmount {
                    amount: "1250000".to_string(),
                    decimals: 6,
                },
            }],
        };
        let keys = vec![
            RpcAccountKey::Raw("SenderWallet111".to_string()),
            RpcAccountKey::Parsed {
                pubkey: "CustodyUsdcAta".to_string(),
            },
        ];

        let deltas = token_deltas(&meta, &keys);

        let usdc = deltas.iter().find(|d| d.mint == USDC_MINT).unwrap();
        assert_eq!(usdc.raw_delta, 1_000_000);
        assert_eq!(usdc.token_account, "CustodyUsdcAta");

        let native_out = deltas
            .iter()
            .find(|d| d.mint == NATIVE_MINT && d.raw_delta < 0)
            .unwrap();
        assert_eq!(native_out.token_account, "SenderWallet111");
        assert_eq!(native_out.raw_delta, -1_000_000_000);
    }
}
