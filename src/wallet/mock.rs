//! Recording wallet handler for tests.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::error::WalletError;
use crate::model::{Blockchain, CryptoCurrency};

use super::{WalletHandler, WalletTransfer};

#[derive(Debug, Clone, PartialEq)]
pub struct SentTransfer {
    pub address: String,
    pub amount: Decimal,
    pub crypto_currency: CryptoCurrency,
}

pub struct MockWalletHandler {
    blockchain: Blockchain,
    transfers: Mutex<Vec<SentTransfer>>,
    counter: AtomicUsize,
    sender_address: Mutex<Option<String>>,
}

impl MockWalletHandler {
    pub fn new(blockchain: Blockchain) -> Self {
        Self {
            blockchain,
            transfers: Mutex::new(Vec::new()),
            counter: AtomicUsize::new(0),
            sender_address: Mutex::new(Some("mock-sender-address".to_string())),
        }
    }

    pub fn transfers(&self) -> Vec<SentTransfer> {
        self.transfers.lock().unwrap().clone()
    }

    pub fn set_sender_address(&self, address: Option<&str>) {
        *self.sender_address.lock().unwrap() = address.map(str::to_string);
    }
}

#[async_trait]
impl WalletHandler for MockWalletHandler {
    fn blockchain(&self) -> Blockchain {
        self.blockchain
    }

    async fn send(
        &self,
        address: &str,
        amount: Decimal,
        crypto_currency: CryptoCurrency,
    ) -> Result<WalletTransfer, WalletError> {
        self.transfers.lock().unwrap().push(SentTransfer {
            address: address.to_string(),
            amount,
            crypto_currency,
        });

        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        Ok(WalletTransfer {
            success: true,
            transaction_id: Some(format!("mock-refund-{n}")),
        })
    }

    async fn address_from_transaction(&self, on_chain_id: &str) -> Result<String, WalletError> {
        self.sender_address
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| WalletError::TransactionNotFound(on_chain_id.to_string()))
    }
}
