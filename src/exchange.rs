//! Treasury routing: which exchange deposit address a given corridor's
//! funds are forwarded to. A lookup table built once at startup from config.

use std::collections::HashMap;

use crate::model::{Blockchain, CryptoCurrency};

#[derive(Debug, Clone)]
pub struct ExchangeRoute {
    pub blockchain: Blockchain,
    pub crypto_currency: CryptoCurrency,
    pub address: String,
}

#[derive(Debug, Clone, Default)]
pub struct ExchangeProviderFactory {
    routes: HashMap<(Blockchain, CryptoCurrency), String>,
}

impl ExchangeProviderFactory {
    pub fn new(routes: Vec<ExchangeRoute>) -> Self {
        Self {
            routes: routes
                .into_iter()
                .map(|r| ((r.blockchain, r.crypto_currency), r.address))
                .collect(),
        }
    }

    pub fn exchange_address(
        &self,
        blockchain: Blockchain,
        crypto_currency: CryptoCurrency,
    ) -> Option<&str> {
        self.routes
            .get(&(blockchain, crypto_currency))
            .map(String::as_str)
    }
}
