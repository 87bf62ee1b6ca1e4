//! Asynchronous bank-transfer rail: dispatch only enqueues the payout with
//! the provider; settlement arrives later through a status callback
//! correlated by the returned transfer id.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;
use url::Url;

use crate::error::PaymentError;
use crate::model::PaymentMethod;

use super::{PaymentDispatch, PaymentService, PaymentStatusClass};

#[derive(Debug, Clone)]
pub struct BankRailConfig {
    pub base_url: Url,
    pub api_key: String,
    pub enabled: bool,
}

pub struct BankRailService {
    client: reqwest::Client,
    config: BankRailConfig,
}

#[derive(Debug, Deserialize)]
struct TransferResponse {
    accepted: bool,
    transfer_id: Option<String>,
}

impl BankRailService {
    pub fn new(client: reqwest::Client, config: BankRailConfig) -> Self {
        Self { client, config }
    }
}

#[async_trait]
impl PaymentService for BankRailService {
    fn method(&self) -> PaymentMethod {
        PaymentMethod::BankRail
    }

    fn is_async(&self) -> bool {
        true
    }

    fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    async fn send_payment(
        &self,
        account: &str,
        value: Decimal,
        _qr_code: Option<&str>,
    ) -> Result<PaymentDispatch, PaymentError> {
        let url = self
            .config
            .base_url
            .join("transfers")
            .map_err(|e| PaymentError::Provider(format!("invalid base url: {e}")))?;

        let response = self
            .client
            .post(url)
            .bearer_auth(&self.config.api_key)
            .json(&serde_json::json!({
                "destination_account": account,
                "amount": value.to_string(),
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(PaymentError::Provider(format!(
                "transfer returned status {}",
                response.status()
            )));
        }

        let body: TransferResponse = response.json().await?;

        Ok(PaymentDispatch {
            success: body.accepted,
            external_id: body.transfer_id,
        })
    }

    fn map_status(&self, raw_status: &str) -> PaymentStatusClass {
        match raw_status {
            "settled" | "executed" => PaymentStatusClass::Completed,
            "returned" | "rejected" | "cancelled" => PaymentStatusClass::Failed,
            _ => PaymentStatusClass::Processing,
        }
    }
}
