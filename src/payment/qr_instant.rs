//! Synchronous QR payout rail: the dispatch response itself confirms or
//! rejects the payment.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;
use url::Url;

use crate::error::PaymentError;
use crate::model::PaymentMethod;

use super::{PaymentDispatch, PaymentService, PaymentStatusClass};

#[derive(Debug, Clone)]
pub struct QrInstantConfig {
    pub base_url: Url,
    pub api_key: String,
    pub enabled: bool,
}

pub struct QrInstantService {
    client: reqwest::Client,
    config: QrInstantConfig,
}

#[derive(Debug, Deserialize)]
struct DispatchResponse {
    status: String,
    payment_id: Option<String>,
}

impl QrInstantService {
    pub fn new(client: reqwest::Client, config: QrInstantConfig) -> Self {
        Self { client, config }
    }
}

#[async_trait]
impl PaymentService for QrInstantService {
    fn method(&self) -> PaymentMethod {
        PaymentMethod::QrInstant
    }

    fn is_async(&self) -> bool {
        false
    }

    fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    async fn send_payment(
        &self,
        account: &str,
        value: Decimal,
        qr_code: Option<&str>,
    ) -> Result<PaymentDispatch, PaymentError> {
        let url = self
            .config
            .base_url
            .join("payments")
            .map_err(|e| PaymentError::Provider(format!("invalid base url: {e}")))?;

        let response = self
            .client
            .post(url)
            .bearer_auth(&self.config.api_key)
            .json(&serde_json::json!({
                "account": account,
                "amount": value.to_string(),
                "qr_code": qr_code,
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(PaymentError::Provider(format!(
                "dispatch returned status {}",
                response.status()
            )));
        }

        let body: DispatchResponse = response.json().await?;

        Ok(PaymentDispatch {
            success: self.map_status(&body.status) == PaymentStatusClass::Completed,
            external_id: body.payment_id,
        })
    }

    fn map_status(&self, raw_status: &str) -> PaymentStatusClass {
        match raw_status {
            "paid" | "confirmed" => PaymentStatusClass::Completed,
            "rejected" | "expired" | "error" => PaymentStatusClass::Failed,
            _ => PaymentStatusClass::Processing,
        }
    }
}
