//! Configurable in-memory payment service for tests and dry runs.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::error::PaymentError;
use crate::model::PaymentMethod;

use super::{PaymentDispatch, PaymentService, PaymentStatusClass};

#[derive(Debug, Clone)]
pub struct MockPaymentConfig {
    pub method: PaymentMethod,
    pub is_async: bool,
    pub enabled: bool,
    /// Dispatch result returned by `send_payment`.
    pub succeed: bool,
    pub external_id: Option<String>,
}

impl Default for MockPaymentConfig {
    fn default() -> Self {
        Self {
            method: PaymentMethod::QrInstant,
            is_async: false,
            enabled: true,
            succeed: true,
            external_id: Some("mock-ext-1".to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SentPayment {
    pub account: String,
    pub value: Decimal,
    pub qr_code: Option<String>,
}

pub struct MockPaymentService {
    config: MockPaymentConfig,
    dispatched: Mutex<Vec<SentPayment>>,
    calls: AtomicUsize,
}

impl MockPaymentService {
    pub fn new(config: MockPaymentConfig) -> Self {
        Self {
            config,
            dispatched: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn dispatched(&self) -> Vec<SentPayment> {
        self.dispatched.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PaymentService for MockPaymentService {
    fn method(&self) -> PaymentMethod {
        self.config.method
    }

    fn is_async(&self) -> bool {
        self.config.is_async
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
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.dispatched.lock().unwrap().push(SentPayment {
            account: account.to_string(),
            value,
            qr_code: qr_code.map(str::to_string),
        });

        Ok(PaymentDispatch {
            success: self.config.succeed,
            external_id: self.config.external_id.clone(),
        })
    }

    fn map_status(&self, raw_status: &str) -> PaymentStatusClass {
        match raw_status {
            "settled" | "completed" => PaymentStatusClass::Completed,
            "returned" | "rejected" | "failed" => PaymentStatusClass::Failed,
            _ => PaymentStatusClass::Processing,
        }
    }
}
