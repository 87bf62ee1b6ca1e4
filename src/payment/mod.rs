//! Fiat payout providers behind a common trait. Concrete protocol quirks
//! live in each implementation; the workflow only sees dispatch results and
//! the mapped status classes.

pub mod bank_rail;
pub mod mock;
pub mod qr_instant;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::error::PaymentError;
use crate::model::PaymentMethod;

/// Result of a dispatch attempt. `external_id` is the provider's reference,
/// used to correlate later asynchronous status callbacks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentDispatch {
    pub success: bool,
    pub external_id: Option<String>,
}

/// Internal classification of a provider's raw status string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentStatusClass {
    /// Still settling; processing-equivalent updates are no-ops.
    Processing,
    Completed,
    Failed,
}

#[async_trait]
pub trait PaymentService: Send + Sync {
    fn method(&self) -> PaymentMethod;

    /// Whether confirmation arrives later through a provider callback
    /// instead of inline in the dispatch response.
    fn is_async(&self) -> bool;

    /// Kill switch; disabled providers fail the payout instead of
    /// dispatching.
    fn is_enabled(&self) -> bool;

    async fn send_payment(
        &self,
        account: &str,
        value: Decimal,
        qr_code: Option<&str>,
    ) -> Result<PaymentDispatch, PaymentError>;

    /// Maps the provider's raw status vocabulary onto the internal classes.
    fn map_status(&self, raw_status: &str) -> PaymentStatusClass;
}

/// Capability-keyed lookup built once at startup.
pub struct PaymentRegistry {
    services: HashMap<PaymentMethod, Arc<dyn PaymentService>>,
}

impl PaymentRegistry {
    pub fn new(services: Vec<Arc<dyn PaymentService>>) -> Self {
        Self {
            services: services.into_iter().map(|s| (s.method(), s)).collect(),
        }
    }

    pub fn get(&self, method: PaymentMethod) -> Option<&Arc<dyn PaymentService>> {
        self.services.get(&method)
    }
}
