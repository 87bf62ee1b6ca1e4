//! Core domain types shared across the crate: corridor enums, transaction
//! statuses, and the Transaction aggregate itself.

use std::fmt::{self, Display};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Raised when a stored or inbound string does not name a known enum variant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {kind}: {value}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

/// Implements the storage-form string round trip for a unit enum.
#[macro_export]
macro_rules! string_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl ::std::fmt::Display for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl ::std::str::FromStr for $name {
            type Err = $crate::model::ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err($crate::model::ParseEnumError {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

/// Blockchains deposits are accepted on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Blockchain {
    Stellar,
    Solana,
}

string_enum!(Blockchain, "blockchain", {
    Stellar => "stellar",
    Solana => "solana",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CryptoCurrency {
    Usdc,
    Xlm,
    Sol,
}

string_enum!(CryptoCurrency, "crypto currency", {
    Usdc => "usdc",
    Xlm => "xlm",
    Sol => "sol",
});

/// Fiat currencies payouts are disbursed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FiatCurrency {
    Bob,
    Brl,
    Ars,
}

string_enum!(FiatCurrency, "fiat currency", {
    Bob => "bob",
    Brl => "brl",
    Ars => "ars",
});

/// Local payout rails a transaction can be disbursed through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PaymentMethod {
    QrInstant,
    BankRail,
}

string_enum!(PaymentMethod, "payment method", {
    QrInstant => "qr-instant",
    BankRail => "bank-rail",
});

/// A (blockchain, crypto currency, fiat currency) route served by the
/// platform. Flow definitions are looked up by corridor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Corridor {
    pub blockchain: Blockchain,
    pub crypto_currency: CryptoCurrency,
    pub target_currency: FiatCurrency,
}

impl Display for Corridor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.blockchain, self.crypto_currency, self.target_currency
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    AwaitingPayment,
    ProcessingPayment,
    WrongAmount,
    PaymentFailed,
    PaymentCompleted,
    PaymentExpired,
}

string_enum!(TransactionStatus, "transaction status", {
    AwaitingPayment => "AWAITING_PAYMENT",
    ProcessingPayment => "PROCESSING_PAYMENT",
    WrongAmount => "WRONG_AMOUNT",
    PaymentFailed => "PAYMENT_FAILED",
    PaymentCompleted => "PAYMENT_COMPLETED",
    PaymentExpired => "PAYMENT_EXPIRED",
});

/// The payment aggregate. Created at quote acceptance, mutated only through
/// the conditional transitions in [`crate::transaction`].
#[derive(Debug, Clone, PartialEq)]
pub struct Transaction {
    pub id: Uuid,
    pub status: TransactionStatus,
    pub blockchain: Blockchain,
    pub crypto_currency: CryptoCurrency,
    pub target_currency: FiatCurrency,
    /// Quoted deposit amount in `crypto_currency`.
    pub source_amount: Decimal,
    /// Quoted payout value in `target_currency`.
    pub target_amount: Decimal,
    /// Custody wallet the user was quoted to deposit into.
    pub deposit_address: String,
    pub recipient_account: String,
    pub payment_method: PaymentMethod,
    pub qr_code: Option<String>,
    pub on_chain_id: Option<String>,
    pub address_from: Option<String>,
    pub refund_on_chain_id: Option<String>,
    /// Payout-provider reference, set once a dispatch is accepted.
    pub external_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Transaction {
    pub fn corridor(&self) -> Corridor {
        Corridor {
            blockchain: self.blockchain,
            crypto_currency: self.crypto_currency,
            target_currency: self.target_currency,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            TransactionStatus::PaymentCompleted | TransactionStatus::PaymentFailed
        ) || (self.status == TransactionStatus::PaymentExpired
            && self.refund_on_chain_id.is_some())
    }
}
