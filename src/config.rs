use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use serde::Deserialize;
use sqlx::SqlitePool;
use tracing::Level;
use url::Url;
use uuid::Uuid;

use crate::deposit::solana::SolanaConfig;
use crate::deposit::stellar::StellarConfig;
use crate::exchange::ExchangeRoute;
use crate::flow::{FlowDefinition, StepSpec};
use crate::model::{Blockchain, Corridor, CryptoCurrency, FiatCurrency};
use crate::outbox::OutboxPolicy;
use crate::payment::bank_rail::BankRailConfig;
use crate::payment::qr_instant::QrInstantConfig;
use crate::wallet::CustodianConfig;

#[derive(Parser, Debug)]
pub struct Env {
    /// Path to plaintext TOML configuration file
    #[clap(long)]
    pub config: PathBuf,
    /// Path to TOML secrets file
    #[clap(long)]
    pub secrets: PathBuf,
}

/// Non-secret settings deserialized from the plaintext config TOML.
#[derive(Deserialize)]
struct Config {
    database_url: String,
    log_level: Option<LogLevel>,
    server_port: Option<u16>,
    quote_ttl_minutes: Option<i64>,
    expiry_sweep_interval_secs: Option<u64>,
    consumer_poll_interval_ms: Option<u64>,
    outbox: Option<OutboxConfig>,
    webhooks: Option<WebhookUrls>,
    stellar: StellarToml,
    solana: Option<SolanaToml>,
    #[serde(default)]
    exchange_routes: Vec<ExchangeRouteToml>,
    #[serde(default)]
    flows: Vec<FlowToml>,
}

#[derive(Deserialize)]
struct OutboxConfig {
    max_attempts: Option<i64>,
    base_delay_secs: Option<i64>,
    max_delay_secs: Option<i64>,
    poll_interval_secs: Option<u64>,
    report_interval_secs: Option<u64>,
}

#[derive(Deserialize)]
struct WebhookUrls {
    partner_url: Option<Url>,
    user_url: Option<Url>,
}

#[derive(Deserialize)]
struct StellarToml {
    horizon_url: Url,
    deposit_wallet: String,
    usdc_issuer: String,
    poll_interval_secs: Option<u64>,
    reconcile_lookback: Option<i64>,
    reconcile_interval_secs: Option<u64>,
}

#[derive(Deserialize)]
struct SolanaToml {
    rpc_url: Url,
    deposit_wallet: String,
    usdc_mint: String,
}

#[derive(Deserialize)]
struct ExchangeRouteToml {
    blockchain: Blockchain,
    crypto_currency: CryptoCurrency,
    address: String,
}

#[derive(Deserialize)]
struct FlowToml {
    blockchain: Blockchain,
    crypto_currency: CryptoCurrency,
    target_currency: FiatCurrency,
    #[serde(default)]
    fee_bps: i64,
    #[serde(default = "default_true")]
    enabled: bool,
    steps: Vec<StepSpec>,
}

fn default_true() -> bool {
    true
}

/// Secret credentials deserialized from the secrets TOML.
#[derive(Deserialize)]
struct Secrets {
    custodian: CustodianSecrets,
    #[serde(default)]
    payment: Vec<PaymentSecrets>,
    slack_webhook_url: Option<Url>,
}

#[derive(Deserialize)]
struct CustodianSecrets {
    base_url: Url,
    api_key: String,
}

/// Provider type tag and credentials, one `[[payment]]` block per rail.
#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
enum PaymentSecrets {
    QrInstant {
        base_url: Url,
        api_key: String,
        #[serde(default = "default_true")]
        enabled: bool,
    },
    BankRail {
        base_url: Url,
        api_key: String,
        #[serde(default = "default_true")]
        enabled: bool,
    },
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<&LogLevel> for Level {
    fn from(log_level: &LogLevel) -> Self {
        match log_level {
            LogLevel::Trace => Self::TRACE,
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Info => Self::INFO,
            LogLevel::Warn => Self::WARN,
            LogLevel::Error => Self::ERROR,
        }
    }
}

// ===== Runtime types (assembled from Config + Secrets) =====

/// Combined runtime context for the server.
pub struct Ctx {
    pub database_url: String,
    pub log_level: LogLevel,
    pub server_port: u16,
    pub quote_ttl_minutes: i64,
    pub expiry_sweep_interval: Duration,
    pub consumer_poll_interval: Duration,
    pub outbox_policy: OutboxPolicy,
    pub outbox_poll_interval: Duration,
    pub outbox_report_interval: Duration,
    pub partner_webhook_url: Option<Url>,
    pub user_webhook_url: Option<Url>,
    pub slack_webhook_url: Option<Url>,
    pub stellar: StellarCtx,
    pub solana: Option<SolanaConfig>,
    pub custodian: CustodianConfig,
    pub payments: Vec<PaymentProviderCtx>,
    pub exchange_routes: Vec<ExchangeRoute>,
    pub flows: Vec<FlowDefinition>,
}

pub struct StellarCtx {
    pub config: StellarConfig,
    pub poll_interval: Duration,
    pub reconcile_lookback: i64,
    pub reconcile_interval: Duration,
}

/// Runtime payout-provider configuration assembled from `PaymentSecrets`.
pub enum PaymentProviderCtx {
    QrInstant(QrInstantConfig),
    BankRail(BankRailConfig),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file")]
    Io(#[from] std::io::Error),
    #[error("failed to parse TOML")]
    Toml(#[from] toml::de::Error),
}

impl Ctx {
    pub fn load(env: &Env) -> Result<Self, ConfigError> {
        Self::from_files(&env.config, &env.secrets)
    }

    pub fn from_files(config_path: &Path, secrets_path: &Path) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(&std::fs::read_to_string(config_path)?)?;
        let secrets: Secrets = toml::from_str(&std::fs::read_to_string(secrets_path)?)?;
        Ok(Self::assemble(config, secrets))
    }

    fn assemble(config: Config, secrets: Secrets) -> Self {
        let outbox = config.outbox.unwrap_or(OutboxConfig {
            max_attempts: None,
            base_delay_secs: None,
            max_delay_secs: None,
            poll_interval_secs: None,
            report_interval_secs: None,
        });
        let default_policy = OutboxPolicy::default();
        let webhooks = config.webhooks.unwrap_or(WebhookUrls {
            partner_url: None,
            user_url: None,
        });

        let payments = secrets
            .payment
            .into_iter()
            .map(|provider| match provider {
                PaymentSecrets::QrInstant {
                    base_url,
                    api_key,
                    enabled,
                } => PaymentProviderCtx::QrInstant(QrInstantConfig {
                    base_url,
                    api_key,
                    enabled,
                }),
                PaymentSecrets::BankRail {
                    base_url,
                    api_key,
                    enabled,
                } => PaymentProviderCtx::BankRail(BankRailConfig {
                    base_url,
                    api_key,
                    enabled,
                }),
            })
            .collect();

        let flows = config
            .flows
            .into_iter()
            .map(|flow| FlowDefinition {
                id: Uuid::new_v4(),
                corridor: Corridor {
                    blockchain: flow.blockchain,
                    crypto_currency: flow.crypto_currency,
                    target_currency: flow.target_currency,
                },
                fee_bps: flow.fee_bps,
                enabled: flow.enabled,
                steps: flow.steps,
            })
            .collect();

        Self {
            database_url: config.database_url,
            log_level: config.log_level.unwrap_or(LogLevel::Info),
            server_port: config.server_port.unwrap_or(8080),
            quote_ttl_minutes: config.quote_ttl_minutes.unwrap_or(60),
            expiry_sweep_interval: Duration::from_secs(
                config.expiry_sweep_interval_secs.unwrap_or(60),
            ),
            consumer_poll_interval: Duration::from_millis(
                config.consumer_poll_interval_ms.unwrap_or(500),
            ),
            outbox_policy: OutboxPolicy {
                max_attempts: outbox.max_attempts.unwrap_or(default_policy.max_attempts),
                base_delay_secs: outbox
                    .base_delay_secs
                    .unwrap_or(default_policy.base_delay_secs),
                max_delay_secs: outbox
                    .max_delay_secs
                    .unwrap_or(default_policy.max_delay_secs),
            },
            outbox_poll_interval: Duration::from_secs(outbox.poll_interval_secs.unwrap_or(10)),
            outbox_report_interval: Duration::from_secs(
                outbox.report_interval_secs.unwrap_or(300),
            ),
            partner_webhook_url: webhooks.partner_url,
            user_webhook_url: webhooks.user_url,
            slack_webhook_url: secrets.slack_webhook_url,
            stellar: StellarCtx {
                config: StellarConfig {
                    horizon_url: config.stellar.horizon_url,
                    deposit_wallet: config.stellar.deposit_wallet,
                    usdc_issuer: config.stellar.usdc_issuer,
                },
                poll_interval: Duration::from_secs(
                    config.stellar.poll_interval_secs.unwrap_or(5),
                ),
                reconcile_lookback: config.stellar.reconcile_lookback.unwrap_or(200_000),
                reconcile_interval: Duration::from_secs(
                    config.stellar.reconcile_interval_secs.unwrap_or(300),
                ),
            },
            solana: config.solana.map(|solana| SolanaConfig {
                rpc_url: solana.rpc_url,
                deposit_wallet: solana.deposit_wallet,
                usdc_mint: solana.usdc_mint,
            }),
            custodian: CustodianConfig {
                base_url: secrets.custodian.base_url,
                api_key: secrets.custodian.api_key,
            },
            payments,
            exchange_routes: config
                .exchange_routes
                .into_iter()
                .map(|route| ExchangeRoute {
                    blockchain: route.blockchain,
                    crypto_currency: route.crypto_currency,
                    address: route.address,
                })
                .collect(),
            flows,
        }
    }

    pub async fn get_sqlite_pool(&self) -> Result<SqlitePool, sqlx::Error> {
        let pool = SqlitePool::connect(&self.database_url).await?;

        // WAL allows concurrent readers with the single writer; the busy
        // timeout keeps short write bursts from surfacing as
        // "database is locked".
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&pool)
            .await?;
        sqlx::query("PRAGMA busy_timeout = 10000")
            .execute(&pool)
            .await?;

        Ok(pool)
    }
}
