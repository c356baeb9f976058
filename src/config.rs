//! Configuration management for meetpay
//!
//! Configuration is loaded from a TOML file; every section falls back to
//! defaults so an empty file is a valid configuration.
//!
//! # Example Configuration File
//!
//! ```toml
//! [server]
//! bind_address = "0.0.0.0:8080"
//! enable_cors = true
//!
//! [database]
//! url = "sqlite:/var/lib/meetpay/meetpay.db"
//!
//! [pricing]
//! small_fee = 20000
//! large_fee = 50000
//! threshold = 200000
//!
//! [settlement]
//! poll_interval_secs = 2
//! poll_deadline_secs = 90
//!
//! [push_payment]
//! base_url = "https://card-api.example.com"
//! email = "merchant@example.com"
//! password = "secret"
//! ```

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Platform fee tiers and provider payout
    #[serde(default)]
    pub pricing: PricingConfig,

    /// Settlement flow timing
    #[serde(default)]
    pub settlement: SettlementConfig,

    /// Referral commission and signup bonuses
    #[serde(default)]
    pub referral: ReferralConfig,

    /// Mobile-money push payment rail
    #[serde(default)]
    pub push_payment: PushPaymentConfig,

    /// On-chain deposit rail
    #[serde(default)]
    pub onchain: OnChainConfig,

    /// Inbound webhook verification
    #[serde(default)]
    pub webhooks: WebhookConfig,

    /// Withdrawal limits
    #[serde(default)]
    pub withdrawal: WithdrawalConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address for the HTTP API
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Enable permissive CORS
    #[serde(default = "default_true")]
    pub enable_cors: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            enable_cors: true,
        }
    }
}

fn default_bind_address() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_true() -> bool {
    true
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Database URL; relative to `data_dir` when not absolute
    #[serde(default = "default_database_url")]
    pub url: String,

    /// Directory holding file-based databases
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            data_dir: default_data_dir(),
        }
    }
}

fn default_database_url() -> String {
    "sqlite:meetpay.db".to_string()
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("meetpay"))
        .unwrap_or_else(|| PathBuf::from("./data"))
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default log level when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format: pretty, compact or json
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

/// Platform fee tiers, all amounts in minor units
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingConfig {
    /// Fee charged when the base price is at or below the threshold
    #[serde(default = "default_small_fee")]
    pub small_fee: i64,

    /// Fee charged above the threshold
    #[serde(default = "default_large_fee")]
    pub large_fee: i64,

    /// Base price threshold between the two tiers
    #[serde(default = "default_threshold")]
    pub threshold: i64,

    /// Provider payout as basis points of their base price
    #[serde(default = "default_provider_payout_bps")]
    pub provider_payout_bps: i64,

    /// Largest base or client price accepted, in minor units
    #[serde(default = "default_max_amount")]
    pub max_amount: i64,

    /// Settlement currency
    #[serde(default = "default_currency")]
    pub currency: String,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            small_fee: default_small_fee(),
            large_fee: default_large_fee(),
            threshold: default_threshold(),
            provider_payout_bps: default_provider_payout_bps(),
            max_amount: default_max_amount(),
            currency: default_currency(),
        }
    }
}

fn default_small_fee() -> i64 {
    20_000
}

fn default_large_fee() -> i64 {
    50_000
}

fn default_threshold() -> i64 {
    200_000
}

fn default_provider_payout_bps() -> i64 {
    9_500
}

fn default_max_amount() -> i64 {
    100_000_000
}

fn default_currency() -> String {
    "KES".to_string()
}

/// Settlement flow timing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementConfig {
    /// Interval between payment status polls in the push flow
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// How long the push flow waits for a confirmation
    #[serde(default = "default_poll_deadline_secs")]
    pub poll_deadline_secs: u64,

    /// Lifetime of a PENDING interaction request
    #[serde(default = "default_request_expiry_minutes")]
    pub request_expiry_minutes: i64,

    /// Chat session length when the requester does not pick one
    #[serde(default = "default_duration_minutes")]
    pub default_duration_minutes: i64,

    /// How long an on-chain deposit may stay unconfirmed before the sweep
    /// expires it
    #[serde(default = "default_onchain_expiry_minutes")]
    pub onchain_expiry_minutes: i64,

    /// Interval of the stale-payment sweep; 0 runs it at startup only
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Public base URL used to build webhook callback URLs
    #[serde(default)]
    pub public_base_url: Option<String>,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            poll_deadline_secs: default_poll_deadline_secs(),
            request_expiry_minutes: default_request_expiry_minutes(),
            default_duration_minutes: default_duration_minutes(),
            onchain_expiry_minutes: default_onchain_expiry_minutes(),
            sweep_interval_secs: default_sweep_interval_secs(),
            public_base_url: None,
        }
    }
}

fn default_poll_interval_secs() -> u64 {
    2
}

fn default_poll_deadline_secs() -> u64 {
    90
}

fn default_request_expiry_minutes() -> i64 {
    30
}

fn default_duration_minutes() -> i64 {
    24 * 60
}

fn default_onchain_expiry_minutes() -> i64 {
    60
}

fn default_sweep_interval_secs() -> u64 {
    60
}

/// Referral commission and signup bonuses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferralConfig {
    /// Commission paid to the referrer, in basis points of the settled amount
    #[serde(default = "default_commission_bps")]
    pub commission_bps: i64,

    /// Number of commission-eligible transactions per referral
    #[serde(default = "default_max_transactions")]
    pub max_transactions: i64,

    /// Bonus credited to the referrer when a provider signs up
    #[serde(default = "default_referrer_bonus")]
    pub referrer_bonus: i64,

    /// Bonus credited to a provider who signs up with a referral
    #[serde(default = "default_referred_bonus")]
    pub referred_bonus: i64,
}

impl Default for ReferralConfig {
    fn default() -> Self {
        Self {
            commission_bps: default_commission_bps(),
            max_transactions: default_max_transactions(),
            referrer_bonus: default_referrer_bonus(),
            referred_bonus: default_referred_bonus(),
        }
    }
}

fn default_commission_bps() -> i64 {
    500
}

fn default_max_transactions() -> i64 {
    2
}

fn default_referrer_bonus() -> i64 {
    10_000
}

fn default_referred_bonus() -> i64 {
    20_000
}

/// Mobile-money push payment rail
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushPaymentConfig {
    /// Provider API base URL
    #[serde(default = "default_push_base_url")]
    pub base_url: String,

    /// Merchant login email
    #[serde(default)]
    pub email: String,

    /// Merchant login password
    #[serde(default)]
    pub password: String,

    /// How long a login token is reused
    #[serde(default = "default_token_ttl_secs")]
    pub token_ttl_secs: u64,

    /// Per-request timeout
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for PushPaymentConfig {
    fn default() -> Self {
        Self {
            base_url: default_push_base_url(),
            email: String::new(),
            password: String::new(),
            token_ttl_secs: default_token_ttl_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

fn default_push_base_url() -> String {
    "https://card-api.theliberec.com".to_string()
}

fn default_token_ttl_secs() -> u64 {
    3600
}

fn default_request_timeout_secs() -> u64 {
    30
}

/// On-chain deposit rail
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OnChainConfig {
    /// Provider API base URL
    #[serde(default = "default_onchain_base_url")]
    pub base_url: String,

    /// Merchant login email
    #[serde(default)]
    pub email: String,

    /// Merchant login password
    #[serde(default)]
    pub password: String,

    /// Settlement asset symbol
    #[serde(default = "default_asset")]
    pub asset: String,

    /// How long a login token is reused
    #[serde(default = "default_token_ttl_secs")]
    pub token_ttl_secs: u64,

    /// Per-request timeout
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for OnChainConfig {
    fn default() -> Self {
        Self {
            base_url: default_onchain_base_url(),
            email: String::new(),
            password: String::new(),
            asset: default_asset(),
            token_ttl_secs: default_token_ttl_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

fn default_onchain_base_url() -> String {
    "https://api.swapuzi.com".to_string()
}

fn default_asset() -> String {
    "USDT".to_string()
}

/// Inbound webhook verification
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// Shared secret for the generic webhook signature; unchecked when unset
    #[serde(default)]
    pub generic_secret: Option<String>,
}

/// Withdrawal limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WithdrawalConfig {
    /// Smallest withdrawal accepted, in minor units
    #[serde(default = "default_min_withdrawal")]
    pub min_amount: i64,
}

impl Default for WithdrawalConfig {
    fn default() -> Self {
        Self {
            min_amount: default_min_withdrawal(),
        }
    }
}

fn default_min_withdrawal() -> i64 {
    10_000
}

impl Config {
    /// Get the API bind address
    pub fn api_bind_address(&self) -> String {
        self.server.bind_address.clone()
    }

    /// Resolve the database URL, placing relative file paths under `data_dir`
    pub fn resolve_database_url(&self) -> String {
        let url = &self.database.url;
        let path = url.strip_prefix("sqlite:").unwrap_or(url);
        if path == ":memory:" || PathBuf::from(path).is_absolute() {
            return format!("sqlite:{}", path);
        }
        format!("sqlite:{}", self.database.data_dir.join(path).display())
    }

    /// Callback URL for a webhook route, if a public base URL is configured
    pub fn callback_url(&self, route: &str) -> Option<String> {
        self.settlement
            .public_base_url
            .as_ref()
            .map(|base| format!("{}/v1/webhooks/{}", base.trim_end_matches('/'), route))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        let pricing = &self.pricing;
        if pricing.small_fee < 0 || pricing.large_fee < 0 {
            return Err("Platform fees cannot be negative".to_string());
        }
        if pricing.small_fee > pricing.large_fee {
            return Err("Small fee must not exceed large fee".to_string());
        }
        if pricing.threshold <= 0 {
            return Err("Pricing threshold must be positive".to_string());
        }
        if !(0..=10_000).contains(&pricing.provider_payout_bps) {
            return Err("Provider payout cannot exceed 100% (10,000 bps)".to_string());
        }
        if pricing.max_amount <= 0 {
            return Err("Pricing max_amount must be positive".to_string());
        }

        if !(0..=10_000).contains(&self.referral.commission_bps) {
            return Err("Referral commission cannot exceed 100% (10,000 bps)".to_string());
        }
        if self.referral.max_transactions < 0 {
            return Err("Referral max_transactions cannot be negative".to_string());
        }

        let settlement = &self.settlement;
        if settlement.poll_interval_secs == 0 {
            return Err("Poll interval cannot be 0".to_string());
        }
        if settlement.poll_deadline_secs < settlement.poll_interval_secs {
            return Err("Poll deadline must be at least one poll interval".to_string());
        }
        if settlement.request_expiry_minutes <= 0 || settlement.default_duration_minutes <= 0 {
            return Err("Request expiry and default duration must be positive".to_string());
        }
        if settlement.onchain_expiry_minutes <= 0 {
            return Err("On-chain expiry must be positive".to_string());
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            return Err(format!(
                "Invalid log format: {}. Must be one of: {:?}",
                self.logging.format, valid_formats
            ));
        }

        if self.withdrawal.min_amount <= 0 {
            return Err("Minimum withdrawal must be positive".to_string());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.pricing.small_fee, 20_000);
        assert_eq!(config.settlement.poll_deadline_secs, 90);
        assert_eq!(config.referral.max_transactions, 2);
    }

    #[test]
    fn test_validate_config() {
        let mut config = Config::default();

        config.pricing.small_fee = 60_000;
        assert!(config.validate().is_err());

        config.pricing.small_fee = 20_000;
        config.referral.commission_bps = 20_000;
        assert!(config.validate().is_err());

        config.referral.commission_bps = 500;
        config.settlement.poll_deadline_secs = 1;
        assert!(config.validate().is_err());

        config.settlement.poll_deadline_secs = 90;
        config.logging.format = "xml".to_string();
        assert!(config.validate().is_err());

        config.logging.format = "json".to_string();
        config.pricing.max_amount = 0;
        assert!(config.validate().is_err());

        config.pricing.max_amount = 100_000_000;
        config.settlement.onchain_expiry_minutes = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [pricing]
            small_fee = 10000

            [webhooks]
            generic_secret = "s3cret"
            "#,
        )
        .unwrap();
        assert_eq!(config.pricing.small_fee, 10_000);
        assert_eq!(config.pricing.large_fee, 50_000);
        assert_eq!(config.webhooks.generic_secret.as_deref(), Some("s3cret"));
        assert_eq!(config.server.bind_address, "127.0.0.1:8080");
    }

    #[test]
    fn test_resolve_database_url() {
        let mut config = Config::default();
        config.database.url = "sqlite::memory:".to_string();
        assert_eq!(config.resolve_database_url(), "sqlite::memory:");

        config.database.url = "sqlite:/tmp/x.db".to_string();
        assert_eq!(config.resolve_database_url(), "sqlite:/tmp/x.db");

        config.database.url = "meetpay.db".to_string();
        config.database.data_dir = PathBuf::from("/var/lib/meetpay");
        assert_eq!(
            config.resolve_database_url(),
            "sqlite:/var/lib/meetpay/meetpay.db"
        );
    }

    #[test]
    fn test_callback_url() {
        let mut config = Config::default();
        assert!(config.callback_url("push").is_none());
        config.settlement.public_base_url = Some("https://api.example.com/".to_string());
        assert_eq!(
            config.callback_url("push").as_deref(),
            Some("https://api.example.com/v1/webhooks/push")
        );
    }
}
