//! Configuration module for booking-service.

use secrecy::Secret;
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct BookingConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub razorpay: RazorpayConfig,
    pub kyc: KycConfig,
    pub payments: PaymentPolicy,
    pub settings_cache_ttl: Duration,
    pub completion_sweep_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    /// How long a transaction waits on a row lock before giving up.
    pub lock_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct RazorpayConfig {
    pub key_id: String,
    pub key_secret: Secret<String>,
    pub webhook_secret: Secret<String>,
    pub api_base_url: String,
    pub timeout: Duration,
    pub max_retries: u32,
}

#[derive(Debug, Clone)]
pub struct KycConfig {
    /// Identity service base URL. Unset means every advertiser is checked
    /// against the in-process directory.
    pub service_url: Option<String>,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct PaymentPolicy {
    /// Reject webhooks that carry no signature header.
    pub webhook_require_signature: bool,
}

fn parse_env<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl BookingConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;

        Ok(Self {
            common,
            service_name: env::var("SERVICE_NAME")
                .unwrap_or_else(|_| "booking-service".to_string()),
            service_version: env::var("SERVICE_VERSION")
                .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok(),
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").map_err(|_| {
                    AppError::ConfigError(anyhow::anyhow!("DATABASE_URL is required"))
                })?,
                max_connections: parse_env("DATABASE_MAX_CONNECTIONS", 10),
                min_connections: parse_env("DATABASE_MIN_CONNECTIONS", 2),
                lock_timeout: Duration::from_millis(parse_env("DATABASE_LOCK_TIMEOUT_MS", 5_000)),
            },
            razorpay: RazorpayConfig {
                key_id: env::var("RAZORPAY_KEY_ID").unwrap_or_default(),
                key_secret: Secret::new(env::var("RAZORPAY_KEY_SECRET").unwrap_or_default()),
                webhook_secret: Secret::new(
                    env::var("RAZORPAY_WEBHOOK_SECRET").unwrap_or_default(),
                ),
                api_base_url: env::var("RAZORPAY_API_BASE_URL")
                    .unwrap_or_else(|_| "https://api.razorpay.com/v1".to_string()),
                timeout: Duration::from_millis(parse_env("GATEWAY_TIMEOUT_MS", 10_000)),
                max_retries: parse_env("GATEWAY_MAX_RETRIES", 2),
            },
            kyc: KycConfig {
                service_url: env::var("KYC_SERVICE_URL").ok(),
                timeout: Duration::from_millis(parse_env("KYC_TIMEOUT_MS", 3_000)),
            },
            payments: PaymentPolicy {
                webhook_require_signature: parse_env("WEBHOOK_REQUIRE_SIGNATURE", false),
            },
            settings_cache_ttl: Duration::from_secs(parse_env("SETTINGS_CACHE_TTL_SECS", 60)),
            completion_sweep_interval: Duration::from_secs(parse_env(
                "COMPLETION_SWEEP_INTERVAL_SECS",
                3_600,
            )),
        })
    }
}
