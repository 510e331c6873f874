use dotenv::dotenv;
use rabbitmq::{BrokerEndpoint, DEFAULT_URI, ReconnectPolicy};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::{env, str::FromStr, time::Duration};
use thiserror::Error;
use tracing::info;

const AMQP_URI: &str = "AMQP_URI";
const APP_ID: &str = "APP_ID";
const PORT: &str = "PORT";
const AMQP_HEARTBEAT_SECS: &str = "AMQP_HEARTBEAT_SECS";
const AMQP_CONNECT_TIMEOUT_SECS: &str = "AMQP_CONNECT_TIMEOUT_SECS";
const AMQP_OPERATION_TIMEOUT_SECS: &str = "AMQP_OPERATION_TIMEOUT_SECS";
const AMQP_MAX_RECONNECT_ATTEMPTS: &str = "AMQP_MAX_RECONNECT_ATTEMPTS";
const AMQP_RECONNECT_BASE_DELAY_SECS: &str = "AMQP_RECONNECT_BASE_DELAY_SECS";
const AMQP_LIVENESS_INTERVAL_SECS: &str = "AMQP_LIVENESS_INTERVAL_SECS";
const PAYMENT_LIMIT: &str = "PAYMENT_LIMIT";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for environment variable {key}")]
    InvalidValue { key: &'static str, value: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub amqp_uri: String,
    pub app_id: String,
    pub port: u16,
    pub heartbeat_secs: u16,
    pub connect_timeout: Duration,
    pub operation_timeout: Duration,
    pub max_reconnect_attempts: u32,
    pub reconnect_base_delay: Duration,
    pub liveness_interval: Duration,
    /// Charges above this amount are declined by the simulated gateway
    pub payment_limit: Decimal,
}

impl Config {
    /// Loads `.env` if present, then reads the process environment.
    pub fn try_from_env() -> Result<Config, ConfigError> {
        // Load .env file
        dotenv().ok();
        let config = Self::from_lookup(|key| env::var(key).ok())?;
        info!(
            "Loaded configuration: port {}, app id {}",
            config.port, config.app_id
        );
        Ok(config)
    }

    /// Builds the configuration from any key lookup, falling back to defaults for missing keys.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Config, ConfigError> {
        let defaults = Config::default();
        let secs = |key, default: Duration| {
            parse_or(&lookup, key, default.as_secs()).map(Duration::from_secs)
        };

        Ok(Config {
            amqp_uri: lookup(AMQP_URI).unwrap_or(defaults.amqp_uri),
            app_id: lookup(APP_ID).unwrap_or(defaults.app_id),
            port: parse_or(&lookup, PORT, defaults.port)?,
            heartbeat_secs: parse_or(&lookup, AMQP_HEARTBEAT_SECS, defaults.heartbeat_secs)?,
            connect_timeout: secs(AMQP_CONNECT_TIMEOUT_SECS, defaults.connect_timeout)?,
            operation_timeout: secs(AMQP_OPERATION_TIMEOUT_SECS, defaults.operation_timeout)?,
            max_reconnect_attempts: parse_or(
                &lookup,
                AMQP_MAX_RECONNECT_ATTEMPTS,
                defaults.max_reconnect_attempts,
            )?,
            reconnect_base_delay: secs(
                AMQP_RECONNECT_BASE_DELAY_SECS,
                defaults.reconnect_base_delay,
            )?,
            liveness_interval: secs(AMQP_LIVENESS_INTERVAL_SECS, defaults.liveness_interval)?,
            payment_limit: parse_or(&lookup, PAYMENT_LIMIT, defaults.payment_limit)?,
        })
    }

    pub fn default() -> Config {
        Config {
            amqp_uri: DEFAULT_URI.to_string(),
            app_id: "payment-service".to_string(),
            port: 3001,
            heartbeat_secs: 60,
            connect_timeout: Duration::from_secs(10),
            operation_timeout: Duration::from_secs(5),
            max_reconnect_attempts: 5,
            reconnect_base_delay: Duration::from_secs(5),
            liveness_interval: Duration::from_secs(10),
            payment_limit: dec!(10000),
        }
    }

    pub fn endpoint(&self) -> BrokerEndpoint {
        BrokerEndpoint::new(&self.amqp_uri)
            .with_heartbeat(self.heartbeat_secs)
            .with_connect_timeout(self.connect_timeout)
            .with_operation_timeout(self.operation_timeout)
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::new(self.max_reconnect_attempts, self.reconnect_base_delay)
    }
}

fn parse_or<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(key) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { key, value }),
    }
}
