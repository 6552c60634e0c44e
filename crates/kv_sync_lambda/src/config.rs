use std::str::FromStr;
use std::time::Duration;

use kv_sync_core::contract::DEFAULT_KEY_NAME;
use kv_sync_core::retry::RetryPolicy;
use thiserror::Error;

use crate::adapters::kv_api::{TransportInitError, DEFAULT_BASE_URL};

pub const SECRET_NAME_VAR: &str = "SECRETS_MANAGER_SECRET_NAME";
pub const TABLE_NAME_VAR: &str = "DYNAMODB_TABLE_NAME";
pub const MAX_ATTEMPTS_VAR: &str = "RETRY_MAX_ATTEMPTS";
pub const API_TIMEOUT_VAR: &str = "API_TIMEOUT_SECONDS";
pub const DEFAULT_KEY_VAR: &str = "DEFAULT_KEY_NAME";
pub const BASE_URL_VAR: &str = "KV_API_BASE_URL";
pub const SAFETY_MARGIN_VAR: &str = "TIMEOUT_SAFETY_MARGIN_PERCENT";
pub const BASE_DELAY_VAR: &str = "RETRY_BASE_DELAY_MS";
pub const MAX_DELAY_VAR: &str = "RETRY_MAX_DELAY_MS";
pub const ESTIMATED_CALL_VAR: &str = "ESTIMATED_CALL_MS";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("missing required environment variables: {}", .0.join(", "))]
    Missing(Vec<String>),
}

/// Failure while building process-wide resources.
#[derive(Debug, Error)]
pub enum InitError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Transport(#[from] TransportInitError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    pub secret_name: String,
    pub table_name: String,
    pub max_attempts: u32,
    pub api_timeout: Duration,
    pub default_key_name: String,
    pub api_base_url: String,
    pub safety_margin_percent: u8,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub estimated_call_cost: Duration,
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the configuration from an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let required = |name: &str| {
            lookup(name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let secret_name = required(SECRET_NAME_VAR);
        let table_name = required(TABLE_NAME_VAR);

        let (secret_name, table_name) = match (secret_name, table_name) {
            (Some(secret_name), Some(table_name)) => (secret_name, table_name),
            (secret_name, table_name) => {
                let mut missing = Vec::new();
                if secret_name.is_none() {
                    missing.push(SECRET_NAME_VAR.to_string());
                }
                if table_name.is_none() {
                    missing.push(TABLE_NAME_VAR.to_string());
                }
                return Err(ConfigError::Missing(missing));
            }
        };

        let max_attempts = parse_or(&lookup, MAX_ATTEMPTS_VAR, 3u32).max(1);
        let api_timeout = Duration::from_secs(parse_or(&lookup, API_TIMEOUT_VAR, 30u64).max(1));
        let default_key_name =
            required(DEFAULT_KEY_VAR).unwrap_or_else(|| DEFAULT_KEY_NAME.to_string());
        let api_base_url = required(BASE_URL_VAR).unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let safety_margin_percent = parse_or(&lookup, SAFETY_MARGIN_VAR, 5u8).clamp(2, 5);
        let base_delay = Duration::from_millis(parse_or(&lookup, BASE_DELAY_VAR, 1_000u64));
        let max_delay =
            Duration::from_millis(parse_or(&lookup, MAX_DELAY_VAR, 20_000u64)).max(base_delay);
        let estimated_call_cost =
            Duration::from_millis(parse_or(&lookup, ESTIMATED_CALL_VAR, 1_000u64));

        Ok(Self {
            secret_name,
            table_name,
            max_attempts,
            api_timeout,
            default_key_name,
            api_base_url,
            safety_margin_percent,
            base_delay,
            max_delay,
            estimated_call_cost,
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: self.base_delay,
            max_delay: self.max_delay,
            estimated_attempt_cost: self.estimated_call_cost,
            ..RetryPolicy::default()
        }
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> T
where
    T: FromStr + Copy + std::fmt::Display,
{
    let Some(raw) = lookup(name) else {
        return default;
    };
    match raw.trim().parse::<T>() {
        Ok(value) => value,
        Err(_) => {
            tracing::warn!(
                component = "config",
                event = "invalid_config_value",
                variable = name,
                value = %raw,
                fallback = %default,
            );
            default
        }
    }
}
