use std::{
    collections::HashMap,
    env,
    net::{AddrParseError, SocketAddr},
};

use thiserror::Error;

use crate::router::RouterPolicy;
use crate::socket_auth::SocketAuthConfig;

#[derive(Clone, Debug)]
pub struct Config {
    pub service_name: String,
    pub bind_addr: SocketAddr,
    pub db_url: Option<String>,
    /// Per-source webhook secrets, keyed by lowercased source name.
    pub webhook_secrets: HashMap<String, String>,
    pub webhook_default_secret: Option<String>,
    pub webhook_rate_max: u32,
    pub webhook_rate_window_ms: u64,
    pub api_rate_max: u32,
    pub api_rate_window_ms: u64,
    pub admin_rate_max: u32,
    pub admin_rate_window_ms: u64,
    pub rate_sweep_interval_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub socket_token_signing_key: String,
    pub socket_token_issuer: String,
    pub socket_token_audience: String,
    pub reward_ledger_base_url: Option<String>,
    pub reward_ledger_auth_token: Option<String>,
    pub reward_ledger_timeout_ms: u64,
    pub reward_min_amount: f64,
    pub tier_bonus_threshold: f64,
    pub tier_bonus_rate: f64,
    pub referral_bonus_amount: f64,
    pub welcome_bonus_amount: f64,
    pub ledger_memory_capacity: usize,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid EVENTS_BIND_ADDR: {0}")]
    BindAddrParse(#[from] AddrParseError),
    #[error("invalid EVENTS_WEBHOOK_SECRETS: {0}")]
    InvalidWebhookSecrets(String),
    #[error("invalid rate limit setting: {0}")]
    InvalidRateLimitSetting(String),
    #[error("invalid interval setting: {0}")]
    InvalidIntervalSetting(String),
    #[error("invalid reward policy setting: {0}")]
    InvalidRewardPolicySetting(String),
    #[error("invalid EVENTS_LEDGER_MEMORY_CAPACITY: {0}")]
    InvalidLedgerMemoryCapacity(String),
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let service_name = env::var("EVENTS_SERVICE_NAME").unwrap_or_else(|_| "events".to_string());
        let bind_addr = env::var("EVENTS_BIND_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:4600".to_string())
            .parse()?;
        let db_url = env::var("EVENTS_DB_URL")
            .or_else(|_| env::var("DATABASE_URL"))
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());

        let webhook_secrets =
            parse_webhook_secrets(&env::var("EVENTS_WEBHOOK_SECRETS").unwrap_or_default())?;
        let webhook_default_secret = env::var("EVENTS_WEBHOOK_DEFAULT_SECRET")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());

        let parse_rate_max = |key: &str, default: &str| -> Result<u32, ConfigError> {
            env::var(key)
                .unwrap_or_else(|_| default.to_string())
                .parse::<u32>()
                .map(|value| value.max(1))
                .map_err(|error| ConfigError::InvalidRateLimitSetting(format!("{key}: {error}")))
        };
        let parse_window = |key: &str, default: &str| -> Result<u64, ConfigError> {
            env::var(key)
                .unwrap_or_else(|_| default.to_string())
                .parse::<u64>()
                .map(|value| value.clamp(100, 86_400_000))
                .map_err(|error| ConfigError::InvalidRateLimitSetting(format!("{key}: {error}")))
        };
        let parse_interval = |key: &str, default: &str| -> Result<u64, ConfigError> {
            env::var(key)
                .unwrap_or_else(|_| default.to_string())
                .parse::<u64>()
                .map(|value| value.clamp(100, 3_600_000))
                .map_err(|error| ConfigError::InvalidIntervalSetting(format!("{key}: {error}")))
        };
        let parse_amount = |key: &str, default: &str| -> Result<f64, ConfigError> {
            env::var(key)
                .unwrap_or_else(|_| default.to_string())
                .parse::<f64>()
                .map_err(|error| {
                    ConfigError::InvalidRewardPolicySetting(format!("{key}: {error}"))
                })
                .and_then(|value| {
                    if value.is_finite() && value >= 0.0 {
                        Ok(value)
                    } else {
                        Err(ConfigError::InvalidRewardPolicySetting(format!(
                            "{key}: must be a non-negative number"
                        )))
                    }
                })
        };

        let webhook_rate_max = parse_rate_max("EVENTS_WEBHOOK_RATE_MAX", "100")?;
        let webhook_rate_window_ms = parse_window("EVENTS_WEBHOOK_RATE_WINDOW_MS", "60000")?;
        let api_rate_max = parse_rate_max("EVENTS_API_RATE_MAX", "1000")?;
        let api_rate_window_ms = parse_window("EVENTS_API_RATE_WINDOW_MS", "60000")?;
        let admin_rate_max = parse_rate_max("EVENTS_ADMIN_RATE_MAX", "50")?;
        let admin_rate_window_ms = parse_window("EVENTS_ADMIN_RATE_WINDOW_MS", "60000")?;
        let rate_sweep_interval_ms = parse_interval("EVENTS_RATE_SWEEP_INTERVAL_MS", "60000")?;
        let heartbeat_interval_ms = parse_interval("EVENTS_HEARTBEAT_INTERVAL_MS", "30000")?;

        let socket_token_signing_key =
            env::var("EVENTS_SOCKET_TOKEN_SIGNING_KEY").unwrap_or_else(|_| "dev-socket-key".to_string());
        let socket_token_issuer = env::var("EVENTS_SOCKET_TOKEN_ISSUER")
            .unwrap_or_else(|_| "https://perkstream.app".to_string());
        let socket_token_audience = env::var("EVENTS_SOCKET_TOKEN_AUDIENCE")
            .unwrap_or_else(|_| "perkstream-notifications".to_string());

        let reward_ledger_base_url = env::var("EVENTS_REWARD_LEDGER_BASE_URL")
            .ok()
            .map(|value| value.trim().trim_end_matches('/').to_string())
            .filter(|value| !value.is_empty());
        let reward_ledger_auth_token = env::var("EVENTS_REWARD_LEDGER_AUTH_TOKEN")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());
        let reward_ledger_timeout_ms = env::var("EVENTS_REWARD_LEDGER_TIMEOUT_MS")
            .unwrap_or_else(|_| "10000".to_string())
            .parse::<u64>()
            .map_err(|error| {
                ConfigError::InvalidIntervalSetting(format!(
                    "EVENTS_REWARD_LEDGER_TIMEOUT_MS: {error}"
                ))
            })?
            .clamp(250, 120_000);

        let reward_min_amount = parse_amount("EVENTS_REWARD_MIN_AMOUNT", "0.01")?;
        let tier_bonus_threshold = parse_amount("EVENTS_TIER_BONUS_THRESHOLD", "100.0")?;
        let tier_bonus_rate = parse_amount("EVENTS_TIER_BONUS_RATE", "0.1")?.clamp(0.0, 1.0);
        let referral_bonus_amount = parse_amount("EVENTS_REFERRAL_BONUS_AMOUNT", "10.0")?;
        let welcome_bonus_amount = parse_amount("EVENTS_WELCOME_BONUS_AMOUNT", "5.0")?;

        let ledger_memory_capacity = env::var("EVENTS_LEDGER_MEMORY_CAPACITY")
            .unwrap_or_else(|_| "1024".to_string())
            .parse::<usize>()
            .map_err(|error| ConfigError::InvalidLedgerMemoryCapacity(error.to_string()))?
            .clamp(1, 1_000_000);

        Ok(Self {
            service_name,
            bind_addr,
            db_url,
            webhook_secrets,
            webhook_default_secret,
            webhook_rate_max,
            webhook_rate_window_ms,
            api_rate_max,
            api_rate_window_ms,
            admin_rate_max,
            admin_rate_window_ms,
            rate_sweep_interval_ms,
            heartbeat_interval_ms,
            socket_token_signing_key,
            socket_token_issuer,
            socket_token_audience,
            reward_ledger_base_url,
            reward_ledger_auth_token,
            reward_ledger_timeout_ms,
            reward_min_amount,
            tier_bonus_threshold,
            tier_bonus_rate,
            referral_bonus_amount,
            welcome_bonus_amount,
            ledger_memory_capacity,
        })
    }

    #[must_use]
    pub fn socket_auth_config(&self) -> SocketAuthConfig {
        SocketAuthConfig {
            signing_key: self.socket_token_signing_key.clone(),
            issuer: self.socket_token_issuer.clone(),
            audience: self.socket_token_audience.clone(),
        }
    }

    #[must_use]
    pub fn router_policy(&self) -> RouterPolicy {
        RouterPolicy {
            reward_min_amount: self.reward_min_amount,
            tier_bonus_threshold: self.tier_bonus_threshold,
            tier_bonus_rate: self.tier_bonus_rate,
            referral_bonus_amount: self.referral_bonus_amount,
            welcome_bonus_amount: self.welcome_bonus_amount,
        }
    }

    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        Self {
            service_name: "events-test".to_string(),
            bind_addr: std::net::SocketAddr::from(([127, 0, 0, 1], 0)),
            db_url: None,
            webhook_secrets: HashMap::from([("fixflow".to_string(), "whsec_test".to_string())]),
            webhook_default_secret: None,
            webhook_rate_max: 100,
            webhook_rate_window_ms: 60_000,
            api_rate_max: 1_000,
            api_rate_window_ms: 60_000,
            admin_rate_max: 50,
            admin_rate_window_ms: 60_000,
            rate_sweep_interval_ms: 60_000,
            heartbeat_interval_ms: 30_000,
            socket_token_signing_key: "socket-test-key".to_string(),
            socket_token_issuer: "https://perkstream.test".to_string(),
            socket_token_audience: "perkstream-notifications".to_string(),
            reward_ledger_base_url: None,
            reward_ledger_auth_token: None,
            reward_ledger_timeout_ms: 10_000,
            reward_min_amount: 0.01,
            tier_bonus_threshold: 100.0,
            tier_bonus_rate: 0.1,
            referral_bonus_amount: 10.0,
            welcome_bonus_amount: 5.0,
            ledger_memory_capacity: 1_024,
        }
    }
}

/// Parse `source:secret,source:secret` pairs; sources are lowercased.
pub(crate) fn parse_webhook_secrets(raw: &str) -> Result<HashMap<String, String>, ConfigError> {
    let mut secrets = HashMap::new();
    for token in raw.split(',') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        let Some((source, secret)) = token.split_once(':') else {
            return Err(ConfigError::InvalidWebhookSecrets(format!(
                "expected source:secret, got: {token}"
            )));
        };
        let source = source.trim().to_ascii_lowercase();
        let secret = secret.trim();
        if source.is_empty() || secret.is_empty() {
            return Err(ConfigError::InvalidWebhookSecrets(format!(
                "empty source or secret in: {token}"
            )));
        }
        secrets.insert(source, secret.to_string());
    }
    Ok(secrets)
}
