//! Environment-driven configuration.
//!
//! Every recognized option has an explicit default; parsing happens once at
//! startup and invalid values fail fast with a [`ConfigError`] naming the
//! offending variable. Binaries load `.env` via dotenvy before calling
//! [`AppConfig::from_env`]; this crate never touches the filesystem.

use serde::Serialize;
use std::collections::HashMap;

/// Broker connection settings.
#[derive(Debug, Clone, Serialize)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub client_id: i32,
    pub account_id: Option<String>,
    /// `false` means dry-run: log intended actions, open no socket.
    pub live: bool,
    pub allow_live_orders: bool,
    pub allow_cancel_entries: bool,
}

/// Risk and sizing limits applied before order submission.
#[derive(Debug, Clone, Serialize)]
pub struct RiskLimits {
    pub max_orders_per_symbol: Option<u32>,
    pub max_order_qty: Option<i64>,
    pub max_notional_per_symbol: Option<f64>,
    pub daily_loss_limit: Option<f64>,
    pub enable_dynamic_sizing: bool,
    pub buying_power_factor: f64,
}

/// Orchestrator pacing and capacity.
#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorConfig {
    pub user_id: String,
    pub max_concurrent_strategies: usize,
    pub watch_interval_ms: u64,
}

/// Bar cache and retention knobs.
#[derive(Debug, Clone, Serialize)]
pub struct CacheConfig {
    pub bar_retention_days: u32,
    pub log_stats_interval_ms: u64,
    pub ttl_ms: u64,
}

/// Full application configuration, one value per recognized env var.
#[derive(Debug, Clone, Serialize)]
pub struct AppConfig {
    pub broker: BrokerConfig,
    pub risk: RiskLimits,
    pub orchestrator: OrchestratorConfig,
    pub cache: CacheConfig,
    pub database_url: Option<String>,
}

impl AppConfig {
    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let env: HashMap<String, String> = std::env::vars().collect();
        Self::from_map(&env)
    }

    /// Read configuration from an explicit map (test seam).
    pub fn from_map(env: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let get = |key: &str| env.get(key).map(|s| s.trim().to_string()).filter(|s| !s.is_empty());

        Ok(AppConfig {
            broker: BrokerConfig {
                host: get("TWS_HOST").unwrap_or_else(|| "127.0.0.1".to_string()),
                port: parse_or(&get, "TWS_PORT", 7497)?,
                client_id: parse_or(&get, "TWS_CLIENT_ID", 1)?,
                account_id: get("TWS_ACCOUNT_ID"),
                live: parse_bool_or(&get, "LIVE", false)?,
                allow_live_orders: parse_bool_or(&get, "ALLOW_LIVE_ORDERS", false)?,
                allow_cancel_entries: parse_bool_or(&get, "ALLOW_CANCEL_ENTRIES", true)?,
            },
            risk: RiskLimits {
                max_orders_per_symbol: parse_opt(&get, "MAX_ORDERS_PER_SYMBOL")?,
                max_order_qty: parse_opt(&get, "MAX_ORDER_QTY")?,
                max_notional_per_symbol: parse_opt(&get, "MAX_NOTIONAL_PER_SYMBOL")?,
                daily_loss_limit: parse_opt(&get, "DAILY_LOSS_LIMIT")?,
                enable_dynamic_sizing: parse_bool_or(&get, "ENABLE_DYNAMIC_SIZING", false)?,
                buying_power_factor: parse_or(&get, "BUYING_POWER_FACTOR", 0.75)?,
            },
            orchestrator: OrchestratorConfig {
                user_id: get("USER_ID").unwrap_or_else(|| "default".to_string()),
                max_concurrent_strategies: parse_or(&get, "MAX_CONCURRENT_STRATEGIES", 10)?,
                watch_interval_ms: parse_or(&get, "STRATEGY_WATCH_INTERVAL_MS", 30_000)?,
            },
            cache: CacheConfig {
                bar_retention_days: parse_or(&get, "BAR_RETENTION_DAYS", 365)?,
                log_stats_interval_ms: parse_or(&get, "BAR_CACHE_LOG_STATS_INTERVAL", 300_000)?,
                ttl_ms: parse_or(&get, "BAR_CACHE_TTL_MS", 60_000)?,
            },
            database_url: get("DATABASE_URL"),
        })
    }

    /// Live submission requires both `LIVE` and `ALLOW_LIVE_ORDERS`.
    pub fn live_orders_enabled(&self) -> bool {
        self.broker.live && self.broker.allow_live_orders
    }
}

fn parse_or<T: std::str::FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError> {
    match get(key) {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|_| ConfigError {
            var: key.to_string(),
            value: raw,
        }),
    }
}

fn parse_opt<T: std::str::FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, ConfigError> {
    match get(key) {
        None => Ok(None),
        Some(raw) => raw.parse().map(Some).map_err(|_| ConfigError {
            var: key.to_string(),
            value: raw,
        }),
    }
}

/// Booleans accept 1/0, true/false, yes/no (case-insensitive).
fn parse_bool_or(
    get: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: bool,
) -> Result<bool, ConfigError> {
    match get(key) {
        None => Ok(default),
        Some(raw) => match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" => Ok(true),
            "0" | "false" | "no" => Ok(false),
            _ => Err(ConfigError {
                var: key.to_string(),
                value: raw,
            }),
        },
    }
}

/// An env var that failed to parse. Startup aborts on the first one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    pub var: String,
    pub value: String,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid value {:?} for env var {}", self.value, self.var)
    }
}

impl std::error::Error for ConfigError {}
