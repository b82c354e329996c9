//! Configuration management for the vault observer
//!
//! Loads configuration from TOML files with environment variable substitution.
//! Engine-wide tuning lives in `[engine]`; every knob can be overridden per chain.

use anyhow::{Context, Result};
use lazy_static::lazy_static;
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub engine: EngineConfig,
    pub database: Option<DatabaseConfig>,
    pub api: ApiConfig,
    pub metrics: MetricsConfig,
    pub chains: HashMap<String, ChainConfig>,
}

/// Default tuning shared by all chains
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub initial_poll_interval_ms: u64,
    pub min_poll_interval_ms: u64,
    /// Timeout for one RPC call, as a multiple of the current polling interval
    pub rpc_timeout_factor: u32,
    pub min_rpc_timeout_ms: u64,
    pub height_retry_delay_ms: u64,
    pub endpoint_refresh_secs: u64,
    /// Probe interval while a chain has no healthy endpoint
    pub unhealthy_refresh_ms: u64,
    pub max_receipt_retry: u32,
    pub receipt_retry_delay_ms: u64,
    pub tracked_capacity: usize,
    pub track_timeout_secs: u64,
    pub fee_window: usize,
    pub gas_price_refresh_secs: u64,
    pub default_base_fee: u64,
    pub default_tip: u64,
    pub channel_capacity: usize,
    pub tuning: TrackerTuning,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            initial_poll_interval_ms: 10_000,
            min_poll_interval_ms: 500,
            rpc_timeout_factor: 2,
            min_rpc_timeout_ms: 5_000,
            height_retry_delay_ms: 5_000,
            endpoint_refresh_secs: 30 * 60,
            unhealthy_refresh_ms: 5_000,
            max_receipt_retry: 5,
            receipt_retry_delay_ms: 3_000,
            tracked_capacity: 1_000,
            track_timeout_secs: 30 * 60,
            fee_window: 40,
            gas_price_refresh_secs: 60,
            default_base_fee: 30_000_000_000,
            default_tip: 2_000_000_000,
            channel_capacity: 16,
            tuning: TrackerTuning::default(),
        }
    }
}

/// Feedback steps of the adaptive block-time tracker, in per-mille
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TrackerTuning {
    pub streak_len: u32,
    pub streak_drop_permille: u64,
    pub hit_drop_permille: u64,
    pub minor_delay_raise_permille: u64,
    pub miss_raise_permille: u64,
    /// Treat a block found right after a miss as late (raise) instead of a hit
    pub slow_down_after_miss: bool,
}

impl Default for TrackerTuning {
    fn default() -> Self {
        Self {
            streak_len: 3,
            streak_drop_permille: 400,
            hit_drop_permille: 50,
            minor_delay_raise_permille: 25,
            miss_raise_permille: 100,
            slow_down_after_miss: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChainFamily {
    Evm,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FeeMode {
    Legacy,
    FeeMarket,
}

/// Raw per-chain section as written in the file
#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub name: String,
    pub family: ChainFamily,
    pub rpc_urls: Vec<String>,
    pub fee_mode: FeeMode,
    #[serde(default)]
    pub max_gas_price_gwei: Option<u64>,
    #[serde(default)]
    pub check_balance: bool,
    #[serde(default = "default_true")]
    pub case_insensitive_addresses: bool,
    pub enabled: bool,

    pub initial_poll_interval_ms: Option<u64>,
    pub min_poll_interval_ms: Option<u64>,
    pub endpoint_refresh_secs: Option<u64>,
    pub max_receipt_retry: Option<u32>,
    pub receipt_retry_delay_ms: Option<u64>,
    pub tracked_capacity: Option<usize>,
    pub track_timeout_secs: Option<u64>,
    pub fee_window: Option<usize>,
    pub gas_price_refresh_secs: Option<u64>,
    pub default_base_fee: Option<u64>,
    pub default_tip: Option<u64>,
}

fn default_true() -> bool {
    true
}

/// Fully resolved settings for one chain's watcher
#[derive(Debug, Clone)]
pub struct WatcherSettings {
    pub chain: String,
    pub rpc_urls: Vec<String>,
    pub fee_mode: FeeMode,
    pub max_gas_price: Option<u128>,
    pub check_balance: bool,
    pub case_insensitive_addresses: bool,
    pub initial_poll_interval: Duration,
    pub min_poll_interval: Duration,
    pub rpc_timeout_factor: u32,
    pub min_rpc_timeout: Duration,
    pub height_retry_delay: Duration,
    pub endpoint_refresh: Duration,
    pub unhealthy_refresh: Duration,
    pub max_receipt_retry: u32,
    pub receipt_retry_delay: Duration,
    pub tracked_capacity: usize,
    pub track_timeout: Duration,
    pub fee_window: usize,
    pub gas_price_refresh: Duration,
    pub default_base_fee: u128,
    pub default_tip: u128,
    pub channel_capacity: usize,
    pub tuning: TrackerTuning,
}

impl WatcherSettings {
    /// Merge a chain section over the engine defaults
    pub fn resolve(chain: &ChainConfig, engine: &EngineConfig) -> Self {
        Self {
            chain: chain.name.clone(),
            rpc_urls: chain.rpc_urls.clone(),
            fee_mode: chain.fee_mode,
            max_gas_price: chain
                .max_gas_price_gwei
                .map(|gwei| gwei as u128 * 1_000_000_000),
            check_balance: chain.check_balance,
            case_insensitive_addresses: chain.case_insensitive_addresses,
            initial_poll_interval: Duration::from_millis(
                chain
                    .initial_poll_interval_ms
                    .unwrap_or(engine.initial_poll_interval_ms),
            ),
            min_poll_interval: Duration::from_millis(
                chain.min_poll_interval_ms.unwrap_or(engine.min_poll_interval_ms),
            ),
            rpc_timeout_factor: engine.rpc_timeout_factor.max(1),
            min_rpc_timeout: Duration::from_millis(engine.min_rpc_timeout_ms),
            height_retry_delay: Duration::from_millis(engine.height_retry_delay_ms),
            endpoint_refresh: Duration::from_secs(
                chain.endpoint_refresh_secs.unwrap_or(engine.endpoint_refresh_secs),
            ),
            unhealthy_refresh: Duration::from_millis(engine.unhealthy_refresh_ms.max(1)),
            max_receipt_retry: chain.max_receipt_retry.unwrap_or(engine.max_receipt_retry),
            receipt_retry_delay: Duration::from_millis(
                chain
                    .receipt_retry_delay_ms
                    .unwrap_or(engine.receipt_retry_delay_ms),
            ),
            tracked_capacity: chain.tracked_capacity.unwrap_or(engine.tracked_capacity),
            track_timeout: Duration::from_secs(
                chain.track_timeout_secs.unwrap_or(engine.track_timeout_secs),
            ),
            fee_window: chain.fee_window.unwrap_or(engine.fee_window),
            gas_price_refresh: Duration::from_secs(
                chain
                    .gas_price_refresh_secs
                    .unwrap_or(engine.gas_price_refresh_secs),
            ),
            default_base_fee: chain.default_base_fee.unwrap_or(engine.default_base_fee) as u128,
            default_tip: chain.default_tip.unwrap_or(engine.default_tip) as u128,
            channel_capacity: engine.channel_capacity.max(1),
            tuning: engine.tuning,
        }
    }

    /// Settings suitable for tests: fast timings, one endpoint
    #[cfg(test)]
    pub fn for_tests(chain: &str) -> Self {
        let chain = ChainConfig {
            name: chain.to_string(),
            family: ChainFamily::Evm,
            rpc_urls: vec!["http://node-a".to_string()],
            fee_mode: FeeMode::FeeMarket,
            max_gas_price_gwei: None,
            check_balance: false,
            case_insensitive_addresses: true,
            enabled: true,
            initial_poll_interval_ms: Some(1_000),
            min_poll_interval_ms: Some(100),
            endpoint_refresh_secs: None,
            max_receipt_retry: Some(2),
            receipt_retry_delay_ms: Some(10),
            tracked_capacity: Some(16),
            track_timeout_secs: Some(60),
            fee_window: Some(4),
            gas_price_refresh_secs: None,
            default_base_fee: None,
            default_tip: None,
        };
        Self::resolve(&chain, &EngineConfig::default())
    }
}

impl Settings {
    /// Load settings from the file named by `VAULT_OBSERVER_CONFIG`
    pub fn load() -> Result<Self> {
        let config_path = env::var("VAULT_OBSERVER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        Self::load_from(&config_path)
    }

    /// Load settings from an explicit path
    pub fn load_from(config_path: &Path) -> Result<Self> {
        let config_str = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        Self::parse(&config_str)
    }

    fn parse(raw: &str) -> Result<Self> {
        // Substitute environment variables
        let config_str = substitute_env_vars(raw);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.enabled_chains().is_empty() {
            anyhow::bail!("At least one chain must be enabled");
        }

        if self.engine.min_poll_interval_ms == 0 {
            anyhow::bail!("engine.min_poll_interval_ms must be positive");
        }

        for (name, chain) in self.enabled_chains() {
            if chain.rpc_urls.is_empty() {
                anyhow::bail!("Chain {} has no RPC URLs configured", name);
            }
            let resolved = WatcherSettings::resolve(chain, &self.engine);
            if resolved.min_poll_interval.is_zero() {
                anyhow::bail!("Chain {} has a zero polling floor", name);
            }
            if resolved.fee_window == 0 {
                anyhow::bail!("Chain {} has an empty fee window", name);
            }
            if resolved.tracked_capacity == 0 {
                anyhow::bail!("Chain {} has a zero tracked-tx capacity", name);
            }
        }

        Ok(())
    }

    /// Get list of enabled chains
    pub fn enabled_chains(&self) -> Vec<(&String, &ChainConfig)> {
        self.chains.iter().filter(|(_, c)| c.enabled).collect()
    }

    /// Resolved watcher settings for every enabled chain
    pub fn watcher_settings(&self) -> Vec<(ChainFamily, WatcherSettings)> {
        self.enabled_chains()
            .into_iter()
            .map(|(_, c)| (c.family.clone(), WatcherSettings::resolve(c, &self.engine)))
            .collect()
    }
}

lazy_static! {
    static ref ENV_VAR: regex::Regex =
        regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").expect("valid env var pattern");
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    let mut result = input.to_string();

    for cap in ENV_VAR.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    result
}
