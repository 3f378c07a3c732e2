//! Configuration for the transaction manager
//!
//! Loads configuration from TOML files with environment variable substitution.

use anyhow::{Context, Result};
use ethers::types::U256;
use serde::Deserialize;
use std::env;
use std::path::PathBuf;

const WEI_PER_GWEI: u64 = 1_000_000_000;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub manager: ManagerConfig,
    pub rootchain: RootChainConfig,
    pub db: DbConfig,
    pub wallet: WalletConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Core manager options
#[derive(Debug, Clone, Deserialize)]
pub struct ManagerConfig {
    /// Chain id used for transaction signing
    pub chain_id: u64,
    /// Send-tick period in milliseconds
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// Initial gas price in gwei; zero means "use the default"
    #[serde(default = "default_gas_price_gwei")]
    pub gas_price_gwei: u64,
    /// Lower clamp bound for the gas price controller, in gwei
    #[serde(default = "default_min_gas_price_gwei")]
    pub min_gas_price_gwei: u64,
    /// Upper clamp bound for the gas price controller, in gwei
    #[serde(default = "default_max_gas_price_gwei")]
    pub max_gas_price_gwei: u64,
    /// Block depth at which a mined transaction counts as confirmed
    #[serde(default = "default_confirmations")]
    pub confirmations: u64,
    /// Head debounce applied before running confirmation passes
    #[serde(default = "default_confirmation_delay")]
    pub confirmation_delay: u64,
    /// Minimum number of blocks between resubmissions of one raw
    #[serde(default = "default_send_delay")]
    pub send_delay: u64,
    /// Known-transaction retries before deferring to the next tick
    #[serde(default = "default_max_known_tx")]
    pub max_known_tx: u64,
}

fn default_interval_ms() -> u64 {
    10_000
}

fn default_gas_price_gwei() -> u64 {
    10
}

fn default_min_gas_price_gwei() -> u64 {
    1
}

fn default_max_gas_price_gwei() -> u64 {
    200
}

fn default_confirmations() -> u64 {
    32
}

fn default_confirmation_delay() -> u64 {
    4
}

fn default_send_delay() -> u64 {
    2
}

fn default_max_known_tx() -> u64 {
    5
}

impl ManagerConfig {
    pub fn gas_price(&self) -> U256 {
        U256::from(self.gas_price_gwei) * U256::from(WEI_PER_GWEI)
    }

    pub fn min_gas_price(&self) -> U256 {
        U256::from(self.min_gas_price_gwei) * U256::from(WEI_PER_GWEI)
    }

    pub fn max_gas_price(&self) -> U256 {
        U256::from(self.max_gas_price_gwei) * U256::from(WEI_PER_GWEI)
    }
}

/// Root chain endpoints
#[derive(Debug, Clone, Deserialize)]
pub struct RootChainConfig {
    /// WebSocket endpoint used for the new-head subscription
    pub ws_url: String,
    /// HTTP endpoints for unary calls, tried in order on failure
    #[serde(default)]
    pub http_urls: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WalletConfig {
    pub keystore_path: Option<String>,
    pub private_key_env: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 9090,
        }
    }
}

impl Settings {
    /// Load settings from configuration files
    pub fn load() -> Result<Self> {
        let config_path = env::var("TXMANAGER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        let config_str = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        // Substitute environment variables
        let config_str = substitute_env_vars(&config_str);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.manager.min_gas_price_gwei > self.manager.max_gas_price_gwei {
            anyhow::bail!("min gas price cannot exceed max gas price");
        }

        if self.rootchain.ws_url.is_empty() {
            anyhow::bail!("root chain WebSocket URL is required");
        }

        if self.manager.interval_ms == 0 {
            anyhow::bail!("send-tick interval must be non-zero");
        }

        Ok(())
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    let mut result = input.to_string();
    let re = regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").unwrap();

    for cap in re.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    result
}
