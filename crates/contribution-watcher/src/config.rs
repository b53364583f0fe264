//! Configuration management for the contribution watcher
//!
//! Loads configuration from environment variables with sensible defaults.

use anyhow::{Context, Result};
use std::env;
use std::time::Duration;
use zcash_protocol::consensus::NetworkType;

/// How transparent receiving addresses are obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressStrategyKind {
    /// Derive from a published extended public key
    Derive,
    /// Ask the node wallet for a labeled address
    Custodial,
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// API server host
    pub api_host: String,

    /// API server port
    pub api_port: u16,

    /// Whether to use the in-memory mock ledger (for development/testing)
    pub mock_mode: bool,

    /// Zcash node RPC URL (when not in mock mode)
    pub zcash_node_url: Option<String>,

    /// Zcash node RPC username
    pub zcash_node_user: Option<String>,

    /// Zcash node RPC password
    pub zcash_node_password: Option<String>,

    /// Upper bound on any single RPC call
    pub rpc_timeout_secs: u64,

    /// Network addresses are encoded for
    pub network: NetworkType,

    pub address_strategy: AddressStrategyKind,

    /// BIP32 extended public key for the derive strategy
    pub extended_public_key: Option<String>,

    /// Shared shielded address; shielded payments are disabled when unset
    pub shielded_address: Option<String>,

    /// Blocks required on top of a payment's block
    pub min_confirmations: u64,

    /// Delay before re-checking the tip or retrying a failed fetch
    pub scan_retry_delay_secs: u64,

    /// Consecutive fetch failures after which the process exits
    pub max_fetch_failures: u32,

    /// Start height used when bootstrap supplies no transaction to anchor on
    pub fallback_start_height: Option<u64>,

    /// Hex SHA-256 of the shared API secret
    pub api_secret_hash: String,

    /// The shared secret itself, presented to the backend on webhook calls
    pub api_secret: Option<String>,

    /// Backend base URL; enables the webhook notifier
    pub backend_url: Option<String>,

    /// Whether to serve the websocket notifier
    pub enable_websocket: bool,

    /// Name embedded in contribution memos
    pub service_name: String,

    /// Redis URL for the height checkpoint
    pub redis_url: Option<String>,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if it exists (for local development)
        dotenv::dotenv().ok();

        let config = Config {
            api_host: env::var("API_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),

            api_port: env::var("API_PORT")
                .unwrap_or_else(|_| "5000".to_string())
                .parse()
                .context("Invalid API_PORT")?,

            mock_mode: env::var("MOCK_MODE")
                .unwrap_or_else(|_| "false".to_string())
                .parse()
                .context("Invalid MOCK_MODE (expected true/false)")?,

            zcash_node_url: env::var("ZCASH_NODE_URL").ok(),
            zcash_node_user: env::var("ZCASH_NODE_USER").ok(),
            zcash_node_password: env::var("ZCASH_NODE_PASSWORD").ok(),

            rpc_timeout_secs: env::var("RPC_TIMEOUT_SECS")
                .unwrap_or_else(|_| "30".to_string())
                .parse()
                .context("Invalid RPC_TIMEOUT_SECS")?,

            network: parse_network(
                &env::var("ZCASH_NETWORK").unwrap_or_else(|_| "testnet".to_string()),
            )?,

            address_strategy: parse_strategy(
                &env::var("ADDRESS_STRATEGY").unwrap_or_else(|_| "derive".to_string()),
            )?,

            extended_public_key: env::var("EXTENDED_PUBLIC_KEY").ok(),
            shielded_address: env::var("SHIELDED_ADDRESS").ok().filter(|s| !s.is_empty()),

            min_confirmations: env::var("MINIMUM_BLOCK_CONFIRMATIONS")
                .unwrap_or_else(|_| "6".to_string())
                .parse()
                .context("Invalid MINIMUM_BLOCK_CONFIRMATIONS")?,

            scan_retry_delay_secs: env::var("SCAN_RETRY_DELAY_SECS")
                .unwrap_or_else(|_| "5".to_string())
                .parse()
                .context("Invalid SCAN_RETRY_DELAY_SECS")?,

            max_fetch_failures: env::var("MAX_FETCH_FAILURES")
                .unwrap_or_else(|_| "5".to_string())
                .parse()
                .context("Invalid MAX_FETCH_FAILURES")?,

            fallback_start_height: env::var("FALLBACK_START_HEIGHT")
                .ok()
                .map(|v| v.parse())
                .transpose()
                .context("Invalid FALLBACK_START_HEIGHT")?,

            api_secret_hash: env::var("API_SECRET_HASH")
                .context("API_SECRET_HASH is required")?,
            api_secret: env::var("API_SECRET").ok(),
            backend_url: env::var("BACKEND_URL").ok().filter(|s| !s.is_empty()),

            enable_websocket: env::var("ENABLE_WEBSOCKET")
                .unwrap_or_else(|_| "true".to_string())
                .parse()
                .context("Invalid ENABLE_WEBSOCKET (expected true/false)")?,

            service_name: env::var("SERVICE_NAME").unwrap_or_else(|_| "Grant.io".to_string()),
            redis_url: env::var("REDIS_URL").ok().filter(|s| !s.is_empty()),
        };

        // Validate configuration
        config.validate()?;

        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.api_port == 0 {
            anyhow::bail!("API_PORT must be greater than 0");
        }

        if self.rpc_timeout_secs == 0 {
            anyhow::bail!("RPC_TIMEOUT_SECS must be greater than 0");
        }

        if self.max_fetch_failures == 0 {
            anyhow::bail!("MAX_FETCH_FAILURES must be greater than 0");
        }

        if self.api_secret_hash.len() != 64 || hex::decode(&self.api_secret_hash).is_err() {
            anyhow::bail!("API_SECRET_HASH must be a hex SHA-256 digest");
        }

        // If not in mock mode, require Zcash node configuration
        if !self.mock_mode && self.zcash_node_url.is_none() {
            anyhow::bail!("ZCASH_NODE_URL is required when MOCK_MODE=false");
        }

        if self.address_strategy == AddressStrategyKind::Derive
            && self.extended_public_key.is_none()
        {
            anyhow::bail!("EXTENDED_PUBLIC_KEY is required when ADDRESS_STRATEGY=derive");
        }

        if self.backend_url.is_some() && self.api_secret.is_none() {
            anyhow::bail!("API_SECRET is required when BACKEND_URL is set");
        }

        Ok(())
    }

    /// Get the API server address
    pub fn api_address(&self) -> String {
        format!("{}:{}", self.api_host, self.api_port)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc_timeout_secs)
    }

    pub fn scan_retry_delay(&self) -> Duration {
        Duration::from_secs(self.scan_retry_delay_secs)
    }

    /// Minimal configuration backed by the mock ledger
    pub fn for_mock(api_secret_hash: impl Into<String>, extended_public_key: &str) -> Self {
        Self {
            api_host: "127.0.0.1".to_string(),
            api_port: 5000,
            mock_mode: true,
            zcash_node_url: None,
            zcash_node_user: None,
            zcash_node_password: None,
            rpc_timeout_secs: 30,
            network: NetworkType::Test,
            address_strategy: AddressStrategyKind::Derive,
            extended_public_key: Some(extended_public_key.to_string()),
            shielded_address: None,
            min_confirmations: 6,
            scan_retry_delay_secs: 5,
            max_fetch_failures: 5,
            fallback_start_height: None,
            api_secret_hash: api_secret_hash.into(),
            api_secret: None,
            backend_url: None,
            enable_websocket: true,
            service_name: "Grant.io".to_string(),
            redis_url: None,
        }
    }
}

fn parse_network(value: &str) -> Result<NetworkType> {
    match value.to_lowercase().as_str() {
        "mainnet" | "main" => Ok(NetworkType::Main),
        "testnet" | "test" => Ok(NetworkType::Test),
        "regtest" => Ok(NetworkType::Regtest),
        other => anyhow::bail!("Invalid ZCASH_NETWORK '{}' (expected mainnet/testnet/regtest)", other),
    }
}

fn parse_strategy(value: &str) -> Result<AddressStrategyKind> {
    match value.to_lowercase().as_str() {
        "derive" => Ok(AddressStrategyKind::Derive),
        "custodial" => Ok(AddressStrategyKind::Custodial),
        other => anyhow::bail!("Invalid ADDRESS_STRATEGY '{}' (expected derive/custodial)", other),
    }
}
