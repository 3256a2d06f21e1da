//! Environment-based Configuration
//!
//! # Environment Variables
//!
//! - `RECEIVERS_NETWORK` - "mainnet", "testnet", "signet" or "regtest" (default: "testnet")
//! - `RECEIVERS_STORAGE` - "sqlite" or "memory" (default: "sqlite")
//! - `RECEIVERS_DB_PATH` - SQLite database file (default: "data/receivers.db")
//! - `RECEIVERS_STORAGE_TIMEOUT_MS` - Deadline for a single receiver request (default: 5000)
//! - `RECEIVERS_LOG_LEVEL` - Logging level (debug, info, warn, error)
//! - `RECEIVERS_LOG_JSON` - Set to "1" for JSON logs (always on for mainnet)

use std::env;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Default SQLite database location
pub const DEFAULT_DB_PATH: &str = "data/receivers.db";

/// Default per-request deadline in milliseconds
pub const DEFAULT_STORAGE_TIMEOUT_MS: u64 = 5_000;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("invalid value for {0}: {1}")]
    InvalidValue(String, String),

    #[error("network mismatch: expected {0}, got {1}")]
    NetworkMismatch(String, String),

    #[error("{0} storage is not allowed on {1}")]
    StorageNotAllowed(String, String),
}

/// Network the addresses are encoded for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Mainnet,
    Testnet,
    Signet,
    Regtest,
}

impl FromStr for Network {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mainnet" | "main" | "bitcoin" => Ok(Network::Mainnet),
            "testnet" | "test" => Ok(Network::Testnet),
            "signet" => Ok(Network::Signet),
            "regtest" => Ok(Network::Regtest),
            _ => Err(ConfigError::InvalidValue(
                "RECEIVERS_NETWORK".to_string(),
                format!("unknown network: {}", s),
            )),
        }
    }
}

impl Network {
    /// Get bitcoin network enum
    pub fn bitcoin_network(&self) -> bitcoin::Network {
        match self {
            Network::Mainnet => bitcoin::Network::Bitcoin,
            Network::Testnet => bitcoin::Network::Testnet,
            Network::Signet => bitcoin::Network::Signet,
            Network::Regtest => bitcoin::Network::Regtest,
        }
    }
}

/// Storage backend selection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageBackend {
    /// SQLite database file
    Sqlite { path: String },
    /// Process-local maps, lost on exit
    Memory,
}

/// Main configuration struct
#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    /// Network environment
    pub network: Network,

    /// Storage backend
    pub storage: StorageBackend,

    /// Deadline for a single receiver request
    pub storage_timeout_ms: u64,

    /// Log level
    pub log_level: String,

    /// JSON log output
    pub log_json: bool,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            network: Network::Testnet,
            storage: StorageBackend::Sqlite {
                path: DEFAULT_DB_PATH.to_string(),
            },
            storage_timeout_ms: DEFAULT_STORAGE_TIMEOUT_MS,
            log_level: "info".to_string(),
            log_json: false,
        }
    }
}

impl ReceiverConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let network: Network = env::var("RECEIVERS_NETWORK")
            .unwrap_or_else(|_| "testnet".to_string())
            .parse()?;

        let storage = load_storage_config()?;

        let storage_timeout_ms = match env::var("RECEIVERS_STORAGE_TIMEOUT_MS") {
            Ok(value) => value.parse().map_err(|_| {
                ConfigError::InvalidValue(
                    "RECEIVERS_STORAGE_TIMEOUT_MS".to_string(),
                    "must be a number of milliseconds".to_string(),
                )
            })?,
            Err(_) => DEFAULT_STORAGE_TIMEOUT_MS,
        };
        if storage_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "RECEIVERS_STORAGE_TIMEOUT_MS".to_string(),
                "must be greater than zero".to_string(),
            ));
        }

        let log_level = env::var("RECEIVERS_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        let log_json = env::var("RECEIVERS_LOG_JSON").map(|v| v == "1").unwrap_or(false)
            || network == Network::Mainnet;

        Ok(Self {
            network,
            storage,
            storage_timeout_ms,
            log_level,
            log_json,
        })
    }

    /// Request deadline as a duration
    pub fn storage_timeout(&self) -> Duration {
        Duration::from_millis(self.storage_timeout_ms)
    }

    /// Validate configuration for production readiness
    pub fn validate_for_production(&self) -> Result<(), ConfigError> {
        if self.network != Network::Mainnet {
            return Err(ConfigError::NetworkMismatch(
                "mainnet".to_string(),
                format!("{:?}", self.network),
            ));
        }

        // counters must survive restarts
        if self.storage == StorageBackend::Memory {
            return Err(ConfigError::StorageNotAllowed(
                "memory".to_string(),
                "mainnet".to_string(),
            ));
        }

        Ok(())
    }

    /// Checks run before the store is opened. Mainnet must pass the
    /// production rules; other networks accept any backend.
    pub fn validate_for_startup(&self) -> Result<(), ConfigError> {
        match self.network {
            Network::Mainnet => self.validate_for_production(),
            _ => Ok(()),
        }
    }

    /// Print configuration summary
    pub fn print_summary(&self) {
        println!("=== Receiver Configuration ===");
        println!("Network: {:?}", self.network);
        println!(
            "Storage: {}",
            match &self.storage {
                StorageBackend::Sqlite { path } => format!("SQLite ({})", path),
                StorageBackend::Memory => "Memory (not persistent)".to_string(),
            }
        );
        println!("Request Timeout: {} ms", self.storage_timeout_ms);
        println!("Log Level: {}", self.log_level);
        println!("Log Format: {}", if self.log_json { "json" } else { "pretty" });
        println!("==============================");
    }
}

/// Load storage backend selection from environment
fn load_storage_config() -> Result<StorageBackend, ConfigError> {
    let kind = env::var("RECEIVERS_STORAGE").unwrap_or_else(|_| "sqlite".to_string());

    match kind.to_lowercase().as_str() {
        "sqlite" => {
            let path = env::var("RECEIVERS_DB_PATH").unwrap_or_else(|_| DEFAULT_DB_PATH.to_string());
            if path.is_empty() {
                return Err(ConfigError::MissingEnvVar("RECEIVERS_DB_PATH".to_string()));
            }
            Ok(StorageBackend::Sqlite { path })
        }
        "memory" => Ok(StorageBackend::Memory),
        _ => Err(ConfigError::InvalidValue(
            "RECEIVERS_STORAGE".to_string(),
            format!("unknown storage: {} (use 'sqlite' or 'memory')", kind),
        )),
    }
}
