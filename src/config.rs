//! Configuration management for the wallet core host
//!
//! Holds the tunables the host application supplies: ledger endpoint,
//! request chunking, gap-limit scanning and the fee model.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::crypto::LinearFee;
use crate::discovery::DiscoveryConfig;
use crate::ledger::CursorKind;
use crate::sync::SyncConfig;
use crate::tx_builder::BuilderConfig;

/// Network type for Bitcoin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Regtest,
    Signet,
    Mainnet,
}

impl Network {
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Regtest => "regtest",
            Network::Signet => "signet",
            Network::Mainnet => "mainnet",
        }
    }

    pub fn to_bdk_network(&self) -> bdk_wallet::bitcoin::Network {
        match self {
            Network::Regtest => bdk_wallet::bitcoin::Network::Regtest,
            Network::Signet => bdk_wallet::bitcoin::Network::Signet,
            Network::Mainnet => bdk_wallet::bitcoin::Network::Bitcoin,
        }
    }
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Network {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "regtest" => Ok(Network::Regtest),
            "signet" => Ok(Network::Signet),
            "mainnet" | "bitcoin" => Ok(Network::Mainnet),
            _ => Err(anyhow::anyhow!("Invalid network: {}", s)),
        }
    }
}

/// Application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Bitcoin network to use
    #[serde(default = "default_network")]
    pub network: Network,

    /// Base URL of the remote ledger API
    #[serde(default = "default_backend_url")]
    pub backend_url: String,

    /// Max addresses per ledger request
    #[serde(default = "default_address_chunk_size")]
    pub address_chunk_size: usize,

    /// Max transaction hashes per ledger request
    #[serde(default = "default_tx_hash_chunk_size")]
    pub tx_hash_chunk_size: usize,

    /// Max rows per history page
    #[serde(default = "default_history_page_size")]
    pub history_page_size: usize,

    /// Gap limit: consecutive unused addresses that end a scan
    #[serde(default = "default_address_scan_size")]
    pub address_scan_size: usize,

    /// Addresses derived per discovery batch
    #[serde(default = "default_address_request_size")]
    pub address_request_size: usize,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Cursor flavour of the history endpoint ("date" or "block")
    #[serde(default)]
    pub history_cursor: CursorKind,

    #[serde(default)]
    pub fee_constant: u64,

    #[serde(default = "default_fee_coefficient")]
    pub fee_coefficient: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            network: default_network(),
            backend_url: default_backend_url(),
            address_chunk_size: default_address_chunk_size(),
            tx_hash_chunk_size: default_tx_hash_chunk_size(),
            history_page_size: default_history_page_size(),
            address_scan_size: default_address_scan_size(),
            address_request_size: default_address_request_size(),
            request_timeout_secs: default_request_timeout_secs(),
            history_cursor: CursorKind::default(),
            fee_constant: 0,
            fee_coefficient: default_fee_coefficient(),
        }
    }
}

impl Config {
    /// Load configuration from file, or create default if it doesn't exist
    pub fn load() -> Result<Self> {
        Self::load_from(&config_file_path()?)
    }

    pub fn load_from(config_path: &Path) -> Result<Self> {
        if config_path.exists() {
            let contents = fs::read_to_string(config_path)
                .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

            let config: Config = toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

            tracing::info!("📝 Loaded config from: {}", config_path.display());
            Ok(config)
        } else {
            tracing::info!("📝 No config file found, creating default at: {}", config_path.display());
            let config = Self::default();
            config.save_to(config_path)?;
            Ok(config)
        }
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        self.save_to(&config_file_path()?)
    }

    pub fn save_to(&self, config_path: &Path) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {}", parent.display()))?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(config_path, contents)
            .with_context(|| format!("Failed to write config file: {}", config_path.display()))?;

        tracing::info!("💾 Saved config to: {}", config_path.display());
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        let url = reqwest::Url::parse(&self.backend_url)
            .with_context(|| format!("Invalid backend URL: {}", self.backend_url))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(anyhow::anyhow!("Backend URL must be http(s), got: {}", self.backend_url));
        }

        let sizes = [
            ("address_chunk_size", self.address_chunk_size),
            ("tx_hash_chunk_size", self.tx_hash_chunk_size),
            ("history_page_size", self.history_page_size),
            ("address_scan_size", self.address_scan_size),
            ("address_request_size", self.address_request_size),
        ];
        for (name, value) in sizes {
            if value == 0 {
                return Err(anyhow::anyhow!("{} must be at least 1", name));
            }
        }
        if self.request_timeout_secs == 0 {
            return Err(anyhow::anyhow!("request_timeout_secs must be at least 1"));
        }

        if self.address_request_size < self.address_scan_size {
            return Err(anyhow::anyhow!(
                "address_request_size ({}) must be at least address_scan_size ({})",
                self.address_request_size,
                self.address_scan_size
            ));
        }

        Ok(())
    }

    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            address_chunk_size: self.address_chunk_size,
            tx_hash_chunk_size: self.tx_hash_chunk_size,
            history_page_size: self.history_page_size,
            cursor_kind: self.history_cursor,
        }
    }

    pub fn discovery_config(&self) -> DiscoveryConfig {
        DiscoveryConfig {
            scan_size: self.address_scan_size,
            request_size: self.address_request_size,
        }
    }

    pub fn builder_config(&self) -> BuilderConfig {
        BuilderConfig {
            fee: LinearFee::new(self.fee_constant, self.fee_coefficient),
        }
    }
}

fn default_network() -> Network {
    Network::Signet
}

fn default_backend_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_address_chunk_size() -> usize {
    50
}

fn default_tx_hash_chunk_size() -> usize {
    20
}

fn default_history_page_size() -> usize {
    50
}

fn default_address_scan_size() -> usize {
    20
}

fn default_address_request_size() -> usize {
    50
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_fee_coefficient() -> u64 {
    1
}

/// Get the configuration file path
fn config_file_path() -> Result<PathBuf> {
    let config_dir = directories::ProjectDirs::from("", "", "ambient-core")
        .map(|dirs| dirs.config_dir().to_path_buf())
        .unwrap_or_else(|| {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            PathBuf::from(home).join(".config").join("ambient-core")
        });

    Ok(config_dir.join("config.toml"))
}

/// Directory for per-network data (logs)
pub fn data_dir(network: Network) -> PathBuf {
    directories::ProjectDirs::from("", "", "ambient-core")
        .map(|dirs| dirs.data_local_dir().to_path_buf())
        .unwrap_or_else(|| {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            PathBuf::from(home).join(".ambient-core")
        })
        .join(network.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_from_str() {
        assert_eq!("regtest".parse::<Network>().unwrap(), Network::Regtest);
        assert_eq!("SIGNET".parse::<Network>().unwrap(), Network::Signet);
        assert_eq!("bitcoin".parse::<Network>().unwrap(), Network::Mainnet);
        assert!("testnet4".parse::<Network>().is_err());
    }

    #[test]
    fn test_missing_fields_take_defaults() {
        let config: Config = toml::from_str(
            "network = \"regtest\"\nhistory_cursor = \"date\"\naddress_scan_size = 5\n",
        )
        .unwrap();
        assert_eq!(config.network, Network::Regtest);
        assert_eq!(config.history_cursor, CursorKind::Date);
        assert_eq!(config.discovery_config().scan_size, 5);
        assert_eq!(config.discovery_config().request_size, 50);
        assert_eq!(config.address_chunk_size, 50);
        assert_eq!(config.builder_config().fee, LinearFee::new(0, 1));
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        // First load creates the default file
        let created = Config::load_from(&path).unwrap();
        assert!(path.exists());
        assert_eq!(created, Config::default());

        let config = Config {
            backend_url: "https://ledger.example:8443".into(),
            fee_constant: 155_381,
            fee_coefficient: 44,
            ..Config::default()
        };
        config.save_to(&path).unwrap();
        assert_eq!(Config::load_from(&path).unwrap(), config);
    }

    #[test]
    fn test_validation() {
        assert!(Config::default().validate().is_ok());

        let bad_url = Config { backend_url: "ledger:8080/api".into(), ..Config::default() };
        assert!(bad_url.validate().is_err());

        let zero_chunk = Config { address_chunk_size: 0, ..Config::default() };
        assert!(zero_chunk.validate().is_err());

        let stalls = Config { address_scan_size: 30, address_request_size: 20, ..Config::default() };
        assert!(stalls.validate().is_err());
    }
}
