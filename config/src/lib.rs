//! Veil Configuration
//!
//! Shared configuration crate for the Veil client and tools.
//!
//! Handles loading configuration from:
//! 1. VEIL_CONFIG env var (explicit path)
//! 2. ./veil.toml (current directory)
//! 3. ~/.veil/veil.toml (user home)
//!
//! Environment variables take precedence over TOML config.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::{env, fs};

/// Global config instance for convenience access
pub static GLOBAL_CONFIG: OnceLock<VeilConfig> = OnceLock::new();

const CONFIG_FILE_NAME: &str = "veil.toml";
const CONFIG_DIR_NAME: &str = ".veil";
const CONNECTION_FILE_NAME: &str = "connection.json";

// ============================================================================
// Default Constants
// ============================================================================

const DEFAULT_RPC_URL: &str = "http://localhost:8545";
const DEFAULT_MOCK_CHAIN_ID: u64 = 31337;
const DEFAULT_PROBE_TIMEOUT_SECS: u64 = 10;
const DEFAULT_RELAYER_CHAIN_ID: u64 = 11155111;
const DEFAULT_RELAYER_TIMEOUT_SECS: u64 = 30;
const DEFAULT_DURATION_SECS: u64 = 3600;
const DEFAULT_MIN_VOTERS: u32 = 1;

// ============================================================================
// Config Structs
// ============================================================================

/// Root configuration structure (matches TOML layout)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VeilConfig {
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub relayer: RelayerConfig,
    /// Chain id (as string key) -> deployed ledger contract address
    #[serde(default)]
    pub contracts: BTreeMap<String, String>,
    #[serde(default)]
    pub wallet: WalletConfig,
    #[serde(default)]
    pub proposals: ProposalDefaults,
}

/// Network endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_rpc_url")]
    pub rpc_url: String,
    /// Chain id (as string key) -> local development RPC URL
    #[serde(default = "default_mock_chains")]
    pub mock_chains: BTreeMap<String, String>,
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            rpc_url: DEFAULT_RPC_URL.into(),
            mock_chains: default_mock_chains(),
            probe_timeout_secs: DEFAULT_PROBE_TIMEOUT_SECS,
        }
    }
}

fn default_rpc_url() -> String {
    DEFAULT_RPC_URL.into()
}

fn default_mock_chains() -> BTreeMap<String, String> {
    let mut chains = BTreeMap::new();
    chains.insert(DEFAULT_MOCK_CHAIN_ID.to_string(), DEFAULT_RPC_URL.into());
    chains
}

fn default_probe_timeout() -> u64 {
    DEFAULT_PROBE_TIMEOUT_SECS
}

/// Relayer service configuration (production networks)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayerConfig {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_relayer_chain_id")]
    pub chain_id: u64,
    #[serde(default = "default_relayer_timeout")]
    pub timeout_secs: u64,
}

impl Default for RelayerConfig {
    fn default() -> Self {
        Self {
            url: None,
            chain_id: DEFAULT_RELAYER_CHAIN_ID,
            timeout_secs: DEFAULT_RELAYER_TIMEOUT_SECS,
        }
    }
}

fn default_relayer_chain_id() -> u64 {
    DEFAULT_RELAYER_CHAIN_ID
}
fn default_relayer_timeout() -> u64 {
    DEFAULT_RELAYER_TIMEOUT_SECS
}

/// Wallet connection persistence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletConfig {
    #[serde(default = "default_true")]
    pub remember_connection: bool,
    #[serde(default)]
    pub store_path: Option<String>,
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            remember_connection: true,
            store_path: None,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Defaults used when creating proposals from tools
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposalDefaults {
    #[serde(default = "default_duration")]
    pub default_duration_secs: u64,
    #[serde(default = "default_min_voters")]
    pub default_min_voters: u32,
}

impl Default for ProposalDefaults {
    fn default() -> Self {
        Self {
            default_duration_secs: DEFAULT_DURATION_SECS,
            default_min_voters: DEFAULT_MIN_VOTERS,
        }
    }
}

fn default_duration() -> u64 {
    DEFAULT_DURATION_SECS
}
fn default_min_voters() -> u32 {
    DEFAULT_MIN_VOTERS
}

// ============================================================================
// Environment Variable Helpers
// ============================================================================

/// Set field from env var if present
fn env_string(key: &str, field: &mut String) {
    if let Ok(v) = env::var(key) {
        *field = v;
    }
}

/// Set Option<String> from env var if present
fn env_option_string(key: &str, field: &mut Option<String>) {
    if let Ok(v) = env::var(key) {
        *field = Some(v);
    }
}

/// Set field from env var if present and parseable
fn env_parse<T: std::str::FromStr>(key: &str, field: &mut T) {
    if let Ok(v) = env::var(key) {
        if let Ok(parsed) = v.parse() {
            *field = parsed;
        }
    }
}

/// Check if env var is set to a truthy value ("1" or "true")
fn env_bool(key: &str) -> Option<bool> {
    env::var(key)
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
}

/// Parse `id=url,id=url` into a chain map, skipping malformed entries
fn parse_chain_map(value: &str) -> BTreeMap<String, String> {
    value
        .split(',')
        .filter_map(|entry| {
            let (id, url) = entry.split_once('=')?;
            let id = id.trim();
            id.parse::<u64>().ok()?;
            Some((id.to_string(), url.trim().to_string()))
        })
        .collect()
}

// ============================================================================
// Implementation
// ============================================================================

impl VeilConfig {
    /// Load configuration from config file with env var overrides
    pub fn load() -> Result<Self> {
        let mut config = match Self::find_config_file() {
            Some(path) => {
                log::info!("Loading config from: {}", path.display());
                Self::parse_file(&path)?
            }
            None => {
                log::info!("No config file found, using defaults and environment variables");
                Self::default()
            }
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Load configuration from a specific file path
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config = Self::parse_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    fn parse_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Find the config file path
    fn find_config_file() -> Option<PathBuf> {
        // 1. Check VEIL_CONFIG env var
        if let Ok(path) = env::var("VEIL_CONFIG") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        // 2. Check ./veil.toml (current directory)
        let local_path = PathBuf::from(CONFIG_FILE_NAME);
        if local_path.exists() {
            return Some(local_path);
        }

        // 3. Check ~/.veil/veil.toml
        dirs::home_dir()
            .map(|h| h.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
            .filter(|p| p.exists())
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        // Network
        env_string("VEIL_RPC_URL", &mut self.network.rpc_url);
        env_parse(
            "VEIL_PROBE_TIMEOUT_SECS",
            &mut self.network.probe_timeout_secs,
        );
        if let Ok(v) = env::var("VEIL_MOCK_CHAINS") {
            let parsed = parse_chain_map(&v);
            if parsed.is_empty() {
                log::warn!("Ignoring VEIL_MOCK_CHAINS: no valid id=url entries");
            } else {
                self.network.mock_chains = parsed;
            }
        }

        // Relayer
        env_option_string("VEIL_RELAYER_URL", &mut self.relayer.url);
        env_parse("VEIL_RELAYER_CHAIN_ID", &mut self.relayer.chain_id);

        // Contracts: VEIL_CONTRACT applies to VEIL_CHAIN_ID (or the relayer chain)
        if let Ok(address) = env::var("VEIL_CONTRACT") {
            let chain = env::var("VEIL_CHAIN_ID").unwrap_or_else(|_| self.relayer.chain_id.to_string());
            self.contracts.insert(chain, address);
        }

        // Wallet
        if let Some(v) = env_bool("VEIL_REMEMBER_WALLET") {
            self.wallet.remember_connection = v;
        }
    }

    /// Mock chain map with numeric keys; non-numeric keys are skipped
    pub fn mock_chains(&self) -> BTreeMap<u64, String> {
        self.network
            .mock_chains
            .iter()
            .filter_map(|(id, url)| match id.parse::<u64>() {
                Ok(id) => Some((id, url.clone())),
                Err(_) => {
                    log::warn!("Ignoring mock chain with non-numeric id: {}", id);
                    None
                }
            })
            .collect()
    }

    /// Deployed ledger address for a chain, as configured
    pub fn contract_for(&self, chain_id: u64) -> Option<&str> {
        self.contracts.get(&chain_id.to_string()).map(String::as_str)
    }

    /// Path of the wallet connection store
    pub fn connection_store_path(&self) -> Option<PathBuf> {
        match &self.wallet.store_path {
            Some(path) => Some(PathBuf::from(path)),
            None => dirs::home_dir().map(|h| h.join(CONFIG_DIR_NAME).join(CONNECTION_FILE_NAME)),
        }
    }

    /// Get the default config file path
    pub fn default_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
    }

    /// Generate a sample config file
    pub fn generate_sample() -> Result<String> {
        let mut sample = Self::default();
        sample.relayer.url = Some("https://relayer.testnet.example".into());
        sample.contracts.insert(
            DEFAULT_MOCK_CHAIN_ID.to_string(),
            "0x5fbdb2315678afecb367f032d93f642f64180aa3".into(),
        );
        toml::to_string_pretty(&sample).context("Failed to serialize sample config")
    }

    /// Get the global config instance, initializing it if necessary.
    ///
    /// Falls back to defaults if loading fails.
    pub fn global() -> &'static VeilConfig {
        GLOBAL_CONFIG.get_or_init(|| {
            Self::load().unwrap_or_else(|e| {
                log::warn!("Failed to load config: {}, using defaults", e);
                Self::default()
            })
        })
    }

    /// Initialize the global config with a specific instance.
    ///
    /// Returns `Err(config)` if already initialized.
    pub fn set_global(config: VeilConfig) -> Result<(), VeilConfig> {
        GLOBAL_CONFIG.set(config)
    }
}

/// Shorthand for `VeilConfig::global()`.
#[inline]
pub fn global_config() -> &'static VeilConfig {
    VeilConfig::global()
}

// ============================================================================
// Tests
// ============================================================================
