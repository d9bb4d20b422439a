//! Configuration management for the lattice daemon.
//!
//! Note: Some items appear as "dead code" in library checks because they're
//! only used by the binary (main.rs). These include:
//! - `get_data_dir()`, `get_network_data_dir()` - used for config path resolution
//! - `Config::load_or_create()`, `save_to_file()` - used for config persistence

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

use crate::network_type::NetworkType;

/// Get the platform-specific data directory for the lattice daemon
pub fn get_data_dir() -> PathBuf {
    if cfg!(windows) {
        // Windows: %APPDATA%\latticed
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("latticed")
    } else {
        // Linux/Mac: ~/.latticed
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".latticed")
    }
}

/// Get the network-specific subdirectory (mainnet or testnet)
pub fn get_network_data_dir(network: &NetworkType) -> PathBuf {
    let base = get_data_dir();
    match network {
        NetworkType::Mainnet => base, // Mainnet uses base directory directly
        NetworkType::Testnet => base.join("testnet"), // Testnet uses subdirectory
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub node: NodeConfig,
    pub network: NetworkConfig,
    pub mining: MiningConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub name: String,
    #[serde(default = "default_network")]
    pub network: String,
    /// Child chains whose rovers feed this node's anchored headers
    #[serde(default = "default_rovers")]
    pub rovers: Vec<String>,
    /// Run the full block-sequence check on every tip extension
    #[serde(default = "default_false")]
    pub strict_sequence_check: bool,
}

fn default_false() -> bool {
    false
}

fn default_network() -> String {
    "testnet".to_string()
}

fn default_rovers() -> Vec<String> {
    ["btc", "eth", "lsk", "neo", "wav"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl NodeConfig {
    pub fn network_type(&self) -> NetworkType {
        match self.network.to_lowercase().as_str() {
            "mainnet" => NetworkType::Mainnet,
            _ => NetworkType::Testnet,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub listen_address: String,
    pub max_peers: u32,
    pub bootstrap_peers: Vec<String>,
    /// Override the network's default peer quorum
    #[serde(default)]
    pub quorum_size: Option<u64>,
    /// Low-health overlay: pin the quorum at 1 regardless of network
    #[serde(default = "default_false")]
    pub low_health_net: bool,
}

impl NetworkConfig {
    pub fn full_listen_address(&self, network_type: &NetworkType) -> String {
        if self.listen_address.contains(':') {
            self.listen_address.clone()
        } else {
            format!(
                "{}:{}",
                self.listen_address,
                network_type.default_p2p_port()
            )
        }
    }

    pub fn effective_quorum(&self, network_type: &NetworkType) -> u64 {
        if self.low_health_net {
            return 1;
        }
        self.quorum_size
            .unwrap_or_else(|| network_type.default_quorum())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MiningConfig {
    /// Identity credited in mined blocks; defaults to the node's peer id
    #[serde(default)]
    pub miner_key: Option<String>,
    /// Cap on mining worker processes; defaults to the CPU count
    #[serde(default)]
    pub max_workers: Option<usize>,
}

impl MiningConfig {
    pub fn effective_workers(&self) -> usize {
        let cpus = num_cpus::get().max(1);
        match self.max_workers {
            Some(n) if n > 0 => n.min(cpus),
            _ => cpus,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub data_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub file_path: String,
}

impl Config {
    pub fn load_from_file(path: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn default() -> Self {
        Self {
            node: NodeConfig {
                name: "Lattice Node".to_string(),
                network: "testnet".to_string(),
                rovers: default_rovers(),
                strict_sequence_check: false,
            },
            network: NetworkConfig {
                listen_address: "0.0.0.0".to_string(),
                max_peers: 50,
                bootstrap_peers: vec![],
                quorum_size: None,
                low_health_net: false,
            },
            mining: MiningConfig {
                miner_key: None,
                max_workers: None,
            },
            storage: StorageConfig {
                data_dir: "".to_string(), // Will be auto-configured
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                file_path: "./logs/node.log".to_string(),
            },
        }
    }

    pub fn load_or_create(
        path: &str,
        network_type: &NetworkType,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        // Ensure data directory exists
        let data_dir = get_network_data_dir(network_type);
        fs::create_dir_all(&data_dir)?;

        if fs::metadata(path).is_ok() {
            let contents = fs::read_to_string(path)?;
            let mut config: Config = toml::from_str(&contents)?;

            // Update data_dir to use platform-specific path if empty or relative
            if config.storage.data_dir.is_empty() || config.storage.data_dir.starts_with("./") {
                config.storage.data_dir = data_dir.to_string_lossy().to_string();
            }

            Ok(config)
        } else {
            let mut config = Config::default();

            config.node.network = match network_type {
                NetworkType::Mainnet => "mainnet".to_string(),
                NetworkType::Testnet => "testnet".to_string(),
            };
            config.storage.data_dir = data_dir.to_string_lossy().to_string();

            config.save_to_file(path)?;
            Ok(config)
        }
    }

    pub fn save_to_file(&self, path: &str) -> Result<(), Box<dyn std::error::Error>> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }
}
