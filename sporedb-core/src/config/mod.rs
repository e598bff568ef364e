//! Node configuration.
//!
//! Configuration is loaded from a JSON file and may be overridden by
//! `SPOREDB_*` environment variables. The keyring password is never part
//! of the file: it is read from the `PASSWORD` environment variable by the
//! control plane.

use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::core_myc::protocol::Node;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to read configuration file: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid configuration file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Main node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Identity of the local node, unique across the mycelium.
    pub identity: String,

    /// Path of the armored keyring file.
    pub keyring: PathBuf,

    /// Path of the store directory.
    pub store: PathBuf,

    /// Directory holding the JSON policy files loaded at startup.
    pub policies_dir: PathBuf,

    /// Client API listen address. Empty disables the API endpoint.
    pub api_listen: String,

    /// Peer-to-peer listen address. Empty disables inbound connections.
    pub p2p_listen: String,

    /// Bootstrap peers. A connection is attempted for each entry.
    pub peers: Vec<Node>,

    /// Minimum identical answers required by a key recovery.
    pub recovery_quorum: usize,

    /// Target number of connected peers maintained by the connector loop.
    pub connectivity: usize,

    /// Number of directory nodes gossiped on each membership tick.
    pub fanout: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            identity: String::new(),
            keyring: PathBuf::from("keyring"),
            store: PathBuf::from("store"),
            policies_dir: PathBuf::from("policies"),
            api_listen: "127.0.0.1:4200".to_string(),
            p2p_listen: "127.0.0.1:4300".to_string(),
            peers: Vec::new(),
            recovery_quorum: 2,
            connectivity: 10,
            fanout: 10,
        }
    }
}

impl NodeConfig {
    /// Load the configuration from a JSON file, then apply environment
    /// overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let mut config: NodeConfig = serde_json::from_str(&raw)?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Apply `SPOREDB_*` environment overrides.
    pub fn apply_env(&mut self) {
        if let Ok(identity) = env::var("SPOREDB_IDENTITY") {
            self.identity = identity;
        }
        if let Ok(listen) = env::var("SPOREDB_API_LISTEN") {
            self.api_listen = listen;
        }
        if let Ok(listen) = env::var("SPOREDB_P2P_LISTEN") {
            self.p2p_listen = listen;
        }
        if let Ok(store) = env::var("SPOREDB_STORE") {
            self.store = PathBuf::from(store);
        }
        if let Ok(keyring) = env::var("SPOREDB_KEYRING") {
            self.keyring = PathBuf::from(keyring);
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.identity.is_empty() {
            return Err(ConfigError::Invalid(
                "identity must not be empty".to_string(),
            ));
        }
        if self.connectivity == 0 {
            return Err(ConfigError::Invalid(
                "connectivity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
