use crate::types::ChainNetwork;
use config::{Config, ConfigError};
use serde::Deserialize;

pub const CONFIG_KEY_CHAINS: &str = "chains";
pub const CONFIG_KEY_STORE: &str = "store";

/// Settings for one indexed (chain, network)
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ChainConfig {
    pub chain: String,
    pub network: String,
    /// Chain this one was forked from, sharing its history below `fork-height`
    #[serde(default)]
    pub parent_chain: Option<String>,
    #[serde(default)]
    pub fork_height: Option<u64>,
    /// Glob of raw block files served by the replay source
    #[serde(default)]
    pub block_files: Option<String>,
}

impl ChainConfig {
    pub fn chain_network(&self) -> ChainNetwork {
        ChainNetwork::new(&self.chain, &self.network)
    }

    /// Parent (chain, network) and fork height, when both are configured
    pub fn fork(&self) -> Option<(ChainNetwork, u64)> {
        match (&self.parent_chain, self.fork_height) {
            (Some(parent), Some(height)) => {
                Some((ChainNetwork::new(parent, &self.network), height))
            }
            _ => None,
        }
    }

    /// Every `[[chains]]` entry; none when the key is absent
    pub fn all_from_config(config: &Config) -> Result<Vec<ChainConfig>, ConfigError> {
        match config.get::<Vec<ChainConfig>>(CONFIG_KEY_CHAINS) {
            Err(ConfigError::NotFound(_)) => Ok(Vec::new()),
            chains => chains,
        }
    }
}

/// The table under `key` as a config of its own, empty when absent.
/// Module `try_load` constructors layer their defaults underneath it.
pub fn section(config: &Config, key: &str) -> Result<Config, ConfigError> {
    let mut builder = Config::builder();
    if let Ok(table) = config.get_table(key) {
        for (name, value) in table {
            builder = builder.set_override(name, value)?;
        }
    }
    builder.build()
}
