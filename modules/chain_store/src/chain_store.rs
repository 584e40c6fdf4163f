//! Tessera chain store
//! Persistence gateway for blocks, transactions and coins

pub mod stores;

use anyhow::{bail, Result};
use config::Config;
use serde::Deserialize;
use std::sync::Arc;
use tessera_common::store::{ChainStore, WalletResolver};
use tracing::info;

use crate::stores::{fjall::FjallStore, memory::MemoryStore};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct StoreConfig {
    #[serde(rename = "type")]
    pub store_type: String,
    pub database_path: String,
    pub clear_on_start: bool,
}

impl StoreConfig {
    pub fn try_load(config: &Config) -> Result<Self> {
        let full_config = Config::builder()
            .add_source(config::File::from_str(
                include_str!("../config.default.toml"),
                config::FileFormat::Toml,
            ))
            .add_source(config.clone())
            .build()?;
        Ok(full_config.try_deserialize()?)
    }
}

/// One backend seen through both of its interfaces
#[derive(Clone)]
pub struct Stores {
    pub chain: Arc<dyn ChainStore>,
    pub wallets: Arc<dyn WalletResolver>,
}

impl Stores {
    fn from_backend<S>(store: Arc<S>) -> Self
    where
        S: ChainStore + WalletResolver + 'static,
    {
        Self {
            chain: store.clone(),
            wallets: store,
        }
    }
}

/// Build the store named by the `type` key
pub fn create_store(config: &StoreConfig) -> Result<Stores> {
    let stores = match config.store_type.as_str() {
        "memory" => {
            info!("Storing chain data in memory");
            Stores::from_backend(Arc::new(MemoryStore::new()))
        }
        "fjall" => Stores::from_backend(Arc::new(FjallStore::new(
            &config.database_path,
            config.clear_on_start,
        )?)),
        store_type => bail!("Unknown store type {store_type}"),
    };
    Ok(stores)
}
