use anyhow::Result;
use config::Config;
use std::time::Duration;

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SyncConfig {
    pub flush_block_threshold: usize,
    pub flush_mint_threshold: usize,
    pub request_retry_interval_ms: u64,
    pub parent_wait_interval_ms: u64,
    pub inv_cache_size: u64,
    pub headers_per_request: usize,
}

impl SyncConfig {
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

    pub fn request_retry_interval(&self) -> Duration {
        Duration::from_millis(self.request_retry_interval_ms)
    }

    pub fn parent_wait_interval(&self) -> Duration {
        Duration::from_millis(self.parent_wait_interval_ms)
    }
}
