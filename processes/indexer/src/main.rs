//! Tessera indexer process
//! Runs one sync orchestrator per configured chain against a shared store

use anyhow::{bail, Result};
use clap::Parser;
use config::{Config, Environment, File};
use tessera_common::configuration::{section, ChainConfig, CONFIG_KEY_STORE};
use tessera_common::messages::IndexerEvent;
use tessera_module_batch_builder::BatchBuilderConfig;
use tessera_module_chain_adapters::AdapterRegistry;
use tessera_module_chain_store::{create_store, StoreConfig};
use tessera_module_reorg_manager::ReorgConfig;
use tessera_module_sync_orchestrator::network::PeerClient;
use tessera_module_sync_orchestrator::{
    SyncConfig, SyncDependencies, SyncOrchestrator, SyncSettings,
};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

mod replay;

use crate::replay::ReplaySource;

const CONFIG_KEY_SYNC: &str = "sync";
const CONFIG_KEY_BATCH_BUILDER: &str = "batch-builder";
const CONFIG_KEY_REORG: &str = "reorg";

#[derive(Debug, clap::Parser)]
struct Args {
    #[arg(long, value_name = "PATH", default_values_t = vec!["indexer.toml".to_string()])]
    config: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Get arguments and config
    let args = Args::parse();
    tracing_subscriber::fmt().with_env_filter("info,fjall=warn").init();
    let mut builder = Config::builder();
    for file in &args.config {
        builder = builder.add_source(File::with_name(file));
    }
    let config = builder.add_source(Environment::with_prefix("TESSERA")).build()?;

    let stores = create_store(&StoreConfig::try_load(&section(&config, CONFIG_KEY_STORE)?)?)?;
    let settings = SyncSettings {
        sync: SyncConfig::try_load(&section(&config, CONFIG_KEY_SYNC)?)?,
        builder: BatchBuilderConfig::try_load(&section(&config, CONFIG_KEY_BATCH_BUILDER)?)?,
        reorg: ReorgConfig::try_load(&section(&config, CONFIG_KEY_REORG)?)?,
    };

    let chains = ChainConfig::all_from_config(&config)?;
    if chains.is_empty() {
        bail!("No chains configured");
    }

    let (events, _) = broadcast::channel(1024);
    tokio::spawn(log_events(events.subscribe()));

    let registry = AdapterRegistry::new();
    let mut handles = Vec::new();
    for chain_config in chains {
        let chain = chain_config.chain_network();
        let adapter = registry.get(&chain.chain)?;
        let Some(pattern) = &chain_config.block_files else {
            bail!("No block source configured for {chain}");
        };
        let source = ReplaySource::load(pattern, adapter.as_ref(), &chain)?;
        if source.is_empty() {
            warn!(chain = %chain, "No blocks match {pattern}");
        }

        let (peer, endpoint, announcements) =
            PeerClient::connect(settings.sync.request_retry_interval());
        source.serve(endpoint);

        let orchestrator = SyncOrchestrator::new(
            chain,
            chain_config.fork(),
            &settings,
            SyncDependencies {
                store: stores.chain.clone(),
                wallets: stores.wallets.clone(),
                adapter,
                peer,
                events: events.clone(),
            },
        );
        handles.push(orchestrator.start(announcements));
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    for handle in handles {
        if let Err(e) = handle.stop().await {
            warn!("Sync ended with error: {e:#}");
        }
    }
    Ok(())
}

async fn log_events(mut events: broadcast::Receiver<IndexerEvent>) {
    loop {
        match events.recv().await {
            Ok(IndexerEvent::Block(block)) => {
                let chain = block.chain_network();
                debug!(chain = %chain, height = block.height, "Block {}", block.hash)
            }
            Ok(IndexerEvent::Transaction(tx)) => debug!("Transaction {}", tx.txid),
            Ok(IndexerEvent::SyncComplete(chain)) => info!("Initial sync of {chain} complete"),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!("Event log skipped {skipped} events")
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
