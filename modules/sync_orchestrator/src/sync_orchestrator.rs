//! Tessera sync orchestrator
//! Drives header and block ingestion for one (chain, network)

pub mod configuration;
pub mod locator;
pub mod network;

use anyhow::{bail, Result};
use mini_moka::sync::Cache;
use std::sync::Arc;
use tessera_common::messages::IndexerEvent;
use tessera_common::ops::OpBatch;
use tessera_common::store::{ChainStore, WalletResolver};
use tessera_common::{BlockHeader, ChainNetwork, IndexerError};
use tessera_module_batch_builder::{BatchBuilderConfig, BatchOpBuilder, BlockWriter};
use tessera_module_chain_adapters::ChainAdapter;
use tessera_module_reorg_manager::{ReorgConfig, ReorgManager, ReorgState};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::{select, time};
use tracing::{debug, error, info, warn};

pub use configuration::SyncConfig;
use locator::{select_locator, LOCATOR_DEPTH};
use network::{Inventory, PeerClient, PeerEvent};

/// Settings for every part of one sync instance
#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub sync: SyncConfig,
    pub builder: BatchBuilderConfig,
    pub reorg: ReorgConfig,
}

/// What a sync instance talks to
pub struct SyncDependencies {
    pub store: Arc<dyn ChainStore>,
    pub wallets: Arc<dyn WalletResolver>,
    pub adapter: Arc<dyn ChainAdapter>,
    pub peer: PeerClient,
    pub events: broadcast::Sender<IndexerEvent>,
}

/// Running orchestrator task
pub struct SyncHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<Result<()>>,
}

impl SyncHandle {
    /// Ask the orchestrator to stop and wait for it
    pub async fn stop(self) -> Result<()> {
        let _ = self.stop.send(true);
        self.task.await?
    }

    /// Wait for the orchestrator to finish on its own
    pub async fn join(self) -> Result<()> {
        self.task.await?
    }
}

pub struct SyncOrchestrator {
    chain: ChainNetwork,
    config: SyncConfig,
    fork: Option<(ChainNetwork, u64)>,
    store: Arc<dyn ChainStore>,
    adapter: Arc<dyn ChainAdapter>,
    peer: PeerClient,
    builder: BatchOpBuilder,
    writer: BlockWriter,
    reorg: ReorgManager,
    events: broadcast::Sender<IndexerEvent>,
    /// Block and transaction hashes already handled
    seen: Cache<String, ()>,
}

impl SyncOrchestrator {
    pub fn new(
        chain: ChainNetwork,
        fork: Option<(ChainNetwork, u64)>,
        settings: &SyncSettings,
        deps: SyncDependencies,
    ) -> Self {
        let builder = BatchOpBuilder::new(
            chain.clone(),
            deps.store.clone(),
            deps.wallets,
            &settings.builder,
            fork.clone(),
        );
        Self {
            writer: BlockWriter::new(deps.store.clone(), deps.events.clone()),
            reorg: ReorgManager::new(deps.store.clone(), &settings.reorg),
            seen: Cache::new(settings.sync.inv_cache_size),
            config: settings.sync.clone(),
            store: deps.store,
            adapter: deps.adapter,
            peer: deps.peer,
            events: deps.events,
            chain,
            fork,
            builder,
        }
    }

    /// Run until stopped: initial sync, then live blocks and mempool
    /// transactions from `announcements`
    pub fn start(self, announcements: mpsc::UnboundedReceiver<PeerEvent>) -> SyncHandle {
        let (stop, stopped) = watch::channel(false);
        let task = tokio::spawn(self.run(announcements, stopped));
        SyncHandle { stop, task }
    }

    async fn run(
        mut self,
        mut announcements: mpsc::UnboundedReceiver<PeerEvent>,
        mut stop: watch::Receiver<bool>,
    ) -> Result<()> {
        debug!(chain = %self.chain, "Started sync");
        if !self.wait_for_parent(&mut stop).await? {
            return Ok(());
        }
        if !self.sync_until_done(&mut stop).await? {
            return Ok(());
        }

        loop {
            select! {
                _ = stop.changed() => break,
                event = announcements.recv() => {
                    let Some(event) = event else {
                        info!(chain = %self.chain, "Peer source closed");
                        break;
                    };
                    if let Err(e) = self.handle_announcement(event).await {
                        error!(chain = %self.chain, "Error handling announcement: {e:#}");
                        if !self.sync_until_done(&mut stop).await? {
                            break;
                        }
                    }
                }
            }
        }
        info!(chain = %self.chain, "Stopped sync");
        Ok(())
    }

    /// A forked chain shares its parent's history below the fork height, so
    /// it waits for the parent to index that far. Returns false if stopped.
    pub async fn wait_for_parent(&self, stop: &mut watch::Receiver<bool>) -> Result<bool> {
        let Some((parent, fork_height)) = &self.fork else {
            return Ok(true);
        };
        let tip = self.store.get_local_tip(&self.chain).await?;
        if tip.is_some_and(|tip| tip.height >= *fork_height) {
            return Ok(true);
        }
        loop {
            let parent_tip = self.store.get_local_tip(parent).await?;
            if parent_tip.is_some_and(|tip| tip.height >= *fork_height) {
                return Ok(true);
            }
            info!(chain = %self.chain, "Waiting until {parent} syncs to height {fork_height}");
            select! {
                _ = time::sleep(self.config.parent_wait_interval()) => {}
                _ = stop.changed() => return Ok(false),
            }
        }
    }

    /// Sync passes until one completes, restarting after failures.
    /// Returns false if stopped first; an ambiguous reorg is fatal.
    async fn sync_until_done(&mut self, stop: &mut watch::Receiver<bool>) -> Result<bool> {
        loop {
            if *stop.borrow() {
                return Ok(false);
            }
            match self.sync().await {
                Ok(()) => return Ok(true),
                Err(e) if is_fatal(&e) => {
                    error!(chain = %self.chain, "Sync halted: {e:#}");
                    return Err(e);
                }
                Err(e) => {
                    error!(chain = %self.chain, "Error syncing, restarting: {e:#}");
                    select! {
                        _ = time::sleep(self.config.request_retry_interval()) => {}
                        _ = stop.changed() => return Ok(false),
                    }
                }
            }
        }
    }

    /// One sync pass: fetch headers from the local tip until the peer has
    /// no more. Nothing from an unfinished batch is written on failure.
    pub async fn sync(&mut self) -> Result<()> {
        self.builder.reset();
        let initial_sync_complete = self.store.is_initial_sync_complete(&self.chain).await?;
        self.builder.set_initial_sync_complete(initial_sync_complete);

        loop {
            let recent = self.store.get_recent_block_hashes(&self.chain, LOCATOR_DEPTH).await?;
            let headers = self
                .peer
                .get_headers(select_locator(&recent), self.config.headers_per_request)
                .await?;
            if headers.is_empty() {
                break;
            }
            info!(chain = %self.chain, "Syncing {} blocks", headers.len());
            self.sync_headers(&headers).await?;
        }

        if !initial_sync_complete {
            self.store.set_initial_sync_complete(&self.chain).await?;
            self.builder.set_initial_sync_complete(true);
            let _ = self.events.send(IndexerEvent::SyncComplete(self.chain.clone()));
        }
        info!(chain = %self.chain, "Up to date");
        Ok(())
    }

    async fn sync_headers(&mut self, headers: &[BlockHeader]) -> Result<()> {
        let mut batch = OpBatch::new();
        let mut previous: Option<&BlockHeader> = None;

        for header in headers {
            match previous {
                None => {
                    if self.reorg.detect_and_handle(header, &self.chain).await? {
                        self.builder.reset();
                    }
                }
                Some(previous) if header.previous_block_hash != previous.hash => {
                    bail!("Header {} does not extend {}", header.hash, previous.hash);
                }
                Some(_) => {}
            }

            let raw = self.peer.get_block(&header.hash).await?;
            self.seen.insert(header.hash.clone(), ());
            let converted = self.adapter.convert_raw_block(&self.chain, &raw)?;
            if converted.block.hash != header.hash {
                bail!("Asked for block {} but got {}", header.hash, converted.block.hash);
            }
            let record = self
                .builder
                .build_block_ops(&mut batch, &converted.block, &converted.transactions)
                .await?;
            debug!(
                chain = %self.chain,
                height = record.height,
                "Mint queue {}",
                batch.mint_ops.len()
            );

            if batch.blocks.len() > self.config.flush_block_threshold
                || batch.mint_ops.len() > self.config.flush_mint_threshold
            {
                self.flush(&mut batch).await?;
            }
            previous = Some(header);
        }
        self.flush(&mut batch).await
    }

    async fn flush(&mut self, batch: &mut OpBatch) -> Result<()> {
        if batch.blocks.is_empty() {
            return Ok(());
        }
        let batch = std::mem::take(batch);
        info!(chain = %self.chain, "Writing {} blocks", batch.blocks.len());
        self.writer.process_block_ops(&batch).await?;
        Ok(())
    }

    /// React to an event no request was waiting for
    pub async fn handle_announcement(&mut self, event: PeerEvent) -> Result<()> {
        match event {
            PeerEvent::Inventory(items) => {
                for item in items {
                    match item {
                        Inventory::Block(hash) if !self.seen.contains_key(&hash) => {
                            let raw = self.peer.get_block(&hash).await?;
                            self.process_live_block(&hash, &raw).await?;
                        }
                        Inventory::Transaction(txid) if !self.seen.contains_key(&txid) => {
                            let raw = self.peer.get_transaction(&txid).await?;
                            self.process_mempool_tx(&txid, &raw).await;
                        }
                        _ => {}
                    }
                }
            }
            PeerEvent::Block { hash, raw } => {
                if !self.seen.contains_key(&hash) {
                    self.process_live_block(&hash, &raw).await?;
                }
            }
            PeerEvent::Transaction { txid, raw } => {
                if !self.seen.contains_key(&txid) {
                    self.process_mempool_tx(&txid, &raw).await;
                }
            }
            PeerEvent::Headers { .. } => {}
        }
        Ok(())
    }

    async fn process_live_block(&mut self, hash: &str, raw: &[u8]) -> Result<()> {
        self.seen.insert(hash.to_string(), ());
        let converted = self.adapter.convert_raw_block(&self.chain, raw)?;
        let header = BlockHeader {
            hash: converted.block.hash.clone(),
            previous_block_hash: converted.block.previous_block_hash.clone(),
        };
        if self.reorg.classify(&header, &self.chain).await? == ReorgState::AlreadyIndexed {
            debug!(chain = %self.chain, "Block {hash} is already indexed");
            return Ok(());
        }
        if self.reorg.detect_and_handle(&header, &self.chain).await? {
            self.builder.reset();
            bail!("Reorg at block {hash}");
        }

        let mut batch = OpBatch::new();
        let record = self
            .builder
            .build_block_ops(&mut batch, &converted.block, &converted.transactions)
            .await?;
        self.writer.process_block_ops(&batch).await?;
        info!(chain = %self.chain, height = record.height, "Added block {hash}");
        Ok(())
    }

    /// Malformed or unwritable mempool transactions are logged and skipped
    async fn process_mempool_tx(&mut self, txid: &str, raw: &[u8]) {
        self.seen.insert(txid.to_string(), ());
        let tx = match self.adapter.convert_raw_tx(&self.chain, raw) {
            Ok(tx) => tx,
            Err(e) => {
                warn!(chain = %self.chain, "Skipping transaction {txid}: {e}");
                return;
            }
        };
        let seen_at = chrono::Utc::now().timestamp_millis().max(0) as u64;
        let result = match self.builder.build_mempool_ops(&[tx], seen_at).await {
            Ok(batch) => self.writer.write_unconfirmed(&batch).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!(chain = %self.chain, "Could not import transaction {txid}: {e}");
        }
    }
}

fn is_fatal(error: &anyhow::Error) -> bool {
    matches!(error.downcast_ref::<IndexerError>(), Some(IndexerError::ReorgAmbiguous { .. }))
}
