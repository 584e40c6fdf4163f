//! Peer source replaying raw blocks from files
//!
//! Files matching a glob are read in lexicographic order. A `.hex` file holds
//! a hex-encoded block, anything else the raw bytes.

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use tessera_common::{BlockHash, BlockHeader, ChainNetwork, ZERO_HASH};
use tessera_module_chain_adapters::ChainAdapter;
use tessera_module_sync_orchestrator::network::{PeerEndpoint, PeerEvent, PeerRequest};
use tokio::task::JoinHandle;
use tracing::{debug, info};

struct ReplayBlock {
    header: BlockHeader,
    raw: Vec<u8>,
}

pub struct ReplaySource {
    blocks: Vec<ReplayBlock>,
}

impl ReplaySource {
    /// Load and check every block matching `pattern`
    pub fn load(pattern: &str, adapter: &dyn ChainAdapter, chain: &ChainNetwork) -> Result<Self> {
        let mut paths = glob::glob(pattern)?.collect::<Result<Vec<_>, _>>()?;
        paths.sort();

        let mut blocks = Vec::with_capacity(paths.len());
        for path in paths {
            let raw = read_block_file(&path)?;
            let block = adapter
                .decode_block(&raw)
                .and_then(|wire| adapter.convert_block(chain, &wire))
                .with_context(|| format!("Invalid block in {}", path.display()))?;
            blocks.push(ReplayBlock {
                header: BlockHeader {
                    hash: block.hash,
                    previous_block_hash: block.previous_block_hash,
                },
                raw,
            });
        }
        info!(chain = %chain, "Loaded {} blocks matching {pattern}", blocks.len());
        Ok(Self { blocks })
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Headers following the first locator hash we hold, or from the start
    fn headers_after(&self, locator: &[BlockHash], limit: usize) -> Vec<BlockHeader> {
        let start = locator
            .iter()
            .filter(|hash| hash.as_str() != ZERO_HASH)
            .find_map(|hash| self.blocks.iter().position(|b| b.header.hash == *hash))
            .map_or(0, |position| position + 1);
        self.blocks.iter().skip(start).take(limit).map(|b| b.header.clone()).collect()
    }

    fn answer(&self, request: PeerRequest) -> Option<PeerEvent> {
        match request {
            PeerRequest::Headers { locator, limit } => {
                let headers = self.headers_after(&locator, limit);
                Some(PeerEvent::Headers { locator, headers })
            }
            PeerRequest::Block { hash } => {
                let block = self.blocks.iter().find(|b| b.header.hash == hash)?;
                Some(PeerEvent::Block {
                    hash,
                    raw: block.raw.clone(),
                })
            }
            PeerRequest::Transaction { txid } => {
                debug!("No mempool to serve {txid} from");
                None
            }
        }
    }

    /// Answer requests until the client goes away
    pub fn serve(self, mut endpoint: PeerEndpoint) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(request) = endpoint.requests.recv().await {
                let Some(event) = self.answer(request) else {
                    continue;
                };
                if endpoint.events.send(event).is_err() {
                    break;
                }
            }
        })
    }
}

fn read_block_file(path: &Path) -> Result<Vec<u8>> {
    let bytes = fs::read(path).with_context(|| format!("Reading {}", path.display()))?;
    if path.extension().is_some_and(|ext| ext == "hex") {
        let text = String::from_utf8(bytes)?;
        return hex::decode(text.trim()).with_context(|| format!("Decoding {}", path.display()));
    }
    Ok(bytes)
}
