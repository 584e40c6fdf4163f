//! Tessera reorg manager
//!
//! Compares an incoming header's parent against the stored tip. On a
//! mismatch it walks back through stored blocks to the common ancestor and
//! rolls the store back above it.

use anyhow::Result;
use config::Config;
use serde::Deserialize;
use std::sync::Arc;
use tessera_common::store::ChainStore;
use tessera_common::{BlockHeader, BlockRecord, ChainNetwork, IndexerError, IndexerResult};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ReorgConfig {
    pub max_reorg_depth: u64,
}

impl ReorgConfig {
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

/// Where a candidate header stands relative to the stored chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReorgState {
    /// The header extends the tip
    Aligned,
    /// Nothing stored above the genesis floor
    Empty,
    /// The header's block is already processed
    AlreadyIndexed,
    /// The header forks off below the tip
    Diverged {
        /// Height of the common ancestor, if the walk found one
        ancestor: Option<u64>,
        /// First height to remove
        rollback_from: u64,
    },
}

pub struct ReorgManager {
    store: Arc<dyn ChainStore>,
    max_depth: u64,
}

impl ReorgManager {
    pub fn new(store: Arc<dyn ChainStore>, config: &ReorgConfig) -> Self {
        Self {
            store,
            max_depth: config.max_reorg_depth,
        }
    }

    /// Check `header` against the stored tip and roll back if it diverges.
    /// Returns whether a rollback happened.
    pub async fn detect_and_handle(
        &self,
        header: &BlockHeader,
        chain: &ChainNetwork,
    ) -> IndexerResult<bool> {
        let ReorgState::Diverged {
            ancestor,
            rollback_from,
        } = self.classify(header, chain).await?
        else {
            return Ok(false);
        };

        warn!(
            chain = %chain,
            hash = %header.hash,
            previous = %header.previous_block_hash,
            ancestor = ?ancestor,
            "Reorg detected, rolling back from height {rollback_from}"
        );
        let summary = self.store.rollback_from_height(chain, rollback_from).await?;
        info!(
            chain = %chain,
            blocks = summary.blocks_removed,
            transactions = summary.transactions_removed,
            coins_removed = summary.coins_removed,
            coins_unspent = summary.coins_unspent,
            "Rolled back from height {rollback_from}"
        );
        Ok(true)
    }

    /// Work out what `header` means for the stored chain without changing it
    pub async fn classify(
        &self,
        header: &BlockHeader,
        chain: &ChainNetwork,
    ) -> IndexerResult<ReorgState> {
        let Some(tip) = self.store.get_local_tip(chain).await? else {
            return Ok(ReorgState::Empty);
        };
        if tip.hash == header.previous_block_hash {
            return Ok(ReorgState::Aligned);
        }
        if tip.height == 0 {
            return Ok(ReorgState::Empty);
        }
        let known = self.store.get_block(chain, &header.hash).await?;
        if known.is_some_and(|block| block.processed) {
            debug!(chain = %chain, hash = %header.hash, "Header already indexed");
            return Ok(ReorgState::AlreadyIndexed);
        }
        self.find_ancestor(header, chain, tip).await
    }

    async fn find_ancestor(
        &self,
        header: &BlockHeader,
        chain: &ChainNetwork,
        tip: BlockRecord,
    ) -> IndexerResult<ReorgState> {
        let tip_height = tip.height;
        let mut current = tip;
        let mut depth = 0;
        loop {
            if current.hash == header.previous_block_hash {
                return Ok(ReorgState::Diverged {
                    ancestor: Some(current.height),
                    rollback_from: current.height + 1,
                });
            }
            if depth >= self.max_depth {
                return Err(IndexerError::ReorgAmbiguous {
                    chain: chain.to_string(),
                    hash: header.hash.clone(),
                    depth: self.max_depth,
                });
            }
            match self.store.get_block(chain, &current.previous_block_hash).await? {
                Some(parent) => {
                    current = parent;
                    depth += 1;
                }
                None => {
                    warn!(
                        chain = %chain,
                        previous = %header.previous_block_hash,
                        "Common ancestor not in stored history, dropping the tip"
                    );
                    return Ok(ReorgState::Diverged {
                        ancestor: None,
                        rollback_from: tip_height,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use tessera_common::ops::{CoinMintOp, CoinSpendOp, TxOp};
    use tessera_common::{
        BlockExtension, CoinKey, Height, SpendState, TransactionRecord, TxExtension,
    };
    use tessera_module_chain_store::stores::memory::MemoryStore;

    fn chain() -> ChainNetwork {
        ChainNetwork::new("BTC", "regtest")
    }

    fn hash(n: u64) -> String {
        format!("{n:064x}")
    }

    fn header(hash: &str, previous_block_hash: &str) -> BlockHeader {
        BlockHeader {
            hash: hash.to_string(),
            previous_block_hash: previous_block_hash.to_string(),
        }
    }

    fn mint(txid: &str, height: u64) -> CoinMintOp {
        CoinMintOp {
            key: CoinKey::new(&chain(), txid, 0),
            mint_height: Height::Confirmed(height),
            value: 50,
            address: Some("addr".to_string()),
            script: Some(vec![0x51]),
            wallets: BTreeSet::new(),
            spend: SpendState::Unspent,
        }
    }

    fn tx(txid: &str, height: u64) -> TxOp {
        TxOp {
            record: TransactionRecord {
                chain: "BTC".to_string(),
                network: "regtest".to_string(),
                txid: txid.to_string(),
                block_height: Height::Confirmed(height),
                block_hash: Some(hash(height)),
                block_time: height,
                block_time_normalized: height,
                size: 100,
                fee: None,
                wallets: BTreeSet::new(),
                extension: TxExtension::Utxo {
                    locktime: 0,
                    coinbase: false,
                },
            },
        }
    }

    /// Blocks 1..=top linked by hash, one coinbase-style tx and coin each
    async fn seeded_store(top: u64) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        for height in 1..=top {
            let block = BlockRecord {
                chain: "BTC".to_string(),
                network: "regtest".to_string(),
                height,
                hash: hash(height),
                previous_block_hash: hash(height - 1),
                next_block_hash: (height < top).then(|| hash(height + 1)),
                version: 1,
                merkle_root: hash(0),
                time: height * 600,
                time_normalized: height * 600,
                nonce: 0,
                bits: 0,
                transaction_count: 1,
                size: 250,
                reward: 50,
                processed: true,
                extension: BlockExtension::None,
            };
            store.upsert_block(&block).await.unwrap();
            let txid = format!("tx{height}");
            store.bulk_write_coins(&[mint(&txid, height)], &[]).await.unwrap();
            store.bulk_write_transactions(&[tx(&txid, height)]).await.unwrap();
        }
        store
    }

    fn manager(store: &Arc<MemoryStore>, max_reorg_depth: u64) -> ReorgManager {
        ReorgManager::new(store.clone(), &ReorgConfig { max_reorg_depth })
    }

    async fn spend(store: &MemoryStore, mint_txid: &str, txid: &str, height: u64) {
        let op = CoinSpendOp {
            key: CoinKey::new(&chain(), mint_txid, 0),
            spent_txid: txid.to_string(),
            spent_height: Height::Confirmed(height),
            prune_script: false,
        };
        store.bulk_write_coins(&[], &[op]).await.unwrap();
    }

    #[test]
    fn default_depth_is_one_hundred() {
        let config = ReorgConfig::try_load(&Config::builder().build().unwrap()).unwrap();
        assert_eq!(config.max_reorg_depth, 100);
    }

    #[tokio::test]
    async fn header_extending_the_tip_is_aligned() {
        let store = seeded_store(10).await;
        let manager = manager(&store, 100);
        let candidate = header(&hash(11), &hash(10));

        assert_eq!(manager.classify(&candidate, &chain()).await.unwrap(), ReorgState::Aligned);
        assert!(!manager.detect_and_handle(&candidate, &chain()).await.unwrap());
        assert_eq!(store.list_blocks(&chain()).await.len(), 10);
    }

    #[tokio::test]
    async fn empty_store_never_rolls_back() {
        let store = Arc::new(MemoryStore::new());
        let manager = manager(&store, 100);
        let candidate = header(&hash(1), "unknown");

        assert_eq!(manager.classify(&candidate, &chain()).await.unwrap(), ReorgState::Empty);
        assert!(!manager.detect_and_handle(&candidate, &chain()).await.unwrap());
    }

    #[tokio::test]
    async fn already_indexed_header_is_not_a_reorg() {
        let store = seeded_store(10).await;
        let manager = manager(&store, 100);

        let candidate = header(&hash(5), &hash(4));
        assert_eq!(
            manager.classify(&candidate, &chain()).await.unwrap(),
            ReorgState::AlreadyIndexed
        );
        assert!(!manager.detect_and_handle(&candidate, &chain()).await.unwrap());
    }

    #[tokio::test]
    async fn rolls_back_above_the_common_ancestor() {
        let store = seeded_store(10).await;
        spend(&store, "tx5", "tx9", 9).await;
        spend(&store, "tx3", "tx6", 6).await;
        let manager = manager(&store, 100);

        let candidate = header("fork8", &hash(7));
        assert_eq!(
            manager.classify(&candidate, &chain()).await.unwrap(),
            ReorgState::Diverged {
                ancestor: Some(7),
                rollback_from: 8,
            }
        );
        assert!(manager.detect_and_handle(&candidate, &chain()).await.unwrap());

        let chain = chain();
        let heights: Vec<_> = store.list_blocks(&chain).await.iter().map(|b| b.height).collect();
        assert_eq!(heights, (1..=7).collect::<Vec<_>>());
        let tip = store.get_local_tip(&chain).await.unwrap().unwrap();
        assert_eq!(tip.hash, hash(7));
        assert_eq!(tip.next_block_hash, None);

        assert_eq!(store.get_coin(&CoinKey::new(&chain, "tx9", 0)).await.unwrap(), None);
        assert_eq!(store.get_transaction(&chain, "tx8").await.unwrap(), None);

        let coin = store.get_coin(&CoinKey::new(&chain, "tx5", 0)).await.unwrap().unwrap();
        assert_eq!(coin.spend, SpendState::Unspent);
        assert_eq!(coin.mint_height, Height::Confirmed(5));
        assert_eq!(coin.value, 50);

        let coin = store.get_coin(&CoinKey::new(&chain, "tx3", 0)).await.unwrap().unwrap();
        assert_eq!(coin.spend, SpendState::SpentAtHeight("tx6".to_string(), 6));
    }

    #[tokio::test]
    async fn unknown_parent_drops_only_the_tip() {
        let store = seeded_store(3).await;
        let manager = manager(&store, 100);

        let candidate = header("other", "never-seen");
        assert!(manager.detect_and_handle(&candidate, &chain()).await.unwrap());

        let tip = store.get_local_tip(&chain()).await.unwrap().unwrap();
        assert_eq!(tip.height, 2);
    }

    #[tokio::test]
    async fn walk_beyond_the_bound_is_ambiguous() {
        let store = seeded_store(10).await;
        let manager = manager(&store, 3);

        let candidate = header("other", &hash(2));
        let err = manager.detect_and_handle(&candidate, &chain()).await.unwrap_err();
        assert!(matches!(err, IndexerError::ReorgAmbiguous { depth: 3, .. }));
        assert_eq!(store.list_blocks(&chain()).await.len(), 10);
    }
}
