//! Tessera batch builder
//! Turns normalised blocks into idempotent store operations and writes them

pub mod in_flight;
pub mod writer;

use anyhow::Result;
use config::Config;
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tessera_common::ops::{BlockOp, CoinMintOp, CoinSpendOp, OpBatch, PreviousBlockPatch, TxOp};
use tessera_common::store::{ChainStore, WalletResolver};
use tessera_common::{
    BlockRecord, ChainNetwork, CoinKey, Height, IndexerResult, NormalizedBlock,
    NormalizedTransaction, SpendState, TransactionRecord, WalletId,
};
use tracing::{debug, error};

pub use in_flight::InFlightSpendResolver;
pub use writer::BlockWriter;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BatchBuilderConfig {
    /// Drop a coin's script once it is spent in a confirmed block
    pub prune_spent_scripts: bool,
}

impl BatchBuilderConfig {
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

/// Where the transactions being converted were seen
struct Placement<'a> {
    height: Height,
    block_hash: Option<&'a str>,
    time: u64,
    time_normalized: u64,
}

/// Builds block, coin and transaction ops for one (chain, network).
///
/// Holds the in-flight spend index for the current sync pass; call
/// [`BatchOpBuilder::reset`] when a pass starts over.
pub struct BatchOpBuilder {
    chain: ChainNetwork,
    store: Arc<dyn ChainStore>,
    wallets: Arc<dyn WalletResolver>,
    prune_spent_scripts: bool,
    /// Parent chain and the height this chain forked from it
    fork: Option<(ChainNetwork, u64)>,
    initial_sync_complete: bool,
    resolver: InFlightSpendResolver,
}

impl BatchOpBuilder {
    pub fn new(
        chain: ChainNetwork,
        store: Arc<dyn ChainStore>,
        wallets: Arc<dyn WalletResolver>,
        config: &BatchBuilderConfig,
        fork: Option<(ChainNetwork, u64)>,
    ) -> Self {
        Self {
            chain,
            store,
            wallets,
            prune_spent_scripts: config.prune_spent_scripts,
            fork,
            initial_sync_complete: false,
            resolver: InFlightSpendResolver::new(),
        }
    }

    pub fn chain(&self) -> &ChainNetwork {
        &self.chain
    }

    /// Forget every in-flight mint
    pub fn reset(&mut self) {
        self.resolver.clear();
    }

    /// Wallet tagging only runs once historical sync has caught up
    pub fn set_initial_sync_complete(&mut self, complete: bool) {
        self.initial_sync_complete = complete;
    }

    /// Append the ops for `block` to `batch`.
    ///
    /// The previous block is the batch's last block when it is the parent,
    /// otherwise it is looked up in the store. Returns the finalised record.
    pub async fn build_block_ops(
        &mut self,
        batch: &mut OpBatch,
        block: &NormalizedBlock,
        transactions: &[NormalizedTransaction],
    ) -> IndexerResult<BlockRecord> {
        if batch.is_empty() {
            self.resolver.clear();
        }
        let previous = match batch.last_block() {
            Some(last) if last.hash == block.previous_block_hash => Some(last.clone()),
            _ => self.store.get_block(&self.chain, &block.previous_block_hash).await?,
        };

        let height = match (&previous, block.height) {
            (Some(previous), _) => previous.height + 1,
            (None, Some(reported)) => reported,
            (None, None) => 1,
        };
        let time_normalized = match &previous {
            Some(previous) if block.time <= previous.time_normalized => {
                previous.time_normalized + 1
            }
            _ => block.time,
        };
        debug!(chain = %self.chain, height, hash = %block.hash, "Setting block height");

        let record = BlockRecord {
            chain: self.chain.chain.clone(),
            network: self.chain.network.clone(),
            height,
            hash: block.hash.clone(),
            previous_block_hash: block.previous_block_hash.clone(),
            next_block_hash: None,
            version: block.version,
            merkle_root: block.merkle_root.clone(),
            time: block.time,
            time_normalized,
            nonce: block.nonce,
            bits: block.bits,
            transaction_count: block.transaction_count,
            size: block.size,
            reward: block.reward,
            processed: false,
            extension: block.extension.clone(),
        };
        let previous_block_patch = previous.map(|previous| PreviousBlockPatch {
            hash: previous.hash,
            next_block_hash: block.hash.clone(),
        });

        let placement = Placement {
            height: Height::Confirmed(height),
            block_hash: Some(&block.hash),
            time: block.time,
            time_normalized,
        };
        let mint_start = batch.mint_ops.len();
        let spend_start = batch.spend_ops.len();
        let tx_start = batch.tx_ops.len();

        let mut resolver = std::mem::take(&mut self.resolver);
        let tag_wallets = self.initial_sync_complete;
        let result = self
            .append_transaction_ops(batch, &mut resolver, transactions, &placement, tag_wallets)
            .await;
        self.resolver = resolver;
        result?;

        batch.blocks.push(BlockOp {
            block: record.clone(),
            previous_block_patch,
            mint_ops: mint_start..batch.mint_ops.len(),
            spend_ops: spend_start..batch.spend_ops.len(),
            tx_ops: tx_start..batch.tx_ops.len(),
        });
        Ok(record)
    }

    /// Ops for unconfirmed transactions, in a batch of their own
    pub async fn build_mempool_ops(
        &self,
        transactions: &[NormalizedTransaction],
        seen_at: u64,
    ) -> IndexerResult<OpBatch> {
        let mut batch = OpBatch::new();
        let mut resolver = InFlightSpendResolver::new();
        let placement = Placement {
            height: Height::Mempool,
            block_hash: None,
            time: seen_at,
            time_normalized: seen_at,
        };
        self.append_transaction_ops(&mut batch, &mut resolver, transactions, &placement, true)
            .await?;
        Ok(batch)
    }

    async fn append_transaction_ops(
        &self,
        batch: &mut OpBatch,
        resolver: &mut InFlightSpendResolver,
        transactions: &[NormalizedTransaction],
        placement: &Placement<'_>,
        tag_wallets: bool,
    ) -> IndexerResult<()> {
        let below_fork = match (&self.fork, placement.height) {
            (Some((parent, fork_height)), Height::Confirmed(height)) if height < *fork_height => {
                Some((parent, height, *fork_height))
            }
            _ => None,
        };

        // Outputs the parent chain already spent before the fork are never minted here
        let parent_spent: HashSet<CoinKey> = match below_fork {
            Some((parent, height, fork_height)) => self
                .store
                .find_spent_coins_minted_at(parent, height, fork_height)
                .await?
                .into_iter()
                .map(|coin| CoinKey::new(&self.chain, coin.key.mint_txid, coin.key.mint_index))
                .collect(),
            None => HashSet::new(),
        };

        let mint_start = batch.mint_ops.len();
        for tx in transactions {
            for (index, output) in tx.outputs.iter().enumerate() {
                let key = CoinKey::new(&self.chain, &tx.txid, index as u32);
                if parent_spent.contains(&key) {
                    continue;
                }
                batch.mint_ops.push(CoinMintOp {
                    key,
                    mint_height: placement.height,
                    value: output.value,
                    address: output.address.clone(),
                    script: output.script.clone(),
                    wallets: BTreeSet::new(),
                    spend: SpendState::Unspent,
                });
            }
        }

        if tag_wallets {
            self.tag_mint_wallets(&mut batch.mint_ops[mint_start..]).await?;
        }

        if below_fork.is_none() {
            self.append_spend_ops(batch, resolver, transactions, placement.height);
        }

        let tx_wallets = if tag_wallets {
            let txids: Vec<_> = transactions.iter().map(|tx| tx.txid.clone()).collect();
            self.store.aggregate_tx_wallets(&self.chain, &txids).await?
        } else {
            HashMap::new()
        };
        for tx in transactions {
            let mut wallets: BTreeSet<WalletId> =
                tx_wallets.get(&tx.txid).cloned().unwrap_or_default();
            if tag_wallets {
                for op in &batch.mint_ops[mint_start..] {
                    if op.key.mint_txid == tx.txid {
                        wallets.extend(op.wallets.iter().cloned());
                    }
                }
            }
            batch.tx_ops.push(TxOp {
                record: TransactionRecord {
                    chain: self.chain.chain.clone(),
                    network: self.chain.network.clone(),
                    txid: tx.txid.clone(),
                    block_height: placement.height,
                    block_hash: placement.block_hash.map(str::to_string),
                    block_time: placement.time,
                    block_time_normalized: placement.time_normalized,
                    size: tx.size,
                    fee: tx.fee,
                    wallets,
                    extension: tx.extension.clone(),
                },
            });
        }
        Ok(())
    }

    fn append_spend_ops(
        &self,
        batch: &mut OpBatch,
        resolver: &mut InFlightSpendResolver,
        transactions: &[NormalizedTransaction],
        height: Height,
    ) {
        resolver.sync(&batch.mint_ops);
        let prune_script =
            self.prune_spent_scripts && matches!(height, Height::Confirmed(h) if h > 0);

        let mut folded = 0;
        for tx in transactions {
            if tx.extension.is_coinbase() {
                continue;
            }
            for input in &tx.inputs {
                if let Some(position) = resolver.resolve(&input.mint_txid, input.mint_index) {
                    let mint = &mut batch.mint_ops[position];
                    match mint.fold_spend(&tx.txid, height, prune_script) {
                        Ok(()) => folded += 1,
                        Err(conflict) => {
                            error!(chain = %self.chain, "{conflict}");
                            batch.conflicts.push(mint.key.clone());
                        }
                    }
                    continue;
                }
                batch.spend_ops.push(CoinSpendOp {
                    key: CoinKey::new(&self.chain, &input.mint_txid, input.mint_index),
                    spent_txid: tx.txid.clone(),
                    spent_height: height,
                    prune_script,
                });
            }
        }
        debug!(chain = %self.chain, "Processed {folded} spends in memory");
    }

    async fn tag_mint_wallets(&self, mint_ops: &mut [CoinMintOp]) -> IndexerResult<()> {
        let addresses: Vec<_> = mint_ops
            .iter()
            .filter_map(|op| op.address.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if addresses.is_empty() {
            return Ok(());
        }

        let mut by_address: HashMap<String, BTreeSet<WalletId>> = HashMap::new();
        for entry in self.wallets.find_wallets_for_addresses(&self.chain, &addresses).await? {
            by_address.entry(entry.address).or_default().insert(entry.wallet);
        }
        for op in mint_ops {
            if let Some(wallets) = op.address.as_ref().and_then(|a| by_address.get(a)) {
                op.wallets = wallets.clone();
            }
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_utils {
    use super::*;
    use tessera_common::{BlockExtension, TxExtension, TxInput, TxOutput};

    pub fn regtest() -> ChainNetwork {
        ChainNetwork::new("BTC", "regtest")
    }

    pub fn hash(n: u64) -> String {
        format!("{n:064x}")
    }

    /// Block `n` whose parent is block `n - 1`
    pub fn block(n: u64, time: u64) -> NormalizedBlock {
        NormalizedBlock {
            chain: "BTC".to_string(),
            network: "regtest".to_string(),
            height: None,
            hash: hash(n),
            previous_block_hash: hash(n - 1),
            next_block_hash: None,
            version: 1,
            merkle_root: hash(0),
            time,
            time_normalized: time,
            nonce: 0,
            bits: 0,
            transaction_count: 1,
            size: 200,
            reward: 100,
            processed: false,
            extension: BlockExtension::None,
        }
    }

    pub fn tx(
        txid: &str,
        inputs: &[(&str, u32)],
        outputs: &[(u128, &str)],
    ) -> NormalizedTransaction {
        NormalizedTransaction {
            chain: "BTC".to_string(),
            network: "regtest".to_string(),
            txid: txid.to_string(),
            block_height: None,
            block_hash: None,
            block_time: None,
            block_time_normalized: None,
            size: 100,
            fee: None,
            wallets: BTreeSet::new(),
            extension: TxExtension::Utxo {
                locktime: 0,
                coinbase: inputs.is_empty(),
            },
            inputs: inputs
                .iter()
                .map(|(mint_txid, mint_index)| TxInput {
                    mint_txid: mint_txid.to_string(),
                    mint_index: *mint_index,
                })
                .collect(),
            outputs: outputs
                .iter()
                .map(|(value, address)| TxOutput {
                    value: *value,
                    address: Some(address.to_string()),
                    script: Some(vec![0x76, 0xa9]),
                })
                .collect(),
        }
    }
}
