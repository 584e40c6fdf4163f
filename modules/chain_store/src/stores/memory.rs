//! In-memory store, used for tests and short-lived replays

use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap, HashSet};
use tessera_common::ops::{CoinMintOp, CoinSpendOp, CoinWriteSummary, RollbackSummary, TxOp};
use tessera_common::store::{ChainStore, WalletResolver};
use tessera_common::{
    Address, BlockHash, BlockRecord, ChainNetwork, Coin, CoinKey, IndexerResult,
    TransactionRecord, TxId, WalletAddress, WalletId,
};
use tokio::sync::RwLock;

use super::{apply_block_upsert, rollback_coin, write_coins};

#[derive(Default)]
struct ChainState {
    blocks: HashMap<BlockHash, BlockRecord>,
    transactions: HashMap<TxId, TransactionRecord>,
    initial_sync_complete: bool,
}

impl ChainState {
    /// Processed blocks, highest first
    fn processed_blocks(&self) -> Vec<&BlockRecord> {
        let mut blocks: Vec<_> = self.blocks.values().filter(|b| b.processed).collect();
        blocks.sort_by(|a, b| b.height.cmp(&a.height).then_with(|| a.hash.cmp(&b.hash)));
        blocks
    }
}

#[derive(Default)]
struct MemoryState {
    chains: HashMap<ChainNetwork, ChainState>,
    coins: HashMap<CoinKey, Coin>,
    wallet_addresses: HashMap<(ChainNetwork, Address), BTreeSet<WalletId>>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an address as belonging to a wallet
    pub async fn add_wallet_address(&self, chain: &ChainNetwork, entry: WalletAddress) {
        let mut state = self.state.write().await;
        state
            .wallet_addresses
            .entry((chain.clone(), entry.address))
            .or_default()
            .insert(entry.wallet);
    }

    /// All coins of a chain, sorted by key
    pub async fn list_coins(&self, chain: &ChainNetwork) -> Vec<Coin> {
        let state = self.state.read().await;
        let mut coins: Vec<_> =
            state.coins.values().filter(|c| c.key.chain_network() == *chain).cloned().collect();
        coins.sort_by(|a, b| a.key.cmp(&b.key));
        coins
    }

    /// All blocks of a chain, lowest first
    pub async fn list_blocks(&self, chain: &ChainNetwork) -> Vec<BlockRecord> {
        let state = self.state.read().await;
        let mut blocks: Vec<_> = state
            .chains
            .get(chain)
            .map(|c| c.blocks.values().cloned().collect())
            .unwrap_or_default();
        blocks.sort_by_key(|b| b.height);
        blocks
    }
}

#[async_trait]
impl ChainStore for MemoryStore {
    async fn get_block(
        &self,
        chain: &ChainNetwork,
        hash: &str,
    ) -> IndexerResult<Option<BlockRecord>> {
        let state = self.state.read().await;
        Ok(state.chains.get(chain).and_then(|c| c.blocks.get(hash)).cloned())
    }

    async fn get_local_tip(&self, chain: &ChainNetwork) -> IndexerResult<Option<BlockRecord>> {
        let state = self.state.read().await;
        Ok(state
            .chains
            .get(chain)
            .and_then(|c| c.processed_blocks().first().map(|b| (*b).clone())))
    }

    async fn get_recent_block_hashes(
        &self,
        chain: &ChainNetwork,
        limit: usize,
    ) -> IndexerResult<Vec<BlockHash>> {
        let state = self.state.read().await;
        Ok(state
            .chains
            .get(chain)
            .map(|c| {
                c.processed_blocks().into_iter().take(limit).map(|b| b.hash.clone()).collect()
            })
            .unwrap_or_default())
    }

    async fn upsert_block(&self, block: &BlockRecord) -> IndexerResult<()> {
        let mut state = self.state.write().await;
        let blocks = &mut state.chains.entry(block.chain_network()).or_default().blocks;
        let updated = apply_block_upsert(blocks.get(&block.hash), block);
        blocks.insert(block.hash.clone(), updated);
        Ok(())
    }

    async fn set_next_block_hash(
        &self,
        chain: &ChainNetwork,
        hash: &str,
        next_block_hash: &str,
    ) -> IndexerResult<()> {
        let mut state = self.state.write().await;
        if let Some(block) = state.chains.get_mut(chain).and_then(|c| c.blocks.get_mut(hash)) {
            block.next_block_hash = Some(next_block_hash.to_string());
        }
        Ok(())
    }

    async fn mark_block_processed(&self, chain: &ChainNetwork, hash: &str) -> IndexerResult<()> {
        let mut state = self.state.write().await;
        if let Some(block) = state.chains.get_mut(chain).and_then(|c| c.blocks.get_mut(hash)) {
            block.processed = true;
        }
        Ok(())
    }

    async fn bulk_write_coins(
        &self,
        mints: &[CoinMintOp],
        spends: &[CoinSpendOp],
    ) -> IndexerResult<CoinWriteSummary> {
        let mut state = self.state.write().await;
        write_coins(&mut state.coins, mints, spends)
    }

    async fn bulk_write_transactions(&self, ops: &[TxOp]) -> IndexerResult<()> {
        let mut state = self.state.write().await;
        for op in ops {
            let chain = ChainNetwork::new(&op.record.chain, &op.record.network);
            state
                .chains
                .entry(chain)
                .or_default()
                .transactions
                .insert(op.record.txid.clone(), op.record.clone());
        }
        Ok(())
    }

    async fn get_coin(&self, key: &CoinKey) -> IndexerResult<Option<Coin>> {
        Ok(self.state.read().await.coins.get(key).cloned())
    }

    async fn find_spent_coins_minted_at(
        &self,
        chain: &ChainNetwork,
        mint_height: u64,
        spent_below: u64,
    ) -> IndexerResult<Vec<Coin>> {
        let state = self.state.read().await;
        let mut coins: Vec<_> = state
            .coins
            .values()
            .filter(|c| c.key.chain_network() == *chain)
            .filter(|c| c.mint_height.confirmed() == Some(mint_height))
            .filter(|c| c.spend.spent_txid().is_some())
            .filter(|c| c.spend.spent_height().is_none_or(|h| h < spent_below))
            .cloned()
            .collect();
        coins.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(coins)
    }

    async fn aggregate_tx_wallets(
        &self,
        chain: &ChainNetwork,
        txids: &[TxId],
    ) -> IndexerResult<HashMap<TxId, BTreeSet<WalletId>>> {
        let wanted: HashSet<&str> = txids.iter().map(String::as_str).collect();
        let state = self.state.read().await;

        let mut wallets: HashMap<TxId, BTreeSet<WalletId>> = HashMap::new();
        for coin in state.coins.values() {
            if coin.wallets.is_empty() || coin.key.chain_network() != *chain {
                continue;
            }
            let minted_by = Some(coin.key.mint_txid.as_str());
            for txid in [minted_by, coin.spend.spent_txid()].into_iter().flatten() {
                if wanted.contains(txid) {
                    wallets.entry(txid.to_string()).or_default().extend(coin.wallets.clone());
                }
            }
        }
        Ok(wallets)
    }

    async fn get_transaction(
        &self,
        chain: &ChainNetwork,
        txid: &str,
    ) -> IndexerResult<Option<TransactionRecord>> {
        let state = self.state.read().await;
        Ok(state.chains.get(chain).and_then(|c| c.transactions.get(txid)).cloned())
    }

    async fn rollback_from_height(
        &self,
        chain: &ChainNetwork,
        height: u64,
    ) -> IndexerResult<RollbackSummary> {
        let mut summary = RollbackSummary::default();
        let mut state = self.state.write().await;

        if let Some(chain_state) = state.chains.get_mut(chain) {
            let before = chain_state.blocks.len();
            chain_state.blocks.retain(|_, b| b.height < height);
            summary.blocks_removed = before - chain_state.blocks.len();

            for block in chain_state.blocks.values_mut() {
                if height > 0 && block.height == height - 1 {
                    block.next_block_hash = None;
                }
            }

            let before = chain_state.transactions.len();
            chain_state.transactions.retain(|_, tx| !tx.block_height.at_or_above(height));
            summary.transactions_removed = before - chain_state.transactions.len();
        }

        let affected: Vec<CoinKey> = state
            .coins
            .values()
            .filter(|c| c.key.chain_network() == *chain)
            .filter(|c| rollback_coin(c, height).as_ref() != Some(c))
            .map(|c| c.key.clone())
            .collect();
        for key in affected {
            let Some(coin) = state.coins.remove(&key) else {
                continue;
            };
            match rollback_coin(&coin, height) {
                Some(restored) => {
                    state.coins.insert(key, restored);
                    summary.coins_unspent += 1;
                }
                None => summary.coins_removed += 1,
            }
        }

        Ok(summary)
    }

    async fn is_initial_sync_complete(&self, chain: &ChainNetwork) -> IndexerResult<bool> {
        let state = self.state.read().await;
        Ok(state.chains.get(chain).is_some_and(|c| c.initial_sync_complete))
    }

    async fn set_initial_sync_complete(&self, chain: &ChainNetwork) -> IndexerResult<()> {
        let mut state = self.state.write().await;
        state.chains.entry(chain.clone()).or_default().initial_sync_complete = true;
        Ok(())
    }
}

#[async_trait]
impl WalletResolver for MemoryStore {
    async fn find_wallets_for_addresses(
        &self,
        chain: &ChainNetwork,
        addresses: &[Address],
    ) -> IndexerResult<Vec<WalletAddress>> {
        let state = self.state.read().await;
        let mut found = Vec::new();
        for address in addresses {
            let key = (chain.clone(), address.clone());
            for wallet in state.wallet_addresses.get(&key).into_iter().flatten() {
                found.push(WalletAddress {
                    address: address.clone(),
                    wallet: wallet.clone(),
                });
            }
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::conformance;

    #[tokio::test]
    async fn memory_store_conformance() {
        let store = MemoryStore::new();
        conformance::run_all(&store).await;
    }

    #[tokio::test]
    async fn memory_store_resolves_wallets() {
        let store = MemoryStore::new();
        let chain = ChainNetwork::new("BTC", "regtest");
        for entry in conformance::wallet_entries() {
            store.add_wallet_address(&chain, entry).await;
        }
        conformance::wallet_lookup(&store, &chain).await;
    }
}
