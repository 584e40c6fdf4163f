//! Fjall-backed store
//!
//! Every key starts with `chain\0network\0`. Heights inside keys are big-endian
//! so scans run in height order, and index keyspaces map a secondary key to
//! the primary key of the record they point at.

use anyhow::Result;
use async_trait::async_trait;
use fjall::{Database, Keyspace, KeyspaceCreateOptions, OwnedWriteBatch};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs;
use std::path::Path;
use tessera_common::ops::{CoinMintOp, CoinSpendOp, CoinWriteSummary, RollbackSummary, TxOp};
use tessera_common::store::{ChainStore, WalletResolver};
use tessera_common::{
    Address, BlockHash, BlockRecord, ChainNetwork, Coin, CoinKey, Height, IndexerError,
    IndexerResult, SpendState, TransactionRecord, TxId, WalletAddress, WalletId,
};
use tokio::sync::Mutex;
use tracing::info;

use super::{apply_block_upsert, rollback_coin, write_coins, CoinTable};

const BLOCKS_KEYSPACE: &str = "blocks";
const BLOCK_HEIGHTS_KEYSPACE: &str = "block-heights";
const COINS_KEYSPACE: &str = "coins";
const COINS_BY_MINT_HEIGHT_KEYSPACE: &str = "coins-by-mint-height";
const COINS_BY_SPENT_HEIGHT_KEYSPACE: &str = "coins-by-spent-height";
const COINS_BY_SPENT_TXID_KEYSPACE: &str = "coins-by-spent-txid";
const TRANSACTIONS_KEYSPACE: &str = "transactions";
const TXS_BY_HEIGHT_KEYSPACE: &str = "txs-by-height";
const WALLET_ADDRESSES_KEYSPACE: &str = "wallet-addresses";
const STATE_KEYSPACE: &str = "state";
const INITIAL_SYNC_COMPLETE: &[u8] = b"initial-sync-complete";

pub struct FjallStore {
    database: Database,
    blocks: Keyspace,
    block_heights: Keyspace,
    coins: Keyspace,
    coins_by_mint_height: Keyspace,
    coins_by_spent_height: Keyspace,
    coins_by_spent_txid: Keyspace,
    transactions: Keyspace,
    txs_by_height: Keyspace,
    wallet_addresses: Keyspace,
    state: Keyspace,
    /// Serialises read-modify-write cycles
    write_lock: Mutex<()>,
}

impl FjallStore {
    pub fn new(path: &str, clear: bool) -> Result<Self> {
        info!("Storing chain data with Fjall on disk ({path})");
        let path = Path::new(path);
        if clear && path.exists() {
            fs::remove_dir_all(path)?;
        }

        let database = Database::builder(path).open()?;
        let blocks = database.keyspace(BLOCKS_KEYSPACE, KeyspaceCreateOptions::default)?;
        let block_heights =
            database.keyspace(BLOCK_HEIGHTS_KEYSPACE, KeyspaceCreateOptions::default)?;
        let coins = database.keyspace(COINS_KEYSPACE, KeyspaceCreateOptions::default)?;
        let coins_by_mint_height =
            database.keyspace(COINS_BY_MINT_HEIGHT_KEYSPACE, KeyspaceCreateOptions::default)?;
        let coins_by_spent_height =
            database.keyspace(COINS_BY_SPENT_HEIGHT_KEYSPACE, KeyspaceCreateOptions::default)?;
        let coins_by_spent_txid =
            database.keyspace(COINS_BY_SPENT_TXID_KEYSPACE, KeyspaceCreateOptions::default)?;
        let transactions =
            database.keyspace(TRANSACTIONS_KEYSPACE, KeyspaceCreateOptions::default)?;
        let txs_by_height =
            database.keyspace(TXS_BY_HEIGHT_KEYSPACE, KeyspaceCreateOptions::default)?;
        let wallet_addresses =
            database.keyspace(WALLET_ADDRESSES_KEYSPACE, KeyspaceCreateOptions::default)?;
        let state = database.keyspace(STATE_KEYSPACE, KeyspaceCreateOptions::default)?;

        Ok(Self {
            database,
            blocks,
            block_heights,
            coins,
            coins_by_mint_height,
            coins_by_spent_height,
            coins_by_spent_txid,
            transactions,
            txs_by_height,
            wallet_addresses,
            state,
            write_lock: Mutex::new(()),
        })
    }

    /// Register an address as belonging to a wallet
    pub async fn add_wallet_address(
        &self,
        chain: &ChainNetwork,
        entry: &WalletAddress,
    ) -> Result<()> {
        let key = scoped(chain, &[entry.address.as_bytes(), &[0], entry.wallet.as_bytes()]);
        self.wallet_addresses.insert(key, entry.wallet.as_bytes().to_vec())?;
        Ok(())
    }

    fn read<T: DeserializeOwned>(keyspace: &Keyspace, key: &[u8]) -> Result<Option<T>> {
        let Some(bytes) = keyspace.get(key)? else {
            return Ok(None);
        };
        Ok(Some(bincode::deserialize(&bytes)?))
    }

    fn processed_blocks(&self, chain: &ChainNetwork, limit: usize) -> Result<Vec<BlockRecord>> {
        let mut blocks = Vec::new();
        for item in self.block_heights.prefix(scope(chain)).rev() {
            if blocks.len() >= limit {
                break;
            }
            let primary = item.value()?;
            if let Some(block) = Self::read::<BlockRecord>(&self.blocks, &primary)? {
                if block.processed {
                    blocks.push(block);
                }
            }
        }
        Ok(blocks)
    }

    fn write_block(&self, block: &BlockRecord) -> Result<()> {
        let chain = block.chain_network();
        let primary = scoped(&chain, &[block.hash.as_bytes()]);
        let mut batch = self.database.batch();
        let existing = Self::read::<BlockRecord>(&self.blocks, &primary)?;
        if let Some(existing) = &existing {
            if existing.height != block.height {
                batch.remove(
                    &self.block_heights,
                    height_key(&chain, existing.height, block.hash.as_bytes()),
                );
            }
        }
        let block = apply_block_upsert(existing.as_ref(), block);
        batch.insert(&self.blocks, primary.clone(), encode(&block)?);
        batch.insert(
            &self.block_heights,
            height_key(&chain, block.height, block.hash.as_bytes()),
            primary,
        );
        batch.commit()?;
        Ok(())
    }

    fn update_block(
        &self,
        chain: &ChainNetwork,
        hash: &str,
        update: impl FnOnce(&mut BlockRecord),
    ) -> Result<()> {
        let primary = scoped(chain, &[hash.as_bytes()]);
        if let Some(mut block) = Self::read::<BlockRecord>(&self.blocks, &primary)? {
            update(&mut block);
            self.blocks.insert(primary, encode(&block)?)?;
        }
        Ok(())
    }

    fn write_transactions(&self, ops: &[TxOp]) -> Result<()> {
        let mut batch = self.database.batch();
        let mut written: HashMap<Vec<u8>, Height> = HashMap::new();
        for op in ops {
            let record = &op.record;
            let chain = ChainNetwork::new(&record.chain, &record.network);
            let primary = scoped(&chain, &[record.txid.as_bytes()]);

            let previous_height = match written.get(&primary) {
                Some(height) => Some(*height),
                None => Self::read::<TransactionRecord>(&self.transactions, &primary)?
                    .map(|tx| tx.block_height),
            };
            if let Some(Height::Confirmed(height)) = previous_height {
                if previous_height != Some(record.block_height) {
                    batch.remove(
                        &self.txs_by_height,
                        height_key(&chain, height, record.txid.as_bytes()),
                    );
                }
            }

            batch.insert(&self.transactions, primary.clone(), encode(record)?);
            if let Height::Confirmed(height) = record.block_height {
                batch.insert(
                    &self.txs_by_height,
                    height_key(&chain, height, record.txid.as_bytes()),
                    primary.clone(),
                );
            }
            written.insert(primary, record.block_height);
        }
        batch.commit()?;
        Ok(())
    }

    fn spent_coins_minted_at(
        &self,
        chain: &ChainNetwork,
        mint_height: u64,
        spent_below: u64,
    ) -> Result<Vec<Coin>> {
        let mut coins = Vec::new();
        for item in self.coins_by_mint_height.prefix(height_key(chain, mint_height, &[])) {
            let primary = item.value()?;
            let Some(coin) = Self::read::<Coin>(&self.coins, &primary)? else {
                continue;
            };
            let spent = coin.spend.spent_txid().is_some();
            if spent && coin.spend.spent_height().is_none_or(|h| h < spent_below) {
                coins.push(coin);
            }
        }
        Ok(coins)
    }

    fn tx_wallets(
        &self,
        chain: &ChainNetwork,
        txids: &[TxId],
    ) -> Result<HashMap<TxId, BTreeSet<WalletId>>> {
        let mut result = HashMap::new();
        for txid in txids {
            let prefix = scoped(chain, &[txid.as_bytes(), &[0]]);
            let mut wallets = BTreeSet::new();

            for item in self.coins.prefix(&prefix) {
                let coin: Coin = bincode::deserialize(&item.value()?)?;
                wallets.extend(coin.wallets);
            }
            for item in self.coins_by_spent_txid.prefix(&prefix) {
                let primary = item.value()?;
                if let Some(coin) = Self::read::<Coin>(&self.coins, &primary)? {
                    wallets.extend(coin.wallets);
                }
            }

            if !wallets.is_empty() {
                result.insert(txid.clone(), wallets);
            }
        }
        Ok(result)
    }

    fn rollback(&self, chain: &ChainNetwork, height: u64) -> Result<RollbackSummary> {
        let mut summary = RollbackSummary::default();
        let mut batch = self.database.batch();
        let (from, to) = height_range(chain, height);

        for item in self.block_heights.range(from.clone()..to.clone()) {
            let (key, primary) = item.into_inner()?;
            batch.remove(&self.block_heights, key);
            batch.remove(&self.blocks, primary);
            summary.blocks_removed += 1;
        }
        if height > 0 {
            for item in self.block_heights.prefix(height_key(chain, height - 1, &[])) {
                let primary = item.value()?;
                if let Some(mut block) = Self::read::<BlockRecord>(&self.blocks, &primary)? {
                    block.next_block_hash = None;
                    batch.insert(&self.blocks, primary, encode(&block)?);
                }
            }
        }

        for item in self.txs_by_height.range(from.clone()..to.clone()) {
            let (key, primary) = item.into_inner()?;
            batch.remove(&self.txs_by_height, key);
            batch.remove(&self.transactions, primary);
            summary.transactions_removed += 1;
        }

        let mut removed = HashSet::new();
        for item in self.coins_by_mint_height.range(from.clone()..to.clone()) {
            let primary = item.value()?.to_vec();
            if let Some(coin) = Self::read::<Coin>(&self.coins, &primary)? {
                for (index, key) in self.coin_index_entries(&coin) {
                    batch.remove(self.index(index), key);
                }
            }
            batch.remove(&self.coins, primary.clone());
            removed.insert(primary);
            summary.coins_removed += 1;
        }

        let mut table = FjallCoinTable::new(self, batch);
        for item in self.coins_by_spent_height.range(from..to) {
            let primary = item.value()?.to_vec();
            if removed.contains(&primary) {
                continue;
            }
            let Some(coin) = Self::read::<Coin>(&self.coins, &primary)? else {
                continue;
            };
            if let Some(restored) = rollback_coin(&coin, height) {
                table.save(Some(&coin), restored)?;
                summary.coins_unspent += 1;
            }
        }
        table.batch.commit()?;

        Ok(summary)
    }

    fn wallets_for(
        &self,
        chain: &ChainNetwork,
        addresses: &[Address],
    ) -> Result<Vec<WalletAddress>> {
        let mut found = Vec::new();
        for address in addresses {
            let prefix = scoped(chain, &[address.as_bytes(), &[0]]);
            for item in self.wallet_addresses.prefix(&prefix) {
                let wallet = String::from_utf8(item.value()?.to_vec())?;
                found.push(WalletAddress {
                    address: address.clone(),
                    wallet,
                });
            }
        }
        Ok(found)
    }

    fn coin_index_entries(&self, coin: &Coin) -> Vec<(CoinIndex, Vec<u8>)> {
        let chain = coin.key.chain_network();
        let suffix = coin_suffix(&coin.key);
        let mut entries = Vec::new();
        if let Height::Confirmed(height) = coin.mint_height {
            entries.push((CoinIndex::MintHeight, height_key(&chain, height, &suffix)));
        }
        if let SpendState::SpentAtHeight(_, height) = &coin.spend {
            entries.push((CoinIndex::SpentHeight, height_key(&chain, *height, &suffix)));
        }
        if let Some(txid) = coin.spend.spent_txid() {
            entries.push((
                CoinIndex::SpentTxid,
                scoped(&chain, &[txid.as_bytes(), &[0], &suffix]),
            ));
        }
        entries
    }

    fn index(&self, index: CoinIndex) -> &Keyspace {
        match index {
            CoinIndex::MintHeight => &self.coins_by_mint_height,
            CoinIndex::SpentHeight => &self.coins_by_spent_height,
            CoinIndex::SpentTxid => &self.coins_by_spent_txid,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CoinIndex {
    MintHeight,
    SpentHeight,
    SpentTxid,
}

/// Coin writes staged in one batch, with an overlay so later ops in the
/// same batch see earlier ones
struct FjallCoinTable<'a> {
    store: &'a FjallStore,
    batch: OwnedWriteBatch,
    overlay: HashMap<CoinKey, Coin>,
}

impl<'a> FjallCoinTable<'a> {
    fn new(store: &'a FjallStore, batch: OwnedWriteBatch) -> Self {
        Self {
            store,
            batch,
            overlay: HashMap::new(),
        }
    }

    fn stage(&mut self, previous: Option<&Coin>, coin: &Coin) -> Result<()> {
        let primary = coin_key(&coin.key);
        let old = previous.map(|c| self.store.coin_index_entries(c)).unwrap_or_default();
        let new = self.store.coin_index_entries(coin);

        for entry in old.iter().filter(|e| !new.contains(e)) {
            self.batch.remove(self.store.index(entry.0), entry.1.clone());
        }
        for entry in new.iter().filter(|e| !old.contains(e)) {
            self.batch.insert(self.store.index(entry.0), entry.1.clone(), primary.clone());
        }
        self.batch.insert(&self.store.coins, primary, encode(coin)?);
        Ok(())
    }
}

impl CoinTable for FjallCoinTable<'_> {
    fn load(&mut self, key: &CoinKey) -> IndexerResult<Option<Coin>> {
        if let Some(coin) = self.overlay.get(key) {
            return Ok(Some(coin.clone()));
        }
        FjallStore::read(&self.store.coins, &coin_key(key)).map_err(IndexerError::store)
    }

    fn save(&mut self, previous: Option<&Coin>, coin: Coin) -> IndexerResult<()> {
        self.stage(previous, &coin).map_err(IndexerError::store)?;
        self.overlay.insert(coin.key.clone(), coin);
        Ok(())
    }
}

#[async_trait]
impl ChainStore for FjallStore {
    async fn get_block(
        &self,
        chain: &ChainNetwork,
        hash: &str,
    ) -> IndexerResult<Option<BlockRecord>> {
        Self::read(&self.blocks, &scoped(chain, &[hash.as_bytes()])).map_err(IndexerError::store)
    }

    async fn get_local_tip(&self, chain: &ChainNetwork) -> IndexerResult<Option<BlockRecord>> {
        let blocks = self.processed_blocks(chain, 1).map_err(IndexerError::store)?;
        Ok(blocks.into_iter().next())
    }

    async fn get_recent_block_hashes(
        &self,
        chain: &ChainNetwork,
        limit: usize,
    ) -> IndexerResult<Vec<BlockHash>> {
        let blocks = self.processed_blocks(chain, limit).map_err(IndexerError::store)?;
        Ok(blocks.into_iter().map(|b| b.hash).collect())
    }

    async fn upsert_block(&self, block: &BlockRecord) -> IndexerResult<()> {
        let _guard = self.write_lock.lock().await;
        self.write_block(block).map_err(IndexerError::store)
    }

    async fn set_next_block_hash(
        &self,
        chain: &ChainNetwork,
        hash: &str,
        next_block_hash: &str,
    ) -> IndexerResult<()> {
        let _guard = self.write_lock.lock().await;
        self.update_block(chain, hash, |block| {
            block.next_block_hash = Some(next_block_hash.to_string())
        })
        .map_err(IndexerError::store)
    }

    async fn mark_block_processed(&self, chain: &ChainNetwork, hash: &str) -> IndexerResult<()> {
        let _guard = self.write_lock.lock().await;
        self.update_block(chain, hash, |block| block.processed = true)
            .map_err(IndexerError::store)
    }

    async fn bulk_write_coins(
        &self,
        mints: &[CoinMintOp],
        spends: &[CoinSpendOp],
    ) -> IndexerResult<CoinWriteSummary> {
        let _guard = self.write_lock.lock().await;
        let mut table = FjallCoinTable::new(self, self.database.batch());
        let summary = write_coins(&mut table, mints, spends)?;
        table.batch.commit().map_err(IndexerError::store)?;
        Ok(summary)
    }

    async fn bulk_write_transactions(&self, ops: &[TxOp]) -> IndexerResult<()> {
        let _guard = self.write_lock.lock().await;
        self.write_transactions(ops).map_err(IndexerError::store)
    }

    async fn get_coin(&self, key: &CoinKey) -> IndexerResult<Option<Coin>> {
        Self::read(&self.coins, &coin_key(key)).map_err(IndexerError::store)
    }

    async fn find_spent_coins_minted_at(
        &self,
        chain: &ChainNetwork,
        mint_height: u64,
        spent_below: u64,
    ) -> IndexerResult<Vec<Coin>> {
        self.spent_coins_minted_at(chain, mint_height, spent_below).map_err(IndexerError::store)
    }

    async fn aggregate_tx_wallets(
        &self,
        chain: &ChainNetwork,
        txids: &[TxId],
    ) -> IndexerResult<HashMap<TxId, BTreeSet<WalletId>>> {
        self.tx_wallets(chain, txids).map_err(IndexerError::store)
    }

    async fn get_transaction(
        &self,
        chain: &ChainNetwork,
        txid: &str,
    ) -> IndexerResult<Option<TransactionRecord>> {
        Self::read(&self.transactions, &scoped(chain, &[txid.as_bytes()]))
            .map_err(IndexerError::store)
    }

    async fn rollback_from_height(
        &self,
        chain: &ChainNetwork,
        height: u64,
    ) -> IndexerResult<RollbackSummary> {
        let _guard = self.write_lock.lock().await;
        self.rollback(chain, height).map_err(IndexerError::store)
    }

    async fn is_initial_sync_complete(&self, chain: &ChainNetwork) -> IndexerResult<bool> {
        let key = scoped(chain, &[INITIAL_SYNC_COMPLETE]);
        let flag = self.state.get(key).map_err(IndexerError::store)?;
        Ok(flag.is_some())
    }

    async fn set_initial_sync_complete(&self, chain: &ChainNetwork) -> IndexerResult<()> {
        let key = scoped(chain, &[INITIAL_SYNC_COMPLETE]);
        self.state.insert(key, vec![1u8]).map_err(IndexerError::store)
    }
}

#[async_trait]
impl WalletResolver for FjallStore {
    async fn find_wallets_for_addresses(
        &self,
        chain: &ChainNetwork,
        addresses: &[Address],
    ) -> IndexerResult<Vec<WalletAddress>> {
        self.wallets_for(chain, addresses).map_err(IndexerError::store)
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

fn scope(chain: &ChainNetwork) -> Vec<u8> {
    let mut key = Vec::with_capacity(chain.chain.len() + chain.network.len() + 2);
    key.extend_from_slice(chain.chain.as_bytes());
    key.push(0);
    key.extend_from_slice(chain.network.as_bytes());
    key.push(0);
    key
}

fn scoped(chain: &ChainNetwork, parts: &[&[u8]]) -> Vec<u8> {
    let mut key = scope(chain);
    for part in parts {
        key.extend_from_slice(part);
    }
    key
}

fn height_key(chain: &ChainNetwork, height: u64, tail: &[u8]) -> Vec<u8> {
    scoped(chain, &[&height.to_be_bytes(), tail])
}

/// Height-keyed entries at or above `height`
fn height_range(chain: &ChainNetwork, height: u64) -> (Vec<u8>, Vec<u8>) {
    (height_key(chain, height, &[]), height_key(chain, u64::MAX, &[]))
}

fn coin_suffix(key: &CoinKey) -> Vec<u8> {
    let mut suffix = Vec::with_capacity(key.mint_txid.len() + 5);
    suffix.extend_from_slice(key.mint_txid.as_bytes());
    suffix.push(0);
    suffix.extend_from_slice(&key.mint_index.to_be_bytes());
    suffix
}

fn coin_key(key: &CoinKey) -> Vec<u8> {
    scoped(&key.chain_network(), &[&coin_suffix(key)])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::conformance;
    use tempfile::TempDir;

    struct TestState {
        #[expect(unused)]
        dir: TempDir,
        store: FjallStore,
    }

    fn init_state() -> TestState {
        let dir = tempfile::tempdir().unwrap();
        let dir_name = dir.path().to_str().expect("dir_name cannot be stored as string");
        let store = FjallStore::new(dir_name, false).unwrap();
        TestState { dir, store }
    }

    #[tokio::test]
    async fn fjall_store_conformance() {
        let state = init_state();
        conformance::run_all(&state.store).await;
    }

    #[tokio::test]
    async fn should_resolve_wallets() {
        let state = init_state();
        let chain = ChainNetwork::new("BTC", "regtest");
        for entry in conformance::wallet_entries() {
            state.store.add_wallet_address(&chain, &entry).await.unwrap();
        }
        conformance::wallet_lookup(&state.store, &chain).await;
    }

    #[tokio::test]
    async fn should_get_block_by_hash() {
        let state = init_state();
        let chain = ChainNetwork::new("BTC", "regtest");
        let block = conformance::block(&chain, 7);

        state.store.upsert_block(&block).await.unwrap();

        let stored = state.store.get_block(&chain, &block.hash).await.unwrap();
        assert_eq!(stored, Some(block));
    }

    #[tokio::test]
    async fn should_reindex_block_when_height_changes() {
        let state = init_state();
        let chain = ChainNetwork::new("BTC", "regtest");
        let mut block = conformance::block(&chain, 7);
        state.store.upsert_block(&block).await.unwrap();

        block.height = 9;
        state.store.upsert_block(&block).await.unwrap();

        let summary = state.store.rollback_from_height(&chain, 8).await.unwrap();
        assert_eq!(summary.blocks_removed, 1);
        assert_eq!(state.store.get_local_tip(&chain).await.unwrap(), None);
    }

    #[tokio::test]
    async fn should_reindex_transaction_on_confirmation() {
        let state = init_state();
        let chain = ChainNetwork::new("BTC", "regtest");
        let pending = conformance::tx(&chain, "t1", Height::Mempool);
        let confirmed = conformance::tx(&chain, "t1", Height::Confirmed(3));

        state.store.bulk_write_transactions(&[pending]).await.unwrap();
        state.store.bulk_write_transactions(&[confirmed.clone()]).await.unwrap();
        let stored = state.store.get_transaction(&chain, "t1").await.unwrap();
        assert_eq!(stored, Some(confirmed.record));

        let summary = state.store.rollback_from_height(&chain, 3).await.unwrap();
        assert_eq!(summary.transactions_removed, 1);
    }

    #[tokio::test]
    async fn rollback_unspends_coins_spent_at_or_above_the_height() {
        let state = init_state();
        let chain = ChainNetwork::new("BTC", "regtest");
        let mints: Vec<_> =
            ["a", "b", "c"].iter().map(|t| conformance::mint(&chain, t, 2)).collect();
        let spends = [
            conformance::spend(&chain, "a", "sa", Height::Confirmed(4)),
            conformance::spend(&chain, "b", "sb", Height::Confirmed(5)),
            conformance::spend(&chain, "c", "sc", Height::Confirmed(3)),
        ];
        state.store.bulk_write_coins(&mints, &spends).await.unwrap();

        let summary = state.store.rollback_from_height(&chain, 4).await.unwrap();
        assert_eq!(summary.coins_unspent, 2);
        assert_eq!(summary.coins_removed, 0);

        for txid in ["a", "b"] {
            let coin = state.store.get_coin(&CoinKey::new(&chain, txid, 0)).await.unwrap();
            let coin = coin.unwrap();
            assert_eq!(coin.spend, SpendState::Unspent);
            assert_eq!(coin.mint_height, Height::Confirmed(2));
            assert_eq!(coin.value, 1000);
        }
        let coin = state.store.get_coin(&CoinKey::new(&chain, "c", 0)).await.unwrap().unwrap();
        assert_eq!(coin.spend, SpendState::SpentAtHeight("sc".to_string(), 3));

        // The reset coins can be spent again on the new branch
        let respend = conformance::spend(&chain, "a", "sa2", Height::Confirmed(4));
        let summary = state.store.bulk_write_coins(&[], &[respend]).await.unwrap();
        assert_eq!(summary.spent, 1);
        assert!(summary.conflicts.is_empty());
    }

    #[test]
    fn height_keys_sort_numerically() {
        let chain = ChainNetwork::new("BTC", "regtest");
        assert!(height_key(&chain, 255, b"ff") < height_key(&chain, 256, b"00"));
        let (from, to) = height_range(&chain, 10);
        assert!(from <= height_key(&chain, 10, b"a") && height_key(&chain, 10, b"a") < to);
        assert!(height_key(&chain, 9, b"a") < from);
    }
}
