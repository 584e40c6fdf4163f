//! Persistence traits consumed by the ingestion modules

use crate::error::IndexerResult;
use crate::ops::{CoinMintOp, CoinSpendOp, CoinWriteSummary, RollbackSummary, TxOp};
use crate::types::{
    Address, BlockHash, BlockRecord, ChainNetwork, Coin, CoinKey, TransactionRecord, TxId,
    WalletAddress, WalletId,
};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};

/// Durable mirror of blocks, transactions and coins.
///
/// Every write is an upsert by natural key with a guard predicate, so
/// replaying any operation leaves the store unchanged.
#[async_trait]
pub trait ChainStore: Send + Sync {
    /// Look up a block by hash
    async fn get_block(&self, chain: &ChainNetwork, hash: &str)
        -> IndexerResult<Option<BlockRecord>>;

    /// Highest processed block
    async fn get_local_tip(&self, chain: &ChainNetwork) -> IndexerResult<Option<BlockRecord>>;

    /// Hashes of processed blocks, highest first
    async fn get_recent_block_hashes(
        &self,
        chain: &ChainNetwork,
        limit: usize,
    ) -> IndexerResult<Vec<BlockHash>>;

    /// Insert or overwrite a block
    async fn upsert_block(&self, block: &BlockRecord) -> IndexerResult<()>;

    /// Set `next_block_hash` on a stored block, if present
    async fn set_next_block_hash(
        &self,
        chain: &ChainNetwork,
        hash: &str,
        next_block_hash: &str,
    ) -> IndexerResult<()>;

    /// Flip the block's durability fence
    async fn mark_block_processed(&self, chain: &ChainNetwork, hash: &str) -> IndexerResult<()>;

    /// Apply mints then spends, unordered; guard failures are reported, not raised
    async fn bulk_write_coins(
        &self,
        mints: &[CoinMintOp],
        spends: &[CoinSpendOp],
    ) -> IndexerResult<CoinWriteSummary>;

    /// Upsert transactions
    async fn bulk_write_transactions(&self, ops: &[TxOp]) -> IndexerResult<()>;

    /// Look up a coin by natural key
    async fn get_coin(&self, key: &CoinKey) -> IndexerResult<Option<Coin>>;

    /// Coins minted at `mint_height` that were spent (or pending) below `spent_below`
    async fn find_spent_coins_minted_at(
        &self,
        chain: &ChainNetwork,
        mint_height: u64,
        spent_below: u64,
    ) -> IndexerResult<Vec<Coin>>;

    /// Distinct wallets of the coins minted or spent by each txid
    async fn aggregate_tx_wallets(
        &self,
        chain: &ChainNetwork,
        txids: &[TxId],
    ) -> IndexerResult<HashMap<TxId, BTreeSet<WalletId>>>;

    /// Look up a transaction
    async fn get_transaction(
        &self,
        chain: &ChainNetwork,
        txid: &str,
    ) -> IndexerResult<Option<TransactionRecord>>;

    /// Remove everything at or above `height`, un-spending coins spent there.
    /// Atomic per (chain, network).
    async fn rollback_from_height(
        &self,
        chain: &ChainNetwork,
        height: u64,
    ) -> IndexerResult<RollbackSummary>;

    async fn is_initial_sync_complete(&self, chain: &ChainNetwork) -> IndexerResult<bool>;

    async fn set_initial_sync_complete(&self, chain: &ChainNetwork) -> IndexerResult<()>;
}

/// Address-to-wallet lookups
#[async_trait]
pub trait WalletResolver: Send + Sync {
    async fn find_wallets_for_addresses(
        &self,
        chain: &ChainNetwork,
        addresses: &[Address],
    ) -> IndexerResult<Vec<WalletAddress>>;
}
