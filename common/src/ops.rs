//! Idempotent write operations produced by the batch builder

use crate::error::{IndexerError, IndexerResult};
use crate::types::{
    Address, BlockHash, BlockRecord, Coin, CoinKey, Height, SpendState, TransactionRecord, TxId,
    WalletId,
};
use std::collections::BTreeSet;
use std::ops::Range;

/// Upsert of a coin keyed by its natural key, guarded on the coin being unspent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoinMintOp {
    pub key: CoinKey,
    pub mint_height: Height,
    pub value: u128,
    pub address: Option<Address>,
    pub script: Option<Vec<u8>>,
    pub wallets: BTreeSet<WalletId>,
    pub spend: SpendState,
}

impl CoinMintOp {
    /// Fold a spend into this mint so the pair is written once.
    ///
    /// Same guard as a stored spend: a confirmed spend is never replaced,
    /// repeating it is a no-op and a different spender is a conflict.
    pub fn fold_spend(
        &mut self,
        spent_txid: &str,
        height: Height,
        prune_script: bool,
    ) -> IndexerResult<()> {
        if let SpendState::SpentAtHeight(existing, _) = &self.spend {
            if existing == spent_txid {
                return Ok(());
            }
            return Err(IndexerError::DoubleSpendConflict {
                mint_txid: self.key.mint_txid.clone(),
                mint_index: self.key.mint_index,
                spent_txid: spent_txid.to_string(),
                existing_txid: existing.clone(),
            });
        }
        self.spend = SpendState::spent_by(spent_txid, height);
        if prune_script && matches!(height, Height::Confirmed(h) if h > 0) {
            self.script = None;
        }
        Ok(())
    }

    pub fn to_coin(&self) -> Coin {
        Coin {
            key: self.key.clone(),
            mint_height: self.mint_height,
            value: self.value,
            address: self.address.clone(),
            script: self.script.clone(),
            wallets: self.wallets.clone(),
            spend: self.spend.clone(),
        }
    }
}

/// Guarded update marking an existing coin spent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoinSpendOp {
    pub key: CoinKey,
    pub spent_txid: TxId,
    pub spent_height: Height,
    /// Unset the stored script as part of the spend
    pub prune_script: bool,
}

/// Upsert of a transaction keyed by (txid, chain, network)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxOp {
    pub record: TransactionRecord,
}

/// Back-fill of a stored block's `next_block_hash`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviousBlockPatch {
    pub hash: BlockHash,
    pub next_block_hash: BlockHash,
}

/// One block's share of a batch: the block upsert plus the ranges of
/// coin and transaction operations it contributed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockOp {
    pub block: BlockRecord,
    pub previous_block_patch: Option<PreviousBlockPatch>,
    pub mint_ops: Range<usize>,
    pub spend_ops: Range<usize>,
    pub tx_ops: Range<usize>,
}

/// Operations accumulated across blocks and not yet flushed
#[derive(Debug, Clone, Default)]
pub struct OpBatch {
    pub blocks: Vec<BlockOp>,
    pub mint_ops: Vec<CoinMintOp>,
    pub spend_ops: Vec<CoinSpendOp>,
    pub tx_ops: Vec<TxOp>,
    /// In-flight spends dropped because their coin was already spent
    pub conflicts: Vec<CoinKey>,
}

impl OpBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
            && self.mint_ops.is_empty()
            && self.spend_ops.is_empty()
            && self.tx_ops.is_empty()
    }

    pub fn last_block(&self) -> Option<&BlockRecord> {
        self.blocks.last().map(|op| &op.block)
    }
}

/// Outcome of an unordered coin bulk write
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoinWriteSummary {
    pub minted: usize,
    pub spent: usize,
    /// Spends whose coin was not found
    pub missing: usize,
    /// Spends dropped because the coin was already spent by another transaction
    pub conflicts: Vec<CoinKey>,
}

/// What a rollback removed or repaired
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RollbackSummary {
    pub blocks_removed: usize,
    pub transactions_removed: usize,
    pub coins_removed: usize,
    pub coins_unspent: usize,
}
