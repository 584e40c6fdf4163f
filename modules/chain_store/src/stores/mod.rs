//! Store backends and the guarded-write rules they share

use tessera_common::ops::{CoinMintOp, CoinSpendOp, CoinWriteSummary};
use tessera_common::{BlockRecord, Coin, CoinKey, IndexerError, IndexerResult, SpendState};
use tracing::{debug, error};

pub mod fjall;
pub mod memory;

#[cfg(test)]
pub(crate) mod conformance;

/// New state of a coin after a mint upsert, or `None` when the guard rejects it.
///
/// The guard matches only coins that are not confirmed-spent, so replaying a
/// mint never un-spends a coin. A pending mempool spend survives a re-mint
/// that carries no spend of its own.
pub(crate) fn apply_mint(existing: Option<&Coin>, op: &CoinMintOp) -> Option<Coin> {
    match existing {
        Some(coin) if !coin.spend.is_spendable() => None,
        Some(coin) => {
            let mut updated = op.to_coin();
            if updated.spend == SpendState::Unspent {
                updated.spend = coin.spend.clone();
            }
            if updated.script.is_none() && updated.spend.is_spendable() {
                updated.script = coin.script.clone();
            }
            Some(updated)
        }
        None => Some(op.to_coin()),
    }
}

/// Block to store when `block` is upserted over `existing`.
///
/// Rewriting a known block keeps its link to a stored successor and never
/// takes it back out of the processed set.
pub(crate) fn apply_block_upsert(
    existing: Option<&BlockRecord>,
    block: &BlockRecord,
) -> BlockRecord {
    let mut updated = block.clone();
    if let Some(existing) = existing {
        if updated.next_block_hash.is_none() {
            updated.next_block_hash = existing.next_block_hash.clone();
        }
        updated.processed |= existing.processed;
    }
    updated
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SpendOutcome {
    Applied(Coin),
    /// The same transaction already spent it
    AlreadyApplied,
    Missing,
    Conflict { existing_txid: String },
}

pub(crate) fn apply_spend(existing: Option<&Coin>, op: &CoinSpendOp) -> SpendOutcome {
    let Some(coin) = existing else {
        return SpendOutcome::Missing;
    };
    match &coin.spend {
        SpendState::SpentAtHeight(txid, _) if *txid == op.spent_txid => {
            SpendOutcome::AlreadyApplied
        }
        SpendState::SpentAtHeight(txid, _) => SpendOutcome::Conflict {
            existing_txid: txid.clone(),
        },
        _ => {
            let mut updated = coin.clone();
            updated.spend = SpendState::spent_by(&op.spent_txid, op.spent_height);
            if op.prune_script {
                updated.script = None;
            }
            SpendOutcome::Applied(updated)
        }
    }
}

/// Coin state after rolling back to below `height`; `None` if the coin goes
pub(crate) fn rollback_coin(coin: &Coin, height: u64) -> Option<Coin> {
    if coin.mint_height.at_or_above(height) {
        return None;
    }
    let mut coin = coin.clone();
    if matches!(coin.spend, SpendState::SpentAtHeight(_, spent) if spent >= height) {
        coin.spend = SpendState::Unspent;
    }
    Some(coin)
}

/// Keyed coin access used by [`write_coins`]
pub(crate) trait CoinTable {
    fn load(&mut self, key: &CoinKey) -> IndexerResult<Option<Coin>>;

    /// Persist `coin`, replacing `previous` if there was one
    fn save(&mut self, previous: Option<&Coin>, coin: Coin) -> IndexerResult<()>;
}

/// Apply mints then spends against `table`.
///
/// Guard failures never abort the write; they are counted in the summary.
pub(crate) fn write_coins(
    table: &mut impl CoinTable,
    mints: &[CoinMintOp],
    spends: &[CoinSpendOp],
) -> IndexerResult<CoinWriteSummary> {
    let mut summary = CoinWriteSummary::default();

    for op in mints {
        let existing = table.load(&op.key)?;
        if let Some(coin) = apply_mint(existing.as_ref(), op) {
            table.save(existing.as_ref(), coin)?;
            summary.minted += 1;
        }
    }

    for op in spends {
        let existing = table.load(&op.key)?;
        match apply_spend(existing.as_ref(), op) {
            SpendOutcome::Applied(coin) => {
                table.save(existing.as_ref(), coin)?;
                summary.spent += 1;
            }
            SpendOutcome::AlreadyApplied => {}
            SpendOutcome::Missing => {
                debug!(chain = %op.key.chain, network = %op.key.network, coin = %op.key,
                       "Spend of unknown coin by {}", op.spent_txid);
                summary.missing += 1;
            }
            SpendOutcome::Conflict { existing_txid } => {
                let conflict = IndexerError::DoubleSpendConflict {
                    mint_txid: op.key.mint_txid.clone(),
                    mint_index: op.key.mint_index,
                    spent_txid: op.spent_txid.clone(),
                    existing_txid,
                };
                error!(chain = %op.key.chain, network = %op.key.network, "{conflict}");
                summary.conflicts.push(op.key.clone());
            }
        }
    }

    Ok(summary)
}

impl CoinTable for std::collections::HashMap<CoinKey, Coin> {
    fn load(&mut self, key: &CoinKey) -> IndexerResult<Option<Coin>> {
        Ok(self.get(key).cloned())
    }

    fn save(&mut self, _previous: Option<&Coin>, coin: Coin) -> IndexerResult<()> {
        self.insert(coin.key.clone(), coin);
        Ok(())
    }
}
