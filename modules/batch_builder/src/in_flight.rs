//! Index from outpoint to the unflushed mint op that creates it

use std::collections::HashMap;
use tessera_common::ops::CoinMintOp;
use tessera_common::TxId;

/// Finds mint ops still sitting in the current batch so a spend of them can
/// be folded into the mint instead of costing a store round trip.
///
/// Indexes a flat slice of mint ops incrementally. A slice shorter than what
/// has already been indexed belongs to a new batch, and the index restarts.
#[derive(Debug, Default)]
pub struct InFlightSpendResolver {
    mints: HashMap<TxId, HashMap<u32, usize>>,
    indexed: usize,
}

impl InFlightSpendResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bring the index up to date with `mint_ops`
    pub fn sync(&mut self, mint_ops: &[CoinMintOp]) {
        if mint_ops.len() < self.indexed {
            self.clear();
        }
        for (position, op) in mint_ops.iter().enumerate().skip(self.indexed) {
            self.mints
                .entry(op.key.mint_txid.clone())
                .or_default()
                .entry(op.key.mint_index)
                .or_insert(position);
        }
        self.indexed = mint_ops.len();
    }

    /// Position of the mint op for `(mint_txid, mint_index)`, if it is in flight
    pub fn resolve(&self, mint_txid: &str, mint_index: u32) -> Option<usize> {
        self.mints.get(mint_txid).and_then(|outputs| outputs.get(&mint_index)).copied()
    }

    pub fn indexed(&self) -> usize {
        self.indexed
    }

    pub fn clear(&mut self) {
        self.mints.clear();
        self.indexed = 0;
    }
}
