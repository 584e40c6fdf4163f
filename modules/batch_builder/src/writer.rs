//! Writes built batches to the store, block by block

use std::sync::Arc;
use std::time::Instant;
use tessera_common::messages::IndexerEvent;
use tessera_common::ops::{CoinWriteSummary, OpBatch};
use tessera_common::store::ChainStore;
use tessera_common::IndexerResult;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Totals for one flushed batch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchWriteSummary {
    pub blocks: usize,
    pub transactions: usize,
    pub coins: CoinWriteSummary,
}

impl BatchWriteSummary {
    fn absorb(&mut self, coins: CoinWriteSummary) {
        self.coins.minted += coins.minted;
        self.coins.spent += coins.spent;
        self.coins.missing += coins.missing;
        self.coins.conflicts.extend(coins.conflicts);
    }
}

pub struct BlockWriter {
    store: Arc<dyn ChainStore>,
    events: broadcast::Sender<IndexerEvent>,
}

impl BlockWriter {
    pub fn new(store: Arc<dyn ChainStore>, events: broadcast::Sender<IndexerEvent>) -> Self {
        Self { store, events }
    }

    /// Persist every block of `batch` in order.
    ///
    /// Each block is stored unprocessed first and only marked processed once
    /// its coins and transactions are written, so a crash part way through
    /// leaves a block that locators and tip lookups ignore.
    pub async fn process_block_ops(&self, batch: &OpBatch) -> IndexerResult<BatchWriteSummary> {
        let started = Instant::now();
        let mut summary = BatchWriteSummary::default();
        summary.coins.conflicts.extend(batch.conflicts.iter().cloned());

        for (index, op) in batch.blocks.iter().enumerate() {
            let chain = op.block.chain_network();
            let mut block = op.block.clone();
            block.processed = false;

            // Successors in the same batch are linked here rather than patched later
            if let Some(next) = batch.blocks.get(index + 1) {
                if next.block.previous_block_hash == block.hash {
                    block.next_block_hash = Some(next.block.hash.clone());
                }
            }
            let linked_in_batch = index > 0
                && batch.blocks[index - 1].block.hash == op.block.previous_block_hash;
            if let Some(patch) = op.previous_block_patch.as_ref().filter(|_| !linked_in_batch) {
                self.store.set_next_block_hash(&chain, &patch.hash, &patch.next_block_hash).await?;
            }

            self.store.upsert_block(&block).await?;
            let coins = self
                .store
                .bulk_write_coins(
                    &batch.mint_ops[op.mint_ops.clone()],
                    &batch.spend_ops[op.spend_ops.clone()],
                )
                .await?;
            let tx_ops = &batch.tx_ops[op.tx_ops.clone()];
            self.store.bulk_write_transactions(tx_ops).await?;
            self.store.mark_block_processed(&chain, &block.hash).await?;

            debug!(
                chain = %chain,
                height = block.height,
                hash = %block.hash,
                minted = coins.minted,
                spent = coins.spent,
                "Block processed"
            );
            summary.blocks += 1;
            summary.transactions += tx_ops.len();
            summary.absorb(coins);

            block.processed = true;
            let _ = self.events.send(IndexerEvent::Block(block));
            for tx in tx_ops {
                let _ = self.events.send(IndexerEvent::Transaction(tx.record.clone()));
            }
        }

        if let Some(last) = batch.last_block() {
            info!(
                chain = %last.chain_network(),
                tip = last.height,
                blocks = summary.blocks,
                transactions = summary.transactions,
                conflicts = summary.coins.conflicts.len(),
                "Wrote batch in {:?}",
                started.elapsed()
            );
        }
        Ok(summary)
    }

    /// Persist a batch of unconfirmed transactions
    pub async fn write_unconfirmed(&self, batch: &OpBatch) -> IndexerResult<BatchWriteSummary> {
        let mut summary = BatchWriteSummary::default();
        summary.coins.conflicts.extend(batch.conflicts.iter().cloned());
        let coins = self.store.bulk_write_coins(&batch.mint_ops, &batch.spend_ops).await?;
        self.store.bulk_write_transactions(&batch.tx_ops).await?;
        summary.transactions = batch.tx_ops.len();
        summary.absorb(coins);

        for tx in &batch.tx_ops {
            let _ = self.events.send(IndexerEvent::Transaction(tx.record.clone()));
        }
        debug!("Wrote {} mempool transactions", summary.transactions);
        Ok(summary)
    }
}
