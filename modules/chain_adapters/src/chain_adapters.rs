//! Tessera chain adapters
//! Normalise per-chain wire blocks and transactions into the canonical model

pub mod bitcoin;
pub mod ethereum;

use std::collections::HashMap;
use std::sync::Arc;
use tessera_common::{
    ChainNetwork, IndexerError, IndexerResult, NormalizedBlock, NormalizedTransaction,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainFamily {
    /// Coins are transaction outputs, spent by later inputs
    Utxo,
    /// Balances live on accounts; each transaction is mapped to one synthetic coin
    Account,
}

/// A decoded, not yet normalised, block
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireBlock {
    Utxo(bitcoin::codec::Block),
    Account(ethereum::EthBlock),
}

impl WireBlock {
    pub fn transactions(&self) -> Vec<WireTxRef<'_>> {
        match self {
            WireBlock::Utxo(block) => block.transactions.iter().map(WireTxRef::Utxo).collect(),
            WireBlock::Account(block) => {
                block.transactions.iter().map(WireTxRef::Account).collect()
            }
        }
    }
}

/// A decoded standalone transaction, e.g. from the mempool
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireTx {
    Utxo(bitcoin::codec::Transaction),
    Account(ethereum::EthTransaction),
}

impl WireTx {
    pub fn as_ref(&self) -> WireTxRef<'_> {
        match self {
            WireTx::Utxo(tx) => WireTxRef::Utxo(tx),
            WireTx::Account(tx) => WireTxRef::Account(tx),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireTxRef<'a> {
    Utxo(&'a bitcoin::codec::Transaction),
    Account(&'a ethereum::EthTransaction),
}

/// A normalised block with its transactions in block order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvertedBlock {
    pub block: NormalizedBlock,
    pub transactions: Vec<NormalizedTransaction>,
}

/// Pure conversion from one chain family's wire format to the canonical model
pub trait ChainAdapter: Send + Sync {
    fn family(&self) -> ChainFamily;

    /// Decode a raw block as delivered by a network source
    fn decode_block(&self, raw: &[u8]) -> IndexerResult<WireBlock>;

    /// Decode a raw standalone transaction
    fn decode_tx(&self, raw: &[u8]) -> IndexerResult<WireTx>;

    fn convert_block(&self, chain: &ChainNetwork, block: &WireBlock)
        -> IndexerResult<NormalizedBlock>;

    fn convert_tx(
        &self,
        chain: &ChainNetwork,
        tx: WireTxRef<'_>,
        block: Option<&NormalizedBlock>,
    ) -> IndexerResult<NormalizedTransaction>;

    /// Decode and convert a raw block and all of its transactions
    fn convert_raw_block(&self, chain: &ChainNetwork, raw: &[u8]) -> IndexerResult<ConvertedBlock> {
        let wire = self.decode_block(raw)?;
        let block = self.convert_block(chain, &wire)?;
        let transactions = wire
            .transactions()
            .into_iter()
            .map(|tx| self.convert_tx(chain, tx, Some(&block)))
            .collect::<IndexerResult<Vec<_>>>()?;
        Ok(ConvertedBlock {
            block,
            transactions,
        })
    }

    /// Decode and convert a raw standalone transaction
    fn convert_raw_tx(
        &self,
        chain: &ChainNetwork,
        raw: &[u8],
    ) -> IndexerResult<NormalizedTransaction> {
        let wire = self.decode_tx(raw)?;
        self.convert_tx(chain, wire.as_ref(), None)
    }
}

/// Static map from chain ticker to adapter
pub struct AdapterRegistry {
    adapters: HashMap<&'static str, Arc<dyn ChainAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        let utxo: Arc<dyn ChainAdapter> = Arc::new(bitcoin::BitcoinAdapter);
        let account: Arc<dyn ChainAdapter> = Arc::new(ethereum::EthereumAdapter);

        let mut adapters = HashMap::new();
        adapters.insert("BTC", utxo.clone());
        adapters.insert("BCH", utxo);
        adapters.insert("ETH", account);
        Self { adapters }
    }

    pub fn get(&self, chain: &str) -> IndexerResult<Arc<dyn ChainAdapter>> {
        self.adapters
            .get(chain)
            .cloned()
            .ok_or_else(|| IndexerError::malformed(format!("no adapter registered for {chain}")))
    }

    pub fn chains(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.adapters.keys().copied()
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new()
    }
}
