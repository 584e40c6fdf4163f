//! Canonical chain data model shared by adapters, builders and stores

use crate::error::{IndexerError, IndexerResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

pub type BlockHash = String;
pub type TxId = String;
pub type Address = String;
pub type WalletId = String;

/// Storage sentinel for a confirmed, unspent coin
pub const UNSPENT_HEIGHT: i64 = -2;

/// Storage sentinel for a mempool (unconfirmed) height
pub const MEMPOOL_HEIGHT: i64 = -1;

/// Locator sent when nothing has been indexed yet
pub const ZERO_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// A (chain, network) pair, e.g. BTC on mainnet
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChainNetwork {
    pub chain: String,
    pub network: String,
}

impl ChainNetwork {
    pub fn new(chain: impl Into<String>, network: impl Into<String>) -> Self {
        Self {
            chain: chain.into(),
            network: network.into(),
        }
    }
}

impl fmt::Display for ChainNetwork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.chain, self.network)
    }
}

/// Height a coin was minted or a transaction was included at
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Height {
    Mempool,
    Confirmed(u64),
}

impl Height {
    pub fn confirmed(&self) -> Option<u64> {
        match self {
            Height::Mempool => None,
            Height::Confirmed(height) => Some(*height),
        }
    }

    pub fn to_storage(&self) -> i64 {
        match self {
            Height::Mempool => MEMPOOL_HEIGHT,
            Height::Confirmed(height) => *height as i64,
        }
    }

    pub fn from_storage(height: i64) -> IndexerResult<Self> {
        match height {
            MEMPOOL_HEIGHT => Ok(Height::Mempool),
            h if h >= 0 => Ok(Height::Confirmed(h as u64)),
            h => Err(IndexerError::malformed(format!("invalid stored height {h}"))),
        }
    }

    /// Whether this height is at or above `floor`; mempool heights never are
    pub fn at_or_above(&self, floor: u64) -> bool {
        matches!(self, Height::Confirmed(h) if *h >= floor)
    }
}

impl fmt::Display for Height {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Height::Mempool => write!(f, "mempool"),
            Height::Confirmed(height) => write!(f, "{height}"),
        }
    }
}

/// Spend state of a coin.
///
/// Stored as a single signed height: `-2` unspent, `-1` spent by a mempool
/// transaction, `>= 0` spent at that height. The spend guard accepts coins in
/// either of the first two states.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpendState {
    Unspent,
    PendingInMempool(TxId),
    SpentAtHeight(TxId, u64),
}

impl SpendState {
    pub fn spent_by(txid: impl Into<TxId>, height: Height) -> Self {
        match height {
            Height::Mempool => SpendState::PendingInMempool(txid.into()),
            Height::Confirmed(h) => SpendState::SpentAtHeight(txid.into(), h),
        }
    }

    /// True while a spend may still be applied (the `spentHeight < 0` guard)
    pub fn is_spendable(&self) -> bool {
        !matches!(self, SpendState::SpentAtHeight(..))
    }

    pub fn spent_txid(&self) -> Option<&str> {
        match self {
            SpendState::Unspent => None,
            SpendState::PendingInMempool(txid) | SpendState::SpentAtHeight(txid, _) => Some(txid),
        }
    }

    pub fn spent_height(&self) -> Option<u64> {
        match self {
            SpendState::SpentAtHeight(_, height) => Some(*height),
            _ => None,
        }
    }

    pub fn storage_height(&self) -> i64 {
        match self {
            SpendState::Unspent => UNSPENT_HEIGHT,
            SpendState::PendingInMempool(_) => MEMPOOL_HEIGHT,
            SpendState::SpentAtHeight(_, height) => *height as i64,
        }
    }

    pub fn from_storage(height: i64, spent_txid: Option<TxId>) -> IndexerResult<Self> {
        match (height, spent_txid) {
            (UNSPENT_HEIGHT, _) => Ok(SpendState::Unspent),
            (MEMPOOL_HEIGHT, Some(txid)) => Ok(SpendState::PendingInMempool(txid)),
            (h, Some(txid)) if h >= 0 => Ok(SpendState::SpentAtHeight(txid, h as u64)),
            (h, txid) => Err(IndexerError::malformed(format!(
                "invalid stored spend state: height {h}, txid {txid:?}"
            ))),
        }
    }
}

/// Chain-specific block fields
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockExtension {
    #[default]
    None,
    Account {
        gas_limit: u64,
        gas_used: u64,
        state_root: String,
    },
}

/// Chain-specific transaction fields
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxExtension {
    Utxo {
        locktime: u32,
        coinbase: bool,
    },
    Account {
        gas_limit: u64,
        gas_price: u128,
        nonce: u64,
        data: String,
    },
}

impl TxExtension {
    pub fn is_coinbase(&self) -> bool {
        matches!(self, TxExtension::Utxo { coinbase: true, .. })
    }
}

/// A block as produced by a chain adapter, before linkage is finalised
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedBlock {
    pub chain: String,
    pub network: String,
    /// Self-reported height, if the wire format carries one
    pub height: Option<u64>,
    pub hash: BlockHash,
    pub previous_block_hash: BlockHash,
    pub next_block_hash: Option<BlockHash>,
    pub version: u32,
    pub merkle_root: String,
    /// Milliseconds since the epoch
    pub time: u64,
    pub time_normalized: u64,
    pub nonce: u64,
    pub bits: u32,
    pub transaction_count: u64,
    pub size: u64,
    pub reward: u128,
    pub processed: bool,
    pub extension: BlockExtension,
}

impl NormalizedBlock {
    pub fn chain_network(&self) -> ChainNetwork {
        ChainNetwork::new(&self.chain, &self.network)
    }
}

/// A stored block with height and normalised time assigned
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRecord {
    pub chain: String,
    pub network: String,
    pub height: u64,
    pub hash: BlockHash,
    pub previous_block_hash: BlockHash,
    pub next_block_hash: Option<BlockHash>,
    pub version: u32,
    pub merkle_root: String,
    pub time: u64,
    pub time_normalized: u64,
    pub nonce: u64,
    pub bits: u32,
    pub transaction_count: u64,
    pub size: u64,
    pub reward: u128,
    pub processed: bool,
    pub extension: BlockExtension,
}

impl BlockRecord {
    pub fn chain_network(&self) -> ChainNetwork {
        ChainNetwork::new(&self.chain, &self.network)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxInput {
    pub mint_txid: TxId,
    pub mint_index: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    pub value: u128,
    pub address: Option<Address>,
    pub script: Option<Vec<u8>>,
}

/// A transaction as produced by a chain adapter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedTransaction {
    pub chain: String,
    pub network: String,
    pub txid: TxId,
    pub block_height: Option<u64>,
    pub block_hash: Option<BlockHash>,
    pub block_time: Option<u64>,
    pub block_time_normalized: Option<u64>,
    pub size: u64,
    /// `None` when the fee is only known once inputs are resolved
    pub fee: Option<u128>,
    pub wallets: BTreeSet<WalletId>,
    pub extension: TxExtension,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
}

/// A stored transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub chain: String,
    pub network: String,
    pub txid: TxId,
    pub block_height: Height,
    pub block_hash: Option<BlockHash>,
    pub block_time: u64,
    pub block_time_normalized: u64,
    pub size: u64,
    pub fee: Option<u128>,
    pub wallets: BTreeSet<WalletId>,
    pub extension: TxExtension,
}

/// Natural key of a coin
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CoinKey {
    pub chain: String,
    pub network: String,
    pub mint_txid: TxId,
    pub mint_index: u32,
}

impl CoinKey {
    pub fn new(chain: &ChainNetwork, mint_txid: impl Into<TxId>, mint_index: u32) -> Self {
        Self {
            chain: chain.chain.clone(),
            network: chain.network.clone(),
            mint_txid: mint_txid.into(),
            mint_index,
        }
    }

    pub fn chain_network(&self) -> ChainNetwork {
        ChainNetwork::new(&self.chain, &self.network)
    }
}

impl fmt::Display for CoinKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.mint_txid, self.mint_index)
    }
}

/// A stored coin, one per natural key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coin {
    pub key: CoinKey,
    pub mint_height: Height,
    pub value: u128,
    pub address: Option<Address>,
    pub script: Option<Vec<u8>>,
    pub wallets: BTreeSet<WalletId>,
    pub spend: SpendState,
}

/// A registered address belonging to a wallet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletAddress {
    pub address: Address,
    pub wallet: WalletId,
}

/// Block header as announced by a network source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub hash: BlockHash,
    pub previous_block_hash: BlockHash,
}
