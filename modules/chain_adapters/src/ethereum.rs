//! Account-family adapter (Ethereum and its forks)
//!
//! Blocks arrive as JSON with hex quantities, the shape returned by
//! `eth_getBlockByHash` with full transaction objects. Each transaction is
//! fitted to the coin model with one synthetic input spending its own
//! `(txid, 0)` and one output paying the recipient.

use crate::{ChainAdapter, ChainFamily, WireBlock, WireTx, WireTxRef};
use alloy_primitives::{Address, Bytes, B256, U256, U64};
use alloy_rpc_types_eth::Header;
use serde::{Deserialize, Serialize};
use tessera_common::{
    BlockExtension, ChainNetwork, IndexerError, IndexerResult, NormalizedBlock,
    NormalizedTransaction, TxExtension, TxInput, TxOutput,
};

/// Static block reward recorded for account-family blocks
const BLOCK_REWARD: u128 = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EthBlock {
    #[serde(flatten)]
    pub header: Header,
    #[serde(default)]
    pub transactions: Vec<EthTransaction>,
}

/// Transaction object as embedded in a full block, optionally merged with
/// its receipt's `gasUsed`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EthTransaction {
    pub hash: B256,
    pub nonce: U64,
    #[serde(default)]
    pub from: Option<Address>,
    /// Absent for contract creation
    #[serde(default)]
    pub to: Option<Address>,
    pub value: U256,
    pub gas: U64,
    pub gas_price: U256,
    #[serde(default)]
    pub input: Bytes,
    #[serde(default)]
    pub gas_used: Option<U64>,
}

pub struct EthereumAdapter;

impl ChainAdapter for EthereumAdapter {
    fn family(&self) -> ChainFamily {
        ChainFamily::Account
    }

    fn decode_block(&self, raw: &[u8]) -> IndexerResult<WireBlock> {
        let block: EthBlock = serde_json::from_slice(raw)
            .map_err(|e| IndexerError::malformed(format!("account block: {e}")))?;
        Ok(WireBlock::Account(block))
    }

    fn decode_tx(&self, raw: &[u8]) -> IndexerResult<WireTx> {
        let tx: EthTransaction = serde_json::from_slice(raw)
            .map_err(|e| IndexerError::malformed(format!("account transaction: {e}")))?;
        Ok(WireTx::Account(tx))
    }

    fn convert_block(
        &self,
        chain: &ChainNetwork,
        block: &WireBlock,
    ) -> IndexerResult<NormalizedBlock> {
        let WireBlock::Account(block) = block else {
            return Err(IndexerError::malformed("expected an account-family block"));
        };
        let header = &block.header;
        let time = header
            .timestamp
            .checked_mul(1000)
            .ok_or_else(|| IndexerError::malformed("timestamp out of range"))?;
        let size = header.size.map(|size| to_u64(size, "size")).transpose()?;

        Ok(NormalizedBlock {
            chain: chain.chain.clone(),
            network: chain.network.clone(),
            height: Some(header.number),
            hash: hex::encode(header.hash),
            previous_block_hash: hex::encode(header.parent_hash),
            next_block_hash: None,
            version: 1,
            merkle_root: hex::encode(header.transactions_root),
            time,
            time_normalized: time,
            nonce: u64::from_be_bytes(header.nonce.0),
            bits: 0,
            transaction_count: block.transactions.len() as u64,
            size: size.unwrap_or_default(),
            reward: BLOCK_REWARD,
            processed: false,
            extension: BlockExtension::Account {
                gas_limit: header.gas_limit,
                gas_used: header.gas_used,
                state_root: hex::encode(header.state_root),
            },
        })
    }

    fn convert_tx(
        &self,
        chain: &ChainNetwork,
        tx: WireTxRef<'_>,
        block: Option<&NormalizedBlock>,
    ) -> IndexerResult<NormalizedTransaction> {
        let WireTxRef::Account(tx) = tx else {
            return Err(IndexerError::malformed("expected an account-family transaction"));
        };
        let txid = hex::encode(tx.hash);
        let gas_limit = tx.gas.to::<u64>();
        let gas_used = tx.gas_used.map_or(gas_limit, |used| used.to::<u64>());
        let fee = tx
            .gas_price
            .checked_mul(U256::from(gas_used))
            .ok_or_else(|| IndexerError::malformed("fee overflows"))?;

        Ok(NormalizedTransaction {
            chain: chain.chain.clone(),
            network: chain.network.clone(),
            txid: txid.clone(),
            block_height: block.and_then(|b| b.height),
            block_hash: block.map(|b| b.hash.clone()),
            block_time: block.map(|b| b.time),
            block_time_normalized: block.map(|b| b.time_normalized),
            size: tx.input.len() as u64,
            fee: Some(to_u128(fee, "fee")?),
            wallets: Default::default(),
            extension: TxExtension::Account {
                gas_limit,
                gas_price: to_u128(tx.gas_price, "gasPrice")?,
                nonce: tx.nonce.to::<u64>(),
                data: format!("0x{}", hex::encode(&tx.input)),
            },
            inputs: vec![TxInput {
                mint_txid: txid,
                mint_index: 0,
            }],
            outputs: vec![TxOutput {
                value: to_u128(tx.value, "value")?,
                address: tx.to.map(|to| format!("0x{}", hex::encode(to))),
                script: None,
            }],
        })
    }
}

fn to_u64(value: U256, field: &str) -> IndexerResult<u64> {
    u64::try_from(value).map_err(|_| IndexerError::malformed(format!("{field} out of range")))
}

/// Coin values are u128; larger wei amounts cannot exist on a real chain
fn to_u128(value: U256, field: &str) -> IndexerResult<u128> {
    u128::try_from(value).map_err(|_| IndexerError::malformed(format!("{field} out of range")))
}
