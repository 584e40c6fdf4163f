//! UTXO-family adapter (Bitcoin and its forks)

pub mod address;
pub mod codec;

use crate::{ChainAdapter, ChainFamily, WireBlock, WireTx, WireTxRef};
use address::{address_for_script, AddressParams};
use tessera_common::crypto::reversed_hex;
use tessera_common::{
    BlockExtension, ChainNetwork, IndexerError, IndexerResult, NormalizedBlock,
    NormalizedTransaction, TxExtension, TxInput, TxOutput,
};

pub struct BitcoinAdapter;

impl ChainAdapter for BitcoinAdapter {
    fn family(&self) -> ChainFamily {
        ChainFamily::Utxo
    }

    fn decode_block(&self, raw: &[u8]) -> IndexerResult<WireBlock> {
        Ok(WireBlock::Utxo(codec::decode_block(raw)?))
    }

    fn decode_tx(&self, raw: &[u8]) -> IndexerResult<WireTx> {
        Ok(WireTx::Utxo(codec::decode_transaction(raw)?))
    }

    fn convert_block(
        &self,
        chain: &ChainNetwork,
        block: &WireBlock,
    ) -> IndexerResult<NormalizedBlock> {
        let WireBlock::Utxo(block) = block else {
            return Err(IndexerError::malformed("expected a UTXO-family block"));
        };
        let header = &block.header;
        let time = header.time as u64 * 1000;
        let reward = block.transactions.first().map(|tx| tx.output_total()).unwrap_or(0);

        Ok(NormalizedBlock {
            chain: chain.chain.clone(),
            network: chain.network.clone(),
            // Assigned from the parent when the block is written
            height: None,
            hash: block.hash_hex(),
            previous_block_hash: reversed_hex(&header.prev_hash),
            next_block_hash: None,
            version: header.version as u32,
            merkle_root: reversed_hex(&header.merkle_root),
            time,
            time_normalized: time,
            nonce: header.nonce as u64,
            bits: header.bits,
            transaction_count: block.transactions.len() as u64,
            size: block.size as u64,
            reward,
            processed: false,
            extension: BlockExtension::None,
        })
    }

    fn convert_tx(
        &self,
        chain: &ChainNetwork,
        tx: WireTxRef<'_>,
        block: Option<&NormalizedBlock>,
    ) -> IndexerResult<NormalizedTransaction> {
        let WireTxRef::Utxo(tx) = tx else {
            return Err(IndexerError::malformed("expected a UTXO-family transaction"));
        };
        let params = AddressParams::for_chain(&chain.chain, &chain.network);
        let coinbase = tx.is_coinbase();

        let inputs = if coinbase {
            Vec::new()
        } else {
            tx.inputs
                .iter()
                .map(|input| TxInput {
                    mint_txid: reversed_hex(&input.previous_output.txid),
                    mint_index: input.previous_output.index,
                })
                .collect()
        };

        let outputs = tx
            .outputs
            .iter()
            .map(|output| TxOutput {
                value: output.value as u128,
                address: address_for_script(&output.script_pubkey, &params),
                script: Some(output.script_pubkey.clone()),
            })
            .collect();

        Ok(NormalizedTransaction {
            chain: chain.chain.clone(),
            network: chain.network.clone(),
            txid: tx.txid_hex(),
            block_height: block.and_then(|b| b.height),
            block_hash: block.map(|b| b.hash.clone()),
            block_time: block.map(|b| b.time),
            block_time_normalized: block.map(|b| b.time_normalized),
            size: tx.size as u64,
            // Needs the spent coins' values, so it is filled in later
            fee: None,
            wallets: Default::default(),
            extension: TxExtension::Utxo {
                locktime: tx.lock_time,
                coinbase,
            },
            inputs,
            outputs,
        })
    }
}
