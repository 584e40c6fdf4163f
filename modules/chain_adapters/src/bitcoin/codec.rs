//! Consensus wire format for UTXO-family blocks and transactions

use tessera_common::crypto::{reversed_hex, sha256d};
use tessera_common::{IndexerError, IndexerResult};

const HEADER_SIZE: usize = 80;
const SEGWIT_MARKER: u8 = 0x00;
const SEGWIT_FLAG: u8 = 0x01;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_hash: [u8; 32],
    pub merkle_root: [u8; 32],
    pub time: u32,
    pub bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.version.to_le_bytes());
        out.extend_from_slice(&self.prev_hash);
        out.extend_from_slice(&self.merkle_root);
        out.extend_from_slice(&self.time.to_le_bytes());
        out.extend_from_slice(&self.bits.to_le_bytes());
        out.extend_from_slice(&self.nonce.to_le_bytes());
    }

    pub fn hash(&self) -> [u8; 32] {
        let mut bytes = Vec::with_capacity(HEADER_SIZE);
        self.encode(&mut bytes);
        sha256d(&bytes)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutPoint {
    pub txid: [u8; 32],
    pub index: u32,
}

impl OutPoint {
    pub fn null() -> Self {
        Self {
            txid: [0; 32],
            index: u32::MAX,
        }
    }

    pub fn is_null(&self) -> bool {
        self.txid == [0; 32] && self.index == u32::MAX
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxIn {
    pub previous_output: OutPoint,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
    pub witness: Vec<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxOut {
    pub value: u64,
    pub script_pubkey: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub version: i32,
    pub inputs: Vec<TxIn>,
    pub outputs: Vec<TxOut>,
    pub lock_time: u32,
    /// Hash of the witness-stripped serialisation
    pub txid: [u8; 32],
    /// Full serialised size including witness data
    pub size: usize,
}

impl Transaction {
    /// Build a transaction, computing its txid and size
    pub fn new(version: i32, inputs: Vec<TxIn>, outputs: Vec<TxOut>, lock_time: u32) -> Self {
        let mut tx = Self {
            version,
            inputs,
            outputs,
            lock_time,
            txid: [0; 32],
            size: 0,
        };
        let mut stripped = Vec::new();
        tx.encode_with(&mut stripped, false);
        tx.txid = sha256d(&stripped);
        let mut full = Vec::new();
        tx.encode(&mut full);
        tx.size = full.len();
        tx
    }

    pub fn txid_hex(&self) -> String {
        reversed_hex(&self.txid)
    }

    pub fn is_coinbase(&self) -> bool {
        self.inputs.len() == 1 && self.inputs[0].previous_output.is_null()
    }

    pub fn has_witness(&self) -> bool {
        self.inputs.iter().any(|input| !input.witness.is_empty())
    }

    pub fn output_total(&self) -> u128 {
        self.outputs.iter().map(|output| output.value as u128).sum()
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        self.encode_with(out, self.has_witness());
    }

    fn encode_with(&self, out: &mut Vec<u8>, witness: bool) {
        out.extend_from_slice(&self.version.to_le_bytes());
        if witness {
            out.push(SEGWIT_MARKER);
            out.push(SEGWIT_FLAG);
        }
        write_varint(out, self.inputs.len() as u64);
        for input in &self.inputs {
            out.extend_from_slice(&input.previous_output.txid);
            out.extend_from_slice(&input.previous_output.index.to_le_bytes());
            write_var_bytes(out, &input.script_sig);
            out.extend_from_slice(&input.sequence.to_le_bytes());
        }
        write_varint(out, self.outputs.len() as u64);
        for output in &self.outputs {
            out.extend_from_slice(&output.value.to_le_bytes());
            write_var_bytes(out, &output.script_pubkey);
        }
        if witness {
            for input in &self.inputs {
                write_varint(out, input.witness.len() as u64);
                for item in &input.witness {
                    write_var_bytes(out, item);
                }
            }
        }
        out.extend_from_slice(&self.lock_time.to_le_bytes());
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    pub hash: [u8; 32],
    pub transactions: Vec<Transaction>,
    pub size: usize,
}

impl Block {
    pub fn new(header: BlockHeader, transactions: Vec<Transaction>) -> Self {
        let mut block = Self {
            hash: header.hash(),
            header,
            transactions,
            size: 0,
        };
        block.size = block.encode().len();
        block
    }

    pub fn hash_hex(&self) -> String {
        reversed_hex(&self.hash)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.size.max(HEADER_SIZE));
        self.header.encode(&mut out);
        write_varint(&mut out, self.transactions.len() as u64);
        for tx in &self.transactions {
            tx.encode(&mut out);
        }
        out
    }
}

/// Decode a full serialised block
pub fn decode_block(raw: &[u8]) -> IndexerResult<Block> {
    let mut reader = Reader::new(raw);
    let header_bytes = reader.take(HEADER_SIZE)?;
    let header = read_header(header_bytes)?;
    let hash = sha256d(header_bytes);

    let count = reader.varint()?;
    let mut transactions = Vec::with_capacity(reader.bounded_capacity(count));
    for index in 0..count {
        let tx = read_transaction(&mut reader)
            .map_err(|e| IndexerError::malformed(format!("transaction {index}: {e}")))?;
        transactions.push(tx);
    }
    reader.finish()?;

    Ok(Block {
        header,
        hash,
        transactions,
        size: raw.len(),
    })
}

/// Decode a single serialised transaction
pub fn decode_transaction(raw: &[u8]) -> IndexerResult<Transaction> {
    let mut reader = Reader::new(raw);
    let tx = read_transaction(&mut reader)?;
    reader.finish()?;
    Ok(tx)
}

fn read_header(bytes: &[u8]) -> IndexerResult<BlockHeader> {
    let mut reader = Reader::new(bytes);
    Ok(BlockHeader {
        version: reader.i32()?,
        prev_hash: reader.hash()?,
        merkle_root: reader.hash()?,
        time: reader.u32()?,
        bits: reader.u32()?,
        nonce: reader.u32()?,
    })
}

fn read_transaction(reader: &mut Reader<'_>) -> IndexerResult<Transaction> {
    let start = reader.pos;
    let version = reader.i32()?;

    let segwit = reader.peek() == Some(SEGWIT_MARKER);
    if segwit {
        let flag = reader.take(2)?[1];
        if flag != SEGWIT_FLAG {
            return Err(IndexerError::malformed(format!("bad segwit flag {flag:#04x}")));
        }
    }

    let body_start = reader.pos;
    let input_count = reader.varint()?;
    let mut inputs = Vec::with_capacity(reader.bounded_capacity(input_count));
    for _ in 0..input_count {
        let txid = reader.hash()?;
        let index = reader.u32()?;
        let script_sig = reader.var_bytes()?.to_vec();
        let sequence = reader.u32()?;
        inputs.push(TxIn {
            previous_output: OutPoint { txid, index },
            script_sig,
            sequence,
            witness: Vec::new(),
        });
    }

    let output_count = reader.varint()?;
    let mut outputs = Vec::with_capacity(reader.bounded_capacity(output_count));
    for _ in 0..output_count {
        let value = reader.u64()?;
        let script_pubkey = reader.var_bytes()?.to_vec();
        outputs.push(TxOut {
            value,
            script_pubkey,
        });
    }
    let body_end = reader.pos;

    if segwit {
        for input in inputs.iter_mut() {
            let items = reader.varint()?;
            let mut witness = Vec::with_capacity(reader.bounded_capacity(items));
            for _ in 0..items {
                witness.push(reader.var_bytes()?.to_vec());
            }
            input.witness = witness;
        }
    }

    let lock_start = reader.pos;
    let lock_time = reader.u32()?;
    let end = reader.pos;

    let data = reader.data;
    let mut stripped = Vec::with_capacity(8 + body_end - body_start);
    stripped.extend_from_slice(&data[start..start + 4]);
    stripped.extend_from_slice(&data[body_start..body_end]);
    stripped.extend_from_slice(&data[lock_start..end]);

    Ok(Transaction {
        version,
        inputs,
        outputs,
        lock_time,
        txid: sha256d(&stripped),
        size: end - start,
    })
}

fn write_varint(out: &mut Vec<u8>, value: u64) {
    match value {
        0..=0xfc => out.push(value as u8),
        0xfd..=0xffff => {
            out.push(0xfd);
            out.extend_from_slice(&(value as u16).to_le_bytes());
        }
        0x1_0000..=0xffff_ffff => {
            out.push(0xfe);
            out.extend_from_slice(&(value as u32).to_le_bytes());
        }
        _ => {
            out.push(0xff);
            out.extend_from_slice(&value.to_le_bytes());
        }
    }
}

fn write_var_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    write_varint(out, bytes.len() as u64);
    out.extend_from_slice(bytes);
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn peek(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    fn take(&mut self, len: usize) -> IndexerResult<&'a [u8]> {
        if len > self.remaining() {
            return Err(IndexerError::malformed(format!(
                "unexpected end of data at offset {}: wanted {len} bytes, {} left",
                self.pos,
                self.remaining()
            )));
        }
        let bytes = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    fn array<const N: usize>(&mut self) -> IndexerResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u32(&mut self) -> IndexerResult<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn i32(&mut self) -> IndexerResult<i32> {
        Ok(i32::from_le_bytes(self.array()?))
    }

    fn u64(&mut self) -> IndexerResult<u64> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    fn hash(&mut self) -> IndexerResult<[u8; 32]> {
        self.array()
    }

    fn varint(&mut self) -> IndexerResult<u64> {
        let prefix = self.array::<1>()?[0];
        Ok(match prefix {
            0xfd => u16::from_le_bytes(self.array()?) as u64,
            0xfe => u32::from_le_bytes(self.array()?) as u64,
            0xff => u64::from_le_bytes(self.array()?),
            n => n as u64,
        })
    }

    fn var_bytes(&mut self) -> IndexerResult<&'a [u8]> {
        let len = self.varint()?;
        let len = usize::try_from(len)
            .map_err(|_| IndexerError::malformed(format!("length {len} out of range")))?;
        self.take(len)
    }

    // Counts come off the wire, so never preallocate more than the data could hold
    fn bounded_capacity(&self, count: u64) -> usize {
        (count as usize).min(self.remaining())
    }

    fn finish(&self) -> IndexerResult<()> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(IndexerError::malformed(format!("{n} trailing bytes"))),
        }
    }
}
