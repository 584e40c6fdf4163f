//! Common cryptography helper functions for Tessera

use ripemd::Ripemd160;
use sha2::{Digest, Sha256};

/// Double SHA-256, as used for UTXO-family block and transaction ids
pub fn sha256d(data: &[u8]) -> [u8; 32] {
    let first = Sha256::digest(data);
    Sha256::digest(first).into()
}

/// RIPEMD-160 of SHA-256, the key/script hash behind pay-to-hash addresses
pub fn hash160(data: &[u8]) -> [u8; 20] {
    Ripemd160::digest(Sha256::digest(data)).into()
}

/// Hex-encode a hash in the byte-reversed order used for display
pub fn reversed_hex(hash: &[u8]) -> String {
    let mut bytes = hash.to_vec();
    bytes.reverse();
    hex::encode(bytes)
}
