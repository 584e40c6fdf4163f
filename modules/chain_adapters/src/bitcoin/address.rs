//! Address derivation from output scripts

use bech32::{segwit, Hrp};
use tessera_common::crypto::hash160;

const OP_0: u8 = 0x00;
const OP_1: u8 = 0x51;
const OP_DUP: u8 = 0x76;
const OP_HASH160: u8 = 0xa9;
const OP_EQUAL: u8 = 0x87;
const OP_EQUALVERIFY: u8 = 0x88;
const OP_CHECKSIG: u8 = 0xac;

/// Version bytes and segwit prefix for one network
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressParams {
    pub pubkey_hash: u8,
    pub script_hash: u8,
    /// `None` for chains without segwit
    pub segwit_hrp: Option<&'static str>,
}

impl AddressParams {
    pub fn for_chain(chain: &str, network: &str) -> Self {
        let segwit = chain != "BCH";
        match network {
            "mainnet" | "livenet" => Self {
                pubkey_hash: 0x00,
                script_hash: 0x05,
                segwit_hrp: segwit.then_some("bc"),
            },
            "regtest" => Self {
                pubkey_hash: 0x6f,
                script_hash: 0xc4,
                segwit_hrp: segwit.then_some("bcrt"),
            },
            _ => Self {
                pubkey_hash: 0x6f,
                script_hash: 0xc4,
                segwit_hrp: segwit.then_some("tb"),
            },
        }
    }
}

/// Standard output script patterns
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptKind<'a> {
    PayToPubkeyHash(&'a [u8]),
    PayToScriptHash(&'a [u8]),
    PayToPubkey(&'a [u8]),
    WitnessV0KeyHash(&'a [u8]),
    WitnessV0ScriptHash(&'a [u8]),
    Taproot(&'a [u8]),
    NonStandard,
}

pub fn classify(script: &[u8]) -> ScriptKind<'_> {
    match script {
        [OP_DUP, OP_HASH160, 0x14, hash @ .., OP_EQUALVERIFY, OP_CHECKSIG] if hash.len() == 20 => {
            ScriptKind::PayToPubkeyHash(hash)
        }
        [OP_HASH160, 0x14, hash @ .., OP_EQUAL] if hash.len() == 20 => {
            ScriptKind::PayToScriptHash(hash)
        }
        [push, key @ .., OP_CHECKSIG]
            if (*push == 33 || *push == 65) && key.len() == *push as usize =>
        {
            ScriptKind::PayToPubkey(key)
        }
        [OP_0, 0x14, program @ ..] if program.len() == 20 => ScriptKind::WitnessV0KeyHash(program),
        [OP_0, 0x20, program @ ..] if program.len() == 32 => {
            ScriptKind::WitnessV0ScriptHash(program)
        }
        [OP_1, 0x20, program @ ..] if program.len() == 32 => ScriptKind::Taproot(program),
        _ => ScriptKind::NonStandard,
    }
}

/// Derive the address an output pays to.
///
/// Pay-to-pubkey outputs have no address of their own; they are indexed under
/// the pay-to-pubkey-hash address of the key.
pub fn address_for_script(script: &[u8], params: &AddressParams) -> Option<String> {
    match classify(script) {
        ScriptKind::PayToPubkeyHash(hash) => Some(base58(params.pubkey_hash, hash)),
        ScriptKind::PayToScriptHash(hash) => Some(base58(params.script_hash, hash)),
        ScriptKind::PayToPubkey(key) => Some(base58(params.pubkey_hash, &hash160(key))),
        ScriptKind::WitnessV0KeyHash(program) | ScriptKind::WitnessV0ScriptHash(program) => {
            witness(params, segwit::VERSION_0, program)
        }
        ScriptKind::Taproot(program) => witness(params, segwit::VERSION_1, program),
        ScriptKind::NonStandard => None,
    }
}

fn base58(version: u8, payload: &[u8]) -> String {
    let mut bytes = Vec::with_capacity(1 + payload.len());
    bytes.push(version);
    bytes.extend_from_slice(payload);
    bs58::encode(bytes).with_check().into_string()
}

fn witness(params: &AddressParams, version: bech32::Fe32, program: &[u8]) -> Option<String> {
    let hrp = Hrp::parse(params.segwit_hrp?).ok()?;
    segwit::encode(hrp, version, program).ok()
}
