//! Fee estimation by measuring a throwaway, fully signed spend.

use std::str::FromStr;

use bitcoin::hashes::Hash;
use bitcoin::key::Keypair;
use bitcoin::secp256k1::{Message, Secp256k1, SecretKey};
use bitcoin::sighash::{Prevouts, SighashCache, TapSighashType};
use bitcoin::taproot;
use bitcoin::{
    absolute, transaction, Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid,
    Witness,
};
use serde::Deserialize;

use crate::address::LeafSpend;
use crate::error::{CustodyError, Result};
use crate::leaf::signature_count;

/// Lowest fee the protocol pays for any transaction.
pub const PROTOCOL_FEE_FLOOR: Amount = Amount::from_sat(300);

/// Signing key for fee simulation only.
///
/// SECURITY: this key is public. It signs transactions that are measured and
/// thrown away; never derive an address from it or send funds to it.
const SIMULATION_SECRET: [u8; 32] = [0x0a; 32];

const SIMULATION_OUTPOINT: &str =
    "75ddabb27b8845f5247975c8a5ba7c6f336c4570708ebe230caf6db5217ae858";
const SIMULATION_INPUT_VALUE: Amount = Amount::from_sat(2000);
const SIMULATION_OUTPUT_VALUE: Amount = Amount::from_sat(1500);

/// `GET /v1/fees/recommended`, rates in sat/vB.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeeRates {
    pub fastest_fee: u64,
    #[serde(default)]
    pub half_hour_fee: u64,
    #[serde(default)]
    pub hour_fee: u64,
    #[serde(default)]
    pub economy_fee: u64,
    /// Used as an absolute lower bound in sats
    pub minimum_fee: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeEstimate {
    pub vsize: usize,
    pub fee: Amount,
}

/// `max(300, minimum_fee, vsize * fastest_fee)`
pub fn fee_for_vsize(vsize: usize, rates: &FeeRates) -> Amount {
    let by_rate = Amount::from_sat((vsize as u64).saturating_mul(rates.fastest_fee));
    PROTOCOL_FEE_FLOOR
        .max(Amount::from_sat(rates.minimum_fee))
        .max(by_rate)
}

/// Size and fee of spending one output through `leaf` to `recipient`.
pub fn estimate_fee(leaf: &LeafSpend, recipient: &ScriptBuf, rates: &FeeRates) -> Result<FeeEstimate> {
    let vsize = simulate_vsize(leaf, recipient)?;
    Ok(FeeEstimate {
        vsize,
        fee: fee_for_vsize(vsize, rates),
    })
}

fn simulate_vsize(leaf: &LeafSpend, recipient: &ScriptBuf) -> Result<usize> {
    let secp = Secp256k1::new();
    let secret = SecretKey::from_slice(&SIMULATION_SECRET)
        .map_err(|e| CustodyError::Taproot(e.to_string()))?;
    let keypair = Keypair::from_secret_key(&secp, &secret);
    let txid = Txid::from_str(SIMULATION_OUTPOINT)
        .map_err(|e| CustodyError::Taproot(e.to_string()))?;

    let mut tx = Transaction {
        version: transaction::Version::TWO,
        lock_time: absolute::LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint::new(txid, 0),
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: SIMULATION_OUTPUT_VALUE,
            script_pubkey: recipient.clone(),
        }],
    };

    let prevouts = [TxOut {
        value: SIMULATION_INPUT_VALUE,
        script_pubkey: recipient.clone(),
    }];
    let sighash = SighashCache::new(&tx).taproot_script_spend_signature_hash(
        0,
        &Prevouts::All(&prevouts),
        leaf.leaf_hash,
        TapSighashType::Default,
    )?;
    let signature = taproot::Signature {
        signature: secp.sign_schnorr_no_aux_rand(
            &Message::from_digest(sighash.to_byte_array()),
            &keypair,
        ),
        sighash_type: TapSighashType::Default,
    };

    let mut witness = Witness::new();
    for _ in 0..signature_count(&leaf.script) {
        witness.push(signature.to_vec());
    }
    witness.push(leaf.script.as_bytes());
    witness.push(leaf.control_block.serialize());
    tx.input[0].witness = witness;

    Ok(tx.vsize())
}
