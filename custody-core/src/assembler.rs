//! Script-path PSBT assembly for custody spends.
//!
//! A [`PendingTransaction`] walks `Building -> Signed(first) -> Signed(second)
//! -> Finalized`, after which the [`FinalizedTransaction`] is either broadcast
//! or dropped. Any signing or finalization error marks the transaction
//! `Failed`; multi-step flows start a fresh instance from the last txid.

use std::fmt;

use bitcoin::consensus::encode::serialize_hex;
use bitcoin::hashes::Hash;
use bitcoin::key::{Keypair, XOnlyPublicKey};
use bitcoin::psbt::Psbt;
use bitcoin::secp256k1::{Message, Secp256k1};
use bitcoin::sighash::{Prevouts, SighashCache, TapSighashType};
use bitcoin::taproot::{self, LeafVersion};
use bitcoin::{
    absolute, transaction, Amount, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness,
};
use tracing::{debug, error, info};

use crate::address::LeafSpend;
use crate::chain::ChainSource;
use crate::error::{CustodyError, Result};
use crate::keyring::{Custodian, CustodianKeySet};
use crate::tree::LeafAuthority;
use crate::utxo::Utxo;

/// Smallest output worth creating; smaller change is left to the fee.
pub const DUST_LIMIT: Amount = Amount::from_sat(546);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxState {
    Building,
    /// Custodians that have signed so far, in order
    Signed(Vec<Custodian>),
    Finalized,
    Broadcast,
    Failed,
}

impl fmt::Display for TxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxState::Building => write!(f, "building"),
            TxState::Signed(by) => {
                let by: Vec<String> = by.iter().map(|c| c.to_string()).collect();
                write!(f, "signed by {}", by.join(","))
            }
            TxState::Finalized => write!(f, "finalized"),
            TxState::Broadcast => write!(f, "broadcast"),
            TxState::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PendingTransaction {
    psbt: Psbt,
    leaves: Vec<LeafSpend>,
    state: TxState,
}

impl PendingTransaction {
    pub fn new() -> Result<Self> {
        let tx = Transaction {
            version: transaction::Version::TWO,
            lock_time: absolute::LockTime::ZERO,
            input: vec![],
            output: vec![],
        };
        Ok(Self {
            psbt: Psbt::from_unsigned_tx(tx)?,
            leaves: vec![],
            state: TxState::Building,
        })
    }

    pub fn state(&self) -> &TxState {
        &self.state
    }

    fn require_building(&self) -> Result<()> {
        match self.state {
            TxState::Building => Ok(()),
            _ => Err(CustodyError::InvalidState {
                expected: "building",
                actual: self.state.to_string(),
            }),
        }
    }

    /// Spend `utxo` through the script leaf described by `leaf`.
    pub fn add_input(&mut self, utxo: &Utxo, leaf: &LeafSpend) -> Result<()> {
        self.require_building()?;

        self.psbt.unsigned_tx.input.push(TxIn {
            previous_output: utxo.outpoint(),
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        });

        let mut input = bitcoin::psbt::Input {
            witness_utxo: Some(TxOut {
                value: utxo.value,
                script_pubkey: utxo.script_pubkey.clone(),
            }),
            tap_internal_key: Some(leaf.internal_key),
            tap_merkle_root: leaf.merkle_root,
            ..Default::default()
        };
        input.tap_scripts.insert(
            leaf.control_block.clone(),
            (leaf.script.clone(), LeafVersion::TapScript),
        );

        self.psbt.inputs.push(input);
        self.leaves.push(leaf.clone());
        Ok(())
    }

    pub fn add_output(&mut self, script_pubkey: ScriptBuf, value: Amount) -> Result<()> {
        self.require_building()?;
        self.psbt.unsigned_tx.output.push(TxOut {
            value,
            script_pubkey,
        });
        self.psbt.outputs.push(Default::default());
        Ok(())
    }

    pub fn input_value(&self) -> Amount {
        self.psbt
            .inputs
            .iter()
            .filter_map(|i| i.witness_utxo.as_ref())
            .map(|o| o.value)
            .sum()
    }

    pub fn output_value(&self) -> Amount {
        self.psbt.unsigned_tx.output.iter().map(|o| o.value).sum()
    }

    /// Add `custodian`'s signature to every input it guards.
    ///
    /// Within each leaf the first key has to sign before the second.
    pub fn sign(&mut self, keys: &CustodianKeySet, custodian: Custodian) -> Result<()> {
        match self.sign_inner(keys, custodian) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.state = TxState::Failed;
                Err(e)
            }
        }
    }

    fn sign_inner(&mut self, keys: &CustodianKeySet, custodian: Custodian) -> Result<()> {
        let mut signed_by = match &self.state {
            TxState::Building => vec![],
            TxState::Signed(by) => by.clone(),
            other => {
                return Err(CustodyError::InvalidState {
                    expected: "building or partially signed",
                    actual: other.to_string(),
                })
            }
        };
        if self.psbt.inputs.is_empty() {
            return Err(CustodyError::InvalidState {
                expected: "at least one input",
                actual: "no inputs".to_string(),
            });
        }

        let mut targets = Vec::new();
        for (index, leaf) in self.leaves.iter().enumerate() {
            let LeafAuthority::Quorum(pair) = leaf.authority else {
                continue;
            };
            let order = pair.signing_order();
            let Some(position) = order.iter().position(|c| *c == custodian) else {
                continue;
            };
            for earlier in &order[..position] {
                let key = keys.x_only(*earlier);
                if !self.psbt.inputs[index]
                    .tap_script_sigs
                    .contains_key(&(key, leaf.leaf_hash))
                {
                    return Err(CustodyError::SigningOrder {
                        input: index,
                        expected: *earlier,
                        got: custodian,
                    });
                }
            }
            targets.push(index);
        }

        if targets.is_empty() {
            return Err(CustodyError::InvalidState {
                expected: "an input guarded by this custodian",
                actual: format!("no leaf lists {}", custodian),
            });
        }

        self.sign_inputs(keys.keypair(custodian), &targets)?;
        debug!(%custodian, inputs = targets.len(), "custodian signed");

        signed_by.push(custodian);
        self.state = TxState::Signed(signed_by);
        Ok(())
    }

    /// Sign the listed inputs' leaves with `keypair`.
    fn sign_inputs(&mut self, keypair: &Keypair, targets: &[usize]) -> Result<()> {
        let secp = Secp256k1::signing_only();
        let (x_only, _) = keypair.x_only_public_key();

        let prevouts = self
            .psbt
            .inputs
            .iter()
            .map(|input| {
                input
                    .witness_utxo
                    .clone()
                    .ok_or_else(|| CustodyError::InvalidState {
                        expected: "witness utxo on every input",
                        actual: "missing witness utxo".to_string(),
                    })
            })
            .collect::<Result<Vec<TxOut>>>()?;

        let mut cache = SighashCache::new(&self.psbt.unsigned_tx);
        for &index in targets {
            let leaf_hash = self.leaves[index].leaf_hash;
            let sighash = cache.taproot_script_spend_signature_hash(
                index,
                &Prevouts::All(&prevouts),
                leaf_hash,
                TapSighashType::Default,
            )?;
            let msg = Message::from_digest(sighash.to_byte_array());
            let signature = secp.sign_schnorr_no_aux_rand(&msg, keypair);

            self.psbt.inputs[index].tap_script_sigs.insert(
                (x_only, leaf_hash),
                taproot::Signature {
                    signature,
                    sighash_type: TapSighashType::Default,
                },
            );
        }
        Ok(())
    }

    /// Each custodian in order, as listed by the leaves' signer pairs.
    pub fn sign_all(&mut self, keys: &CustodianKeySet, order: &[Custodian]) -> Result<()> {
        for custodian in order {
            self.sign(keys, *custodian)?;
        }
        Ok(())
    }

    /// Unsigned PSBT for a wallet to sign.
    pub fn into_psbt(self) -> Psbt {
        self.psbt
    }

    /// Assemble witnesses `[sig(second), sig(first), script, control block]`
    /// and extract the network transaction.
    pub fn finalize(mut self, keys: &CustodianKeySet) -> Result<FinalizedTransaction> {
        if !matches!(self.state, TxState::Signed(_)) {
            return Err(CustodyError::InvalidState {
                expected: "signed",
                actual: self.state.to_string(),
            });
        }

        for (index, leaf) in self.leaves.iter().enumerate() {
            let stack_keys: Vec<XOnlyPublicKey> = match leaf.authority {
                LeafAuthority::Quorum(pair) => {
                    let [first, second] = pair.signing_order();
                    vec![keys.x_only(second), keys.x_only(first)]
                }
                LeafAuthority::User(key) => vec![key],
            };

            let input = &mut self.psbt.inputs[index];
            let mut witness = Witness::new();
            for key in stack_keys {
                let sig = input
                    .tap_script_sigs
                    .get(&(key, leaf.leaf_hash))
                    .ok_or_else(|| CustodyError::InvalidState {
                        expected: "fully signed",
                        actual: format!("input {} is missing a signature", index),
                    })?;
                witness.push(sig.to_vec());
            }
            witness.push(leaf.script.as_bytes());
            witness.push(leaf.control_block.serialize());

            input.final_script_witness = Some(witness);
            input.tap_script_sigs.clear();
            input.tap_scripts.clear();
            input.tap_internal_key = None;
            input.tap_merkle_root = None;
        }

        let (input_value, output_value) = (self.input_value(), self.output_value());
        let fee = input_value
            .checked_sub(output_value)
            .ok_or(CustodyError::InsufficientFunds {
                needed: output_value.to_sat(),
                available: input_value.to_sat(),
            })?;

        let tx = self.psbt.extract_tx()?;
        let txid = tx.compute_txid();
        let vsize = tx.vsize();
        info!(%txid, vsize, fee = fee.to_sat(), "transaction finalized");

        Ok(FinalizedTransaction {
            raw_hex: serialize_hex(&tx),
            txid,
            vsize,
            fee,
            tx,
            state: TxState::Finalized,
        })
    }
}

#[derive(Debug, Clone)]
pub struct FinalizedTransaction {
    pub tx: Transaction,
    pub txid: Txid,
    pub raw_hex: String,
    pub vsize: usize,
    pub fee: Amount,
    state: TxState,
}

impl FinalizedTransaction {
    pub fn state(&self) -> &TxState {
        &self.state
    }

    /// Submit the raw transaction and return the id the network acknowledged.
    ///
    /// A differing id is logged as a consistency failure; the network's id
    /// is still returned.
    pub async fn broadcast(&mut self, chain: &dyn ChainSource) -> Result<String> {
        if self.state != TxState::Finalized {
            return Err(CustodyError::InvalidState {
                expected: "finalized",
                actual: self.state.to_string(),
            });
        }

        let acknowledged = match chain.broadcast(&self.raw_hex).await {
            Ok(id) => id,
            Err(e) => {
                self.state = TxState::Failed;
                error!(txid = %self.txid, error = %e, "broadcast failed");
                return Err(e);
            }
        };

        if acknowledged != self.txid.to_string() {
            let mismatch = CustodyError::TxidMismatch {
                local: self.txid,
                network: acknowledged.clone(),
            };
            error!("{}", mismatch);
        } else {
            info!(txid = %self.txid, "broadcast");
        }

        self.state = TxState::Broadcast;
        Ok(acknowledged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::ActionTag;
    use crate::address::AddressDeriver;
    use crate::keyring::SignerPair;
    use crate::test_utils::test_keys;
    use crate::tree::{assemble_tree, TreeVariant};
    use bitcoin::secp256k1::schnorr;
    use bitcoin::Network;
    use std::str::FromStr;

    fn funded(amount: u64) -> (CustodianKeySet, PendingTransaction, ScriptBuf) {
        let keys = test_keys();
        let tree = assemble_tree(&keys, TreeVariant::Base).unwrap();
        let custody = AddressDeriver::new(Network::Testnet)
            .derive(keys.master_x_only(), &tree)
            .unwrap();
        let leaf = custody
            .quorum_leaf(&ActionTag::Borrow, SignerPair::ACTIVE)
            .unwrap();
        let utxo = Utxo {
            txid: Txid::from_str(&"ab".repeat(32)).unwrap(),
            vout: 1,
            value: Amount::from_sat(amount),
            script_pubkey: custody.script_pubkey(),
            confirmed: true,
        };

        let mut pending = PendingTransaction::new().unwrap();
        pending.add_input(&utxo, &leaf).unwrap();
        (keys, pending, custody.script_pubkey())
    }

    #[test]
    fn test_sign_in_order_and_finalize() {
        let (keys, mut pending, recipient) = funded(10_000);
        pending.add_output(recipient, Amount::from_sat(9_000)).unwrap();

        pending.sign(&keys, Custodian::K0).unwrap();
        assert_eq!(pending.state(), &TxState::Signed(vec![Custodian::K0]));
        pending.sign(&keys, Custodian::K1).unwrap();

        let finalized = pending.finalize(&keys).unwrap();
        assert_eq!(finalized.fee, Amount::from_sat(1_000));
        assert_eq!(finalized.state(), &TxState::Finalized);

        let witness = &finalized.tx.input[0].witness;
        assert_eq!(witness.len(), 4);
        // first key's signature sits on top of the stack
        let top = schnorr::Signature::from_slice(&witness.to_vec()[1]).unwrap();
        let secp = Secp256k1::verification_only();
        let prevouts = [TxOut {
            value: Amount::from_sat(10_000),
            script_pubkey: finalized.tx.output[0].script_pubkey.clone(),
        }];
        let leaf_script = ScriptBuf::from_bytes(witness.to_vec()[2].clone());
        let leaf_hash = taproot::TapLeafHash::from_script(&leaf_script, LeafVersion::TapScript);
        let sighash = SighashCache::new(&finalized.tx)
            .taproot_script_spend_signature_hash(
                0,
                &Prevouts::All(&prevouts),
                leaf_hash,
                TapSighashType::Default,
            )
            .unwrap();
        let msg = Message::from_digest(sighash.to_byte_array());
        secp.verify_schnorr(&top, &msg, &keys.x_only(Custodian::K0))
            .unwrap();
    }

    #[test]
    fn test_second_signer_cannot_go_first() {
        let (keys, mut pending, recipient) = funded(10_000);
        pending.add_output(recipient, Amount::from_sat(9_000)).unwrap();

        let err = pending.sign(&keys, Custodian::K1).unwrap_err();
        assert!(matches!(
            err,
            CustodyError::SigningOrder {
                expected: Custodian::K0,
                got: Custodian::K1,
                ..
            }
        ));
        assert_eq!(pending.state(), &TxState::Failed);
    }

    #[test]
    fn test_outsider_cannot_sign() {
        let (keys, mut pending, recipient) = funded(10_000);
        pending.add_output(recipient, Amount::from_sat(9_000)).unwrap();
        assert!(pending.sign(&keys, Custodian::K2).is_err());
    }

    #[test]
    fn test_no_outputs_after_signing() {
        let (keys, mut pending, recipient) = funded(10_000);
        pending
            .add_output(recipient.clone(), Amount::from_sat(9_000))
            .unwrap();
        pending.sign(&keys, Custodian::K0).unwrap();
        assert!(pending.add_output(recipient, Amount::from_sat(1)).is_err());
    }

    #[test]
    fn test_finalize_requires_both_signatures() {
        let (keys, mut pending, recipient) = funded(10_000);
        pending.add_output(recipient, Amount::from_sat(9_000)).unwrap();
        pending.sign(&keys, Custodian::K0).unwrap();
        assert!(matches!(
            pending.finalize(&keys),
            Err(CustodyError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_empty_psbt_starts_building() {
        let pending = PendingTransaction::new().unwrap();
        assert_eq!(pending.state(), &TxState::Building);
        assert_eq!(pending.input_value(), Amount::ZERO);

        let psbt = pending.into_psbt();
        assert_eq!(psbt.version, 0);
        assert!(psbt.inputs.is_empty() && psbt.outputs.is_empty());
        assert_eq!(psbt.unsigned_tx.version, transaction::Version::TWO);
    }

    #[test]
    fn test_overspend_rejected() {
        let (keys, mut pending, recipient) = funded(1_000);
        pending.add_output(recipient, Amount::from_sat(2_000)).unwrap();
        pending
            .sign_all(&keys, &SignerPair::ACTIVE.signing_order())
            .unwrap();
        assert!(matches!(
            pending.finalize(&keys),
            Err(CustodyError::InsufficientFunds { .. })
        ));
    }
}
