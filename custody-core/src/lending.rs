//! Lending flows: custody addresses, borrow, repay, withdraw, and the
//! two-call BRC-20 inscribe/reveal flows.
//!
//! Every server-signed spend goes through the `(0,1)` leaf of its action.
//! Nothing is persisted; multi-call flows are resumed from the funding txid.

use std::str::FromStr;
use std::sync::Arc;

use bitcoin::key::XOnlyPublicKey;
use bitcoin::psbt::Psbt;
use bitcoin::{Address, Amount, Network, ScriptBuf, SignedAmount, Txid};
use serde::Deserialize;
use tracing::{debug, error, info, warn};

use crate::action::ActionTag;
use crate::address::{AddressDeriver, CustodyAddress, LeafSpend};
use crate::assembler::{FinalizedTransaction, PendingTransaction, DUST_LIMIT};
use crate::chain::{ChainSource, IndexedTx};
use crate::error::{add_amounts, CustodyError, Result};
use crate::fee::{estimate_fee, fee_for_vsize};
use crate::keyring::{CustodianKeySet, SignerPair};
use crate::leaf::{action_payload, parse_leaf_key};
use crate::tree::{assemble_deposit_tree, assemble_tree, ScriptTree, TreeVariant};
use crate::utxo::{select_utxos, sweep_utxos, SelectionOrder, Utxo, DEFAULT_DUST_FLOOR};

/// Sats locked with every inscription.
pub const DEFAULT_POSTAGE: Amount = Amount::from_sat(600);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct LendingPolicy {
    #[serde(default = "default_dust_floor")]
    pub dust_floor: u64,
    #[serde(default = "default_postage")]
    pub postage: u64,
    #[serde(default)]
    pub selection_order: SelectionOrder,
    #[serde(default)]
    pub require_confirmed_funding: bool,
}

fn default_dust_floor() -> u64 {
    DEFAULT_DUST_FLOOR.to_sat()
}

fn default_postage() -> u64 {
    DEFAULT_POSTAGE.to_sat()
}

impl Default for LendingPolicy {
    fn default() -> Self {
        Self {
            dust_floor: default_dust_floor(),
            postage: default_postage(),
            selection_order: SelectionOrder::default(),
            require_confirmed_funding: false,
        }
    }
}

impl LendingPolicy {
    pub fn dust_floor(&self) -> Amount {
        Amount::from_sat(self.dust_floor)
    }

    pub fn postage(&self) -> Amount {
        Amount::from_sat(self.postage)
    }

    pub fn validate(&self) -> Result<()> {
        if self.postage >= self.dust_floor {
            return Err(CustodyError::validation(format!(
                "postage ({} sat) must be below the dust floor ({} sat)",
                self.postage, self.dust_floor
            )));
        }
        if self.postage < DUST_LIMIT.to_sat() {
            return Err(CustodyError::validation(format!(
                "postage ({} sat) is below the dust limit ({} sat)",
                self.postage,
                DUST_LIMIT.to_sat()
            )));
        }
        Ok(())
    }
}

/// A broadcast server-signed spend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpendReceipt {
    pub txid: String,
    pub sent: Amount,
    pub fee: Amount,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InscriptionQuote {
    pub address: Address,
    pub data: String,
    pub reveal_fee: Amount,
    pub transfer_fee: Option<Amount>,
    pub fund_amount: Amount,
}

/// Unsigned reveal for the depositor's wallet.
#[derive(Debug, Clone)]
pub struct RevealPsbt {
    pub psbt: Psbt,
    pub input_value: Amount,
    pub output_value: Amount,
    pub reveal_fee: Amount,
}

impl RevealPsbt {
    pub fn psbt_hex(&self) -> String {
        self.psbt.serialize_hex()
    }

    pub fn psbt_base64(&self) -> String {
        use base64::prelude::*;
        BASE64_STANDARD.encode(self.psbt.serialize())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WithdrawTickReceipt {
    pub reveal_txid: String,
    pub transfer_txid: String,
}

/// Collateral a wallet holds in the protocol pool. Either side can be
/// negative while a withdrawal is unconfirmed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Balance {
    pub confirmed: SignedAmount,
    pub unconfirmed: SignedAmount,
}

impl Balance {
    pub fn total(&self) -> SignedAmount {
        self.confirmed
            .checked_add(self.unconfirmed)
            .unwrap_or(SignedAmount::MAX)
    }
}

/// Arguments of a BRC-20 inscription request.
#[derive(Debug, Clone)]
pub struct InscriptionRequest<'a> {
    pub tag: ActionTag,
    pub user_pubkey: &'a str,
    pub address: &'a str,
}

pub struct LendingProtocol {
    keys: Arc<CustodianKeySet>,
    deriver: AddressDeriver,
    chain: Arc<dyn ChainSource>,
    policy: LendingPolicy,
    base_tree: ScriptTree,
    brc20_tree: ScriptTree,
    deposit_tree: ScriptTree,
}

impl LendingProtocol {
    pub fn new(
        keys: Arc<CustodianKeySet>,
        network: Network,
        chain: Arc<dyn ChainSource>,
        policy: LendingPolicy,
    ) -> Result<Self> {
        policy.validate()?;
        let deriver = AddressDeriver::for_deployment(network)?;
        let base_tree = assemble_tree(&keys, TreeVariant::Base)?;
        let brc20_tree = assemble_tree(&keys, TreeVariant::Brc20)?;
        let deposit_tree = assemble_deposit_tree(&keys);
        Ok(Self {
            keys,
            deriver,
            chain,
            policy,
            base_tree,
            brc20_tree,
            deposit_tree,
        })
    }

    pub fn keys(&self) -> &CustodianKeySet {
        &self.keys
    }

    pub fn network(&self) -> Network {
        self.deriver.network()
    }

    pub fn policy(&self) -> &LendingPolicy {
        &self.policy
    }

    /// Pooled BTC collateral; internal key is the master key.
    pub fn protocol_address(&self) -> Result<CustodyAddress> {
        self.deriver.derive(self.keys.master_x_only(), &self.base_tree)
    }

    /// Per-user BTC collateral, on the untagged deposit tree.
    pub fn deposit_address(&self, user_pubkey: &str) -> Result<CustodyAddress> {
        let internal = self.keys.user_internal_key(user_pubkey)?;
        self.deriver.derive(internal, &self.deposit_tree)
    }

    /// Per-user BRC-20 collateral, on the canonical tree.
    pub fn deposit_brc20_address(&self, user_pubkey: &str) -> Result<CustodyAddress> {
        let internal = self.keys.user_internal_key(user_pubkey)?;
        self.deriver.derive(internal, &self.brc20_tree)
    }

    /// Collateral `address` holds in the protocol pool: what it paid in,
    /// less pool spends through a `withdraw` leaf that paid it back.
    pub async fn collateral_balance(&self, address: &str) -> Result<Balance> {
        let user = self.deriver.parse_address(address)?.to_string();
        let protocol = self.protocol_address()?;
        let pool = protocol.address().to_string();
        let withdraw = ActionTag::Withdraw.payload()?;

        let mempool = self.chain.mempool_txs(protocol.address()).await?;
        let unconfirmed = pool_movements(&mempool, &user, &pool, withdraw.as_bytes());

        let mut confirmed = 0i64;
        let mut last_seen = None;
        loop {
            let page = self.chain.chain_txs(protocol.address(), last_seen).await?;
            let Some(last) = page.last().map(|tx| tx.txid) else {
                break;
            };
            if last_seen == Some(last) {
                warn!(%last, "indexer repeated a history page");
                break;
            }
            let moved = pool_movements(&page, &user, &pool, withdraw.as_bytes());
            confirmed = confirmed.saturating_add(moved);
            debug!(txs = page.len(), %last, "pool history page");
            last_seen = Some(last);
        }

        Ok(Balance {
            confirmed: SignedAmount::from_sat(confirmed),
            unconfirmed: SignedAmount::from_sat(unconfirmed),
        })
    }

    /// Pay `amt` sats from the protocol address to `address`, fee deducted
    /// from the payout.
    pub async fn borrow(&self, address: &str, amt: u64) -> Result<SpendReceipt> {
        let recipient = self.deriver.parse_address(address)?;
        let amount = positive_amount(amt)?;
        let protocol = self.protocol_address()?;
        let leaf = protocol.quorum_leaf(&ActionTag::Borrow, SignerPair::ACTIVE)?;

        let utxos = self.chain.address_utxos(protocol.address()).await?;
        let selection = select_utxos(
            &utxos,
            amount,
            self.policy.dust_floor(),
            self.policy.selection_order,
        )?;
        let change = selection.total - amount;

        let provisional = self.sign_spend(
            &selection.selected,
            &leaf,
            &[(recipient.script_pubkey(), amount)],
            Some((protocol.script_pubkey(), change)),
        )?;
        let rates = self.chain.recommended_fees().await?;
        let fee = fee_for_vsize(provisional.vsize, &rates);
        info!(vsize = provisional.vsize, fee = fee.to_sat(), "borrow sized");

        let payout = amount
            .checked_sub(fee)
            .filter(|payout| *payout >= DUST_LIMIT)
            .ok_or_else(|| {
                CustodyError::validation(format!(
                    "borrow of {} sat does not cover the {} sat network fee",
                    amt,
                    fee.to_sat()
                ))
            })?;

        let mut tx = self.sign_spend(
            &selection.selected,
            &leaf,
            &[(recipient.script_pubkey(), payout)],
            Some((protocol.script_pubkey(), change)),
        )?;
        let txid = tx.broadcast(self.chain.as_ref()).await?;
        info!(%txid, %recipient, payout = payout.to_sat(), "borrow broadcast");

        Ok(SpendReceipt {
            txid,
            sent: payout,
            fee: tx.fee,
        })
    }

    /// Move `amt` sats from the user's custody address back to the protocol
    /// address; the fee comes out of the user's change.
    pub async fn repay(&self, user_pubkey: &str, amt: u64) -> Result<SpendReceipt> {
        let amount = positive_amount(amt)?;
        let custody = self.deposit_address(user_pubkey)?;
        let protocol = self.protocol_address()?;
        let leaf = custody.plain_leaf(SignerPair::ACTIVE)?;

        let utxos = self.chain.address_utxos(custody.address()).await?;
        let rates = self.chain.recommended_fees().await?;

        let mut fee = fee_for_vsize(0, &rates);
        for _ in 0..3 {
            let target = add_amounts(amount, fee)?;
            let selection = select_utxos(
                &utxos,
                target,
                self.policy.dust_floor(),
                self.policy.selection_order,
            )?;
            let change = selection.total - target;
            let mut tx = self.sign_spend(
                &selection.selected,
                &leaf,
                &[(protocol.script_pubkey(), amount)],
                Some((custody.script_pubkey(), change)),
            )?;

            let needed = fee_for_vsize(tx.vsize, &rates);
            if tx.fee >= needed {
                let txid = tx.broadcast(self.chain.as_ref()).await?;
                info!(%txid, amount = amt, fee = tx.fee.to_sat(), "repay broadcast");
                return Ok(SpendReceipt {
                    txid,
                    sent: amount,
                    fee: tx.fee,
                });
            }
            fee = needed;
        }

        Err(CustodyError::InsufficientFunds {
            needed: add_amounts(amount, fee)?.to_sat(),
            available: sweep_utxos(&utxos, self.policy.dust_floor(), self.policy.selection_order)
                .map(|s| s.total.to_sat())
                .unwrap_or(0),
        })
    }

    /// Sweep every BTC output of the user's deposit address to `address`.
    ///
    /// Inscriptions live on the BRC-20 address and are never swept here.
    pub async fn withdraw(&self, user_pubkey: &str, address: &str) -> Result<SpendReceipt> {
        let recipient = self.deriver.parse_address(address)?;
        let custody = self.deposit_address(user_pubkey)?;
        let leaf = custody.plain_leaf(SignerPair::ACTIVE)?;

        let utxos = self.chain.address_utxos(custody.address()).await?;
        let sweep = sweep_utxos(&utxos, self.policy.dust_floor(), self.policy.selection_order)?;

        let provisional = self.sign_spend(
            &sweep.selected,
            &leaf,
            &[(recipient.script_pubkey(), sweep.total)],
            None,
        )?;
        let rates = self.chain.recommended_fees().await?;
        let fee = fee_for_vsize(provisional.vsize, &rates);

        let payout = sweep
            .total
            .checked_sub(fee)
            .filter(|payout| *payout >= DUST_LIMIT)
            .ok_or(CustodyError::InsufficientFunds {
                needed: fee.to_sat().saturating_add(DUST_LIMIT.to_sat()),
                available: sweep.total.to_sat(),
            })?;

        let mut tx = self.sign_spend(
            &sweep.selected,
            &leaf,
            &[(recipient.script_pubkey(), payout)],
            None,
        )?;
        let txid = tx.broadcast(self.chain.as_ref()).await?;
        info!(%txid, inputs = sweep.selected.len(), payout = payout.to_sat(), "withdraw broadcast");

        Ok(SpendReceipt {
            txid,
            sent: payout,
            fee: tx.fee,
        })
    }

    /// First call of `/brc20-op` and `/brc20-deploy`.
    pub async fn prepare_inscription(&self, req: &InscriptionRequest<'_>) -> Result<InscriptionQuote> {
        let recipient = self.deriver.parse_address(req.address)?;
        let inscription = self.user_inscription_address(req)?;
        let leaf = inscription.sole_leaf()?;

        let rates = self.chain.recommended_fees().await?;
        let reveal_fee = estimate_fee(&leaf, &recipient.script_pubkey(), &rates)?.fee;
        let fund_amount = add_amounts(self.policy.postage(), reveal_fee)?;
        info!(tag = %req.tag, address = %inscription.address(), fund = fund_amount.to_sat(), "inscription prepared");

        Ok(InscriptionQuote {
            address: inscription.address().clone(),
            data: req.tag.payload()?,
            reveal_fee,
            transfer_fee: None,
            fund_amount,
        })
    }

    /// Second call: an unsigned reveal spending the funding output.
    pub async fn reveal_inscription(
        &self,
        req: &InscriptionRequest<'_>,
        funding_txid: &str,
    ) -> Result<RevealPsbt> {
        let recipient = self.deriver.parse_address(req.address)?;
        let funding_txid = parse_txid(funding_txid)?;
        let inscription = self.user_inscription_address(req)?;
        let leaf = inscription.sole_leaf()?;

        let funding = self.find_funding(&inscription, funding_txid).await?;
        let rates = self.chain.recommended_fees().await?;
        let reveal_fee = estimate_fee(&leaf, &recipient.script_pubkey(), &rates)?.fee;
        let output_value = reveal_output(funding.value, reveal_fee)?;

        let mut pending = PendingTransaction::new()?;
        pending.add_input(&funding, &leaf)?;
        pending.add_output(recipient.script_pubkey(), output_value)?;
        info!(funding = %funding.outpoint(), output = output_value.to_sat(), "reveal psbt built");

        Ok(RevealPsbt {
            psbt: pending.into_psbt(),
            input_value: funding.value,
            output_value,
            reveal_fee,
        })
    }

    /// First call of `/withdraw-tick`.
    pub async fn prepare_withdraw_tick(
        &self,
        user_pubkey: &str,
        address: &str,
        tag: ActionTag,
        transfer_fee: Option<u64>,
    ) -> Result<InscriptionQuote> {
        let recipient = self.deriver.parse_address(address)?;
        let inscription = self.quorum_inscription_address(user_pubkey, &tag)?;
        let custody = self.deposit_brc20_address(user_pubkey)?;

        let rates = self.chain.recommended_fees().await?;
        let reveal_fee = estimate_fee(&inscription.sole_leaf()?, &custody.script_pubkey(), &rates)?.fee;
        let transfer_fee = match transfer_fee {
            Some(sats) => sats_amount("transferFee", sats)?,
            None => {
                let leaf = custody.quorum_leaf(&ActionTag::Withdraw, SignerPair::ACTIVE)?;
                estimate_fee(&leaf, &recipient.script_pubkey(), &rates)?.fee
            }
        };
        let fund_amount =
            add_amounts(add_amounts(self.policy.postage(), reveal_fee)?, transfer_fee)?;
        info!(tag = %tag, address = %inscription.address(), fund = fund_amount.to_sat(), "withdraw-tick prepared");

        Ok(InscriptionQuote {
            address: inscription.address().clone(),
            data: tag.payload()?,
            reveal_fee,
            transfer_fee: Some(transfer_fee),
            fund_amount,
        })
    }

    /// Second call: reveal the transfer inscription into the user's BRC-20
    /// address, then move it out to `address` through the withdraw leaf.
    ///
    /// If the funding output is already spent by an earlier reveal, only the
    /// transfer is (re)tried.
    pub async fn execute_withdraw_tick(
        &self,
        user_pubkey: &str,
        address: &str,
        tag: ActionTag,
        funding_txid: &str,
        transfer_fee: Option<u64>,
    ) -> Result<WithdrawTickReceipt> {
        let recipient = self.deriver.parse_address(address)?;
        let funding_txid = parse_txid(funding_txid)?;
        let inscription = self.quorum_inscription_address(user_pubkey, &tag)?;
        let custody = self.deposit_brc20_address(user_pubkey)?;
        let reveal_leaf = inscription.sole_leaf()?;
        let withdraw_leaf = custody.quorum_leaf(&ActionTag::Withdraw, SignerPair::ACTIVE)?;

        let funding = self.lookup_funding(&inscription, funding_txid).await?;
        let rates = self.chain.recommended_fees().await?;
        let transfer_fee = match transfer_fee {
            Some(sats) => sats_amount("transferFee", sats)?,
            None => estimate_fee(&withdraw_leaf, &recipient.script_pubkey(), &rates)?.fee,
        };

        let Some(funding) = funding else {
            let revealed = self
                .find_revealed(&inscription, &custody, funding_txid)
                .await?;
            info!(reveal = %revealed.outpoint(), tag = %tag, "resuming withdraw-tick at transfer");
            let reveal_txid = revealed.txid.to_string();
            let mut transfer = self.sign_transfer(revealed, &withdraw_leaf, &recipient, transfer_fee)?;
            let transfer_txid = transfer
                .broadcast(self.chain.as_ref())
                .await
                .map_err(|e| transfer_failed(&reveal_txid, e))?;
            return Ok(WithdrawTickReceipt {
                reveal_txid,
                transfer_txid,
            });
        };

        let reveal_fee = estimate_fee(&reveal_leaf, &custody.script_pubkey(), &rates)?.fee;
        let revealed_value = reveal_output(funding.value, reveal_fee)?;
        let mut reveal = self.sign_spend(
            &[funding],
            &reveal_leaf,
            &[(custody.script_pubkey(), revealed_value)],
            None,
        )?;
        let revealed = Utxo {
            txid: reveal.txid,
            vout: 0,
            value: revealed_value,
            script_pubkey: custody.script_pubkey(),
            confirmed: false,
        };
        let mut transfer = self.sign_transfer(revealed, &withdraw_leaf, &recipient, transfer_fee)?;

        let reveal_txid = reveal.broadcast(self.chain.as_ref()).await?;
        let transfer_txid = transfer
            .broadcast(self.chain.as_ref())
            .await
            .map_err(|e| transfer_failed(&reveal_txid, e))?;
        info!(%reveal_txid, %transfer_txid, tag = %tag, "withdraw-tick broadcast");

        Ok(WithdrawTickReceipt {
            reveal_txid,
            transfer_txid,
        })
    }

    /// Spend a revealed transfer inscription to `recipient`.
    fn sign_transfer(
        &self,
        revealed: Utxo,
        withdraw_leaf: &LeafSpend,
        recipient: &Address,
        transfer_fee: Amount,
    ) -> Result<FinalizedTransaction> {
        let transfer_value = revealed
            .value
            .checked_sub(transfer_fee)
            .filter(|v| *v >= DUST_LIMIT)
            .ok_or(CustodyError::InsufficientFunds {
                needed: transfer_fee.to_sat().saturating_add(DUST_LIMIT.to_sat()),
                available: revealed.value.to_sat(),
            })?;
        self.sign_spend(
            &[revealed],
            withdraw_leaf,
            &[(recipient.script_pubkey(), transfer_value)],
            None,
        )
    }

    fn user_inscription_address(&self, req: &InscriptionRequest<'_>) -> Result<CustodyAddress> {
        let user_key = parse_user_key(req.user_pubkey)?;
        let tree = ScriptTree::single_user(user_key, req.tag.clone())?;
        self.deriver.derive(user_key, &tree)
    }

    fn quorum_inscription_address(&self, user_pubkey: &str, tag: &ActionTag) -> Result<CustodyAddress> {
        let internal = self.keys.user_internal_key(user_pubkey)?;
        let tree = ScriptTree::single_quorum(&self.keys, SignerPair::ACTIVE, tag.clone())?;
        self.deriver.derive(internal, &tree)
    }

    /// Largest unspent output of `txid` at `address`, if any is left.
    async fn lookup_funding(&self, address: &CustodyAddress, txid: Txid) -> Result<Option<Utxo>> {
        if self.policy.require_confirmed_funding {
            let status = self.chain.tx_status(&txid).await?;
            if !status.confirmed {
                return Err(CustodyError::Unconfirmed(txid));
            }
        }

        let utxos = self.chain.address_utxos(address.address()).await?;
        Ok(utxos
            .into_iter()
            .filter(|u| u.txid == txid)
            .max_by_key(|u| u.value))
    }

    async fn find_funding(&self, address: &CustodyAddress, txid: Txid) -> Result<Utxo> {
        self.lookup_funding(address, txid)
            .await?
            .ok_or_else(|| no_output(txid, address))
    }

    /// Unspent output at `custody` created by the reveal that spent
    /// `funding_txid` from `inscription`.
    async fn find_revealed(
        &self,
        inscription: &CustodyAddress,
        custody: &CustodyAddress,
        funding_txid: Txid,
    ) -> Result<Utxo> {
        let utxos = self.chain.address_utxos(custody.address()).await?;
        if utxos.is_empty() {
            return Err(no_output(funding_txid, inscription));
        }

        let source = inscription.address().to_string();
        let target = custody.address().to_string();
        let spends_funding = |tx: &IndexedTx| {
            tx.vin
                .iter()
                .any(|vin| vin.txid == funding_txid && vin.spends_from(&source))
        };

        let mut reveal = self
            .chain
            .mempool_txs(custody.address())
            .await?
            .into_iter()
            .find(spends_funding);
        let mut last_seen = None;
        while reveal.is_none() {
            let page = self.chain.chain_txs(custody.address(), last_seen).await?;
            let Some(last) = page.last().map(|tx| tx.txid) else {
                break;
            };
            if last_seen == Some(last) {
                break;
            }
            reveal = page.into_iter().find(spends_funding);
            last_seen = Some(last);
        }

        let Some(reveal) = reveal else {
            return Err(no_output(funding_txid, inscription));
        };
        let vout = reveal.vout.iter().position(|o| o.pays(&target));
        utxos
            .into_iter()
            .find(|u| u.txid == reveal.txid && Some(u.vout as usize) == vout)
            .ok_or_else(|| {
                CustodyError::validation(format!(
                    "inscription revealed in {} has already left {}",
                    reveal.txid,
                    custody.address()
                ))
            })
    }

    /// Build and fully sign a spend through `leaf` with the active pair.
    /// Change below the dust limit is left to the fee.
    fn sign_spend(
        &self,
        inputs: &[Utxo],
        leaf: &LeafSpend,
        outputs: &[(ScriptBuf, Amount)],
        change: Option<(ScriptBuf, Amount)>,
    ) -> Result<FinalizedTransaction> {
        let mut pending = PendingTransaction::new()?;
        for utxo in inputs {
            pending.add_input(utxo, leaf)?;
        }
        for (script_pubkey, value) in outputs {
            pending.add_output(script_pubkey.clone(), *value)?;
        }
        if let Some((script_pubkey, value)) = change {
            if value >= DUST_LIMIT {
                pending.add_output(script_pubkey, value)?;
            } else if value > Amount::ZERO {
                warn!(change = value.to_sat(), "dropping dust change");
            }
        }

        pending.sign_all(&self.keys, &SignerPair::ACTIVE.signing_order())?;
        pending.finalize(&self.keys)
    }
}

fn positive_amount(amt: u64) -> Result<Amount> {
    if amt == 0 {
        return Err(CustodyError::validation("amt must be greater than zero"));
    }
    sats_amount("amt", amt)
}

/// Caller supplied sats, capped at the 21M BTC supply.
fn sats_amount(name: &str, sats: u64) -> Result<Amount> {
    let amount = Amount::from_sat(sats);
    if amount > Amount::MAX_MONEY {
        return Err(CustodyError::validation(format!(
            "{} of {} sat exceeds the bitcoin supply",
            name, sats
        )));
    }
    Ok(amount)
}

fn no_output(txid: Txid, address: &CustodyAddress) -> CustodyError {
    CustodyError::validation(format!(
        "no unspent output of {} pays {}",
        txid,
        address.address()
    ))
}

fn transfer_failed(reveal_txid: &str, source: CustodyError) -> CustodyError {
    error!(%reveal_txid, error = %source, "transfer failed after reveal");
    CustodyError::TransferFailed {
        reveal_txid: reveal_txid.to_string(),
        source: Box::new(source),
    }
}

/// Net sats `user` moved into `pool` across `txs`.
///
/// A transaction whose first input comes from `user` is a deposit of what it
/// pays the pool. One whose first output pays `user` and which spends pool
/// outputs through a `withdraw` leaf is a withdrawal of those inputs less any
/// change returned to the pool. Everything else is ignored.
fn pool_movements(txs: &[IndexedTx], user: &str, pool: &str, withdraw_payload: &[u8]) -> i64 {
    let mut value = 0i64;
    for tx in txs {
        let pays_user = tx.vout.first().is_some_and(|o| o.pays(user));
        let withdrawn: i64 = tx
            .vin
            .iter()
            .filter(|vin| vin.spends_from(pool) && spends_leaf_tagged(&vin.witness, withdraw_payload))
            .filter_map(|vin| vin.prevout.as_ref())
            .map(|prevout| sats_i64(prevout.value))
            .fold(0, i64::saturating_add);
        let to_pool: i64 = tx
            .vout
            .iter()
            .filter(|o| o.pays(pool))
            .map(|o| sats_i64(o.value))
            .fold(0, i64::saturating_add);

        if pays_user && withdrawn > 0 {
            value = value.saturating_sub(withdrawn.saturating_sub(to_pool));
        } else if tx.vin.first().is_some_and(|vin| vin.spends_from(user)) {
            value = value.saturating_add(to_pool);
        }
    }
    value
}

/// Script-path witness `[sig, sig, leaf, control block]` whose leaf carries
/// `payload`.
fn spends_leaf_tagged(witness: &[String], payload: &[u8]) -> bool {
    let [_, _, leaf, _] = witness else {
        return false;
    };
    hex::decode(leaf)
        .ok()
        .and_then(|bytes| action_payload(&ScriptBuf::from_bytes(bytes)))
        .is_some_and(|found| found == payload)
}

fn sats_i64(sats: u64) -> i64 {
    i64::try_from(sats).unwrap_or(i64::MAX)
}

fn parse_txid(txid: &str) -> Result<Txid> {
    Txid::from_str(txid.trim())
        .map_err(|e| CustodyError::validation(format!("invalid txid '{}': {}", txid, e)))
}

fn parse_user_key(user_pubkey: &str) -> Result<XOnlyPublicKey> {
    let bytes = hex::decode(user_pubkey.trim())
        .map_err(|e| CustodyError::InvalidPublicKey(format!("not hex: {}", e)))?;
    parse_leaf_key(&bytes)
}

fn reveal_output(input: Amount, reveal_fee: Amount) -> Result<Amount> {
    input
        .checked_sub(reveal_fee)
        .filter(|v| *v >= DUST_LIMIT)
        .ok_or(CustodyError::InsufficientFunds {
            needed: reveal_fee.to_sat().saturating_add(DUST_LIMIT.to_sat()),
            available: input.to_sat(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_validation() {
        assert!(LendingPolicy::default().validate().is_ok());

        let sweeps_postage = LendingPolicy {
            dust_floor: 600,
            ..Default::default()
        };
        assert!(sweeps_postage.validate().is_err());

        let dust_postage = LendingPolicy {
            postage: 300,
            ..Default::default()
        };
        assert!(dust_postage.validate().is_err());
    }

    #[test]
    fn test_reveal_output() {
        assert_eq!(
            reveal_output(Amount::from_sat(1500), Amount::from_sat(500)).unwrap(),
            Amount::from_sat(1000)
        );
        assert!(reveal_output(Amount::from_sat(800), Amount::from_sat(500)).is_err());
    }

    #[test]
    fn test_psbt_encodings_agree() {
        let reveal = RevealPsbt {
            psbt: PendingTransaction::new().unwrap().into_psbt(),
            input_value: Amount::ZERO,
            output_value: Amount::ZERO,
            reveal_fee: Amount::ZERO,
        };
        assert_eq!(reveal.psbt_base64(), reveal.psbt.to_string());
        assert!(reveal.psbt_hex().starts_with("70736274ff"));
    }

    fn spend(prev: &str, value: u64, leaf: Option<&ActionTag>) -> crate::chain::IndexedInput {
        let keys = crate::test_utils::test_keys();
        let witness = match leaf {
            Some(tag) => {
                let script = crate::leaf::build_action_leaf(
                    &keys.x_only(crate::keyring::Custodian::K0),
                    &keys.x_only(crate::keyring::Custodian::K1),
                    tag,
                )
                .unwrap();
                vec!["00".repeat(64), "00".repeat(64), hex::encode(script.as_bytes()), "c0".to_string()]
            }
            None => vec!["00".repeat(64)],
        };
        crate::chain::IndexedInput {
            txid: Txid::from_str(&"11".repeat(32)).unwrap(),
            vout: 0,
            prevout: Some(crate::chain::IndexedOutput {
                scriptpubkey_address: Some(prev.to_string()),
                value,
            }),
            witness,
        }
    }

    fn pay(to: &str, value: u64) -> crate::chain::IndexedOutput {
        crate::chain::IndexedOutput {
            scriptpubkey_address: Some(to.to_string()),
            value,
        }
    }

    fn tx(vin: Vec<crate::chain::IndexedInput>, vout: Vec<crate::chain::IndexedOutput>) -> IndexedTx {
        IndexedTx {
            txid: Txid::from_str(&"22".repeat(32)).unwrap(),
            vin,
            vout,
        }
    }

    #[test]
    fn test_pool_movements() {
        let withdraw = ActionTag::Withdraw.payload().unwrap();
        let txs = vec![
            // deposit with change back to the user
            tx(vec![spend("user", 60_000, None)], vec![pay("pool", 50_000), pay("user", 9_000)]),
            // withdrawal with change back to the pool
            tx(
                vec![spend("pool", 30_000, Some(&ActionTag::Withdraw))],
                vec![pay("user", 20_000), pay("pool", 9_500)],
            ),
            // a borrow paying the user is not a withdrawal
            tx(
                vec![spend("pool", 30_000, Some(&ActionTag::Borrow))],
                vec![pay("user", 20_000), pay("pool", 9_500)],
            ),
            // someone else's deposit
            tx(vec![spend("other", 10_000, None)], vec![pay("pool", 10_000)]),
        ];
        assert_eq!(
            pool_movements(&txs, "user", "pool", withdraw.as_bytes()),
            50_000 - 20_500
        );
        assert_eq!(pool_movements(&[], "user", "pool", withdraw.as_bytes()), 0);
    }

    #[test]
    fn test_balance_total_never_panics() {
        let balance = Balance {
            confirmed: SignedAmount::MAX,
            unconfirmed: SignedAmount::from_sat(1),
        };
        assert_eq!(balance.total(), SignedAmount::MAX);

        let pending_withdrawal = Balance {
            confirmed: SignedAmount::from_sat(5_000),
            unconfirmed: SignedAmount::from_sat(-2_000),
        };
        assert_eq!(pending_withdrawal.total(), SignedAmount::from_sat(3_000));
    }

    #[test]
    fn test_amount_and_txid_parsing() {
        assert!(positive_amount(0).is_err());
        assert_eq!(positive_amount(5).unwrap(), Amount::from_sat(5));
        assert!(matches!(
            positive_amount(u64::MAX),
            Err(CustodyError::Validation(_))
        ));
        assert_eq!(
            sats_amount("transferFee", Amount::MAX_MONEY.to_sat()).unwrap(),
            Amount::MAX_MONEY
        );
        assert!(sats_amount("transferFee", Amount::MAX_MONEY.to_sat() + 1).is_err());
        assert!(parse_txid("zz").is_err());
        assert!(parse_txid(&"ab".repeat(32)).is_ok());
    }
}
