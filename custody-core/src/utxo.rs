use bitcoin::{Amount, OutPoint, ScriptBuf, Txid};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{CustodyError, Result};

/// Outputs below this are never spent as BTC collateral.
pub const DEFAULT_DUST_FLOOR: Amount = Amount::from_sat(1000);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utxo {
    pub txid: Txid,
    pub vout: u32,
    pub value: Amount,
    pub script_pubkey: ScriptBuf,
    pub confirmed: bool,
}

impl Utxo {
    pub fn outpoint(&self) -> OutPoint {
        OutPoint::new(self.txid, self.vout)
    }
}

/// Order in which candidates are accumulated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectionOrder {
    /// As listed by the chain indexer
    #[default]
    Upstream,
    /// Smallest value first, ties by outpoint
    Ascending,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub selected: Vec<Utxo>,
    pub total: Amount,
}

fn spendable(utxos: &[Utxo], dust_floor: Amount, order: SelectionOrder) -> Vec<Utxo> {
    let mut candidates: Vec<Utxo> = utxos
        .iter()
        .filter(|utxo| {
            if utxo.value < dust_floor {
                warn!(
                    outpoint = %utxo.outpoint(),
                    value = utxo.value.to_sat(),
                    "skipping output below dust floor"
                );
                false
            } else {
                true
            }
        })
        .cloned()
        .collect();

    if order == SelectionOrder::Ascending {
        candidates.sort_by(|a, b| {
            a.value
                .cmp(&b.value)
                .then_with(|| a.outpoint().cmp(&b.outpoint()))
        });
    }
    candidates
}

/// Accumulate outputs at or above `dust_floor` until `target` is covered.
pub fn select_utxos(
    utxos: &[Utxo],
    target: Amount,
    dust_floor: Amount,
    order: SelectionOrder,
) -> Result<Selection> {
    let mut selected = Vec::new();
    let mut total = Amount::ZERO;

    for utxo in spendable(utxos, dust_floor, order) {
        if total >= target {
            break;
        }
        debug!(outpoint = %utxo.outpoint(), value = utxo.value.to_sat(), "selected");
        total += utxo.value;
        selected.push(utxo);
    }

    if total < target {
        return Err(CustodyError::InsufficientFunds {
            needed: target.to_sat(),
            available: total.to_sat(),
        });
    }

    Ok(Selection { selected, total })
}

/// Every output at or above `dust_floor`.
pub fn sweep_utxos(utxos: &[Utxo], dust_floor: Amount, order: SelectionOrder) -> Result<Selection> {
    let selected = spendable(utxos, dust_floor, order);
    if selected.is_empty() {
        return Err(CustodyError::InsufficientFunds {
            needed: dust_floor.to_sat(),
            available: 0,
        });
    }
    let total = selected.iter().map(|u| u.value).sum();
    Ok(Selection { selected, total })
}
