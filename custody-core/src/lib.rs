//! Taproot quorum custody for the Quas lending protocol.
//!
//! Three custodian keys derived from one seed guard every custody address
//! through a fixed script tree of 2-of-2 leaves, one per custodian pair and
//! protocol action. This crate derives those addresses and assembles,
//! signs, sizes and broadcasts the transactions that spend them.

pub mod action;
pub mod address;
pub mod assembler;
pub mod chain;
pub mod error;
pub mod fee;
pub mod keyring;
pub mod leaf;
pub mod lending;
pub mod tree;
pub mod utxo;

#[cfg(test)]
mod test_utils;

pub use action::ActionTag;
pub use address::{AddressDeriver, CustodyAddress, LeafSpend};
pub use assembler::{FinalizedTransaction, PendingTransaction, TxState};
pub use chain::{ChainSource, IndexedInput, IndexedOutput, IndexedTx, MempoolClient, TxStatus};
pub use error::{CustodyError, Result};
pub use fee::{estimate_fee, fee_for_vsize, FeeEstimate, FeeRates};
pub use keyring::{Custodian, CustodianKeySet, SignerPair};
pub use lending::{
    Balance, InscriptionQuote, InscriptionRequest, LendingPolicy, LendingProtocol, RevealPsbt,
    SpendReceipt, WithdrawTickReceipt,
};
pub use tree::{assemble_deposit_tree, assemble_tree, ScriptTree, TreeVariant};
pub use utxo::{select_utxos, SelectionOrder, Utxo};
