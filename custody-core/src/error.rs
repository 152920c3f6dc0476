use bitcoin::{Amount, Network, Txid};
use thiserror::Error;

use crate::keyring::Custodian;

pub type Result<T, E = CustodyError> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum CustodyError {
    /// Missing or malformed caller input
    #[error("{0}")]
    Validation(String),

    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("invalid master seed: {0}")]
    InvalidSeed(String),

    #[error("unsupported network {requested}, expected {expected}")]
    UnsupportedNetwork { requested: Network, expected: String },

    #[error("Insufficient funds: need {needed} sat, only {available} sat spendable")]
    InsufficientFunds { needed: u64, available: u64 },

    #[error("funding transaction {0} is not confirmed yet")]
    Unconfirmed(Txid),

    /// The reveal is on the network but the transfer spending it is not.
    /// Calling again with the same funding txid resumes from the reveal.
    #[error("reveal {reveal_txid} was broadcast but the transfer failed: {source}")]
    TransferFailed {
        reveal_txid: String,
        source: Box<CustodyError>,
    },

    /// Chain indexer or fee oracle answered with a non-success status
    #[error("upstream returned {status}: {body}")]
    Upstream { status: u16, body: String },

    #[error("upstream request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// Locally computed txid differs from the one the network acknowledged
    #[error("tx hash mismatch, ours {local} got {network}")]
    TxidMismatch { local: Txid, network: String },

    #[error("{got} cannot sign input {input} before {expected}")]
    SigningOrder {
        input: usize,
        expected: Custodian,
        got: Custodian,
    },

    #[error("transaction is {actual}, expected {expected}")]
    InvalidState {
        expected: &'static str,
        actual: String,
    },

    #[error("taproot construction failed: {0}")]
    Taproot(String),

    #[error("payload encoding failed: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("script construction failed: {0}")]
    Script(#[from] bitcoin::script::PushBytesError),

    #[error("key derivation failed: {0}")]
    Bip32(#[from] bitcoin::bip32::Error),

    #[error("sighash computation failed: {0}")]
    Sighash(#[from] bitcoin::sighash::TaprootError),

    #[error("PSBT error: {0}")]
    Psbt(#[from] bitcoin::psbt::Error),

    #[error("transaction extraction failed: {0}")]
    Extract(#[from] bitcoin::psbt::ExtractTxError),
}

impl CustodyError {
    /// Whether the caller can fix the request and try again (HTTP 400) as
    /// opposed to a server-side failure (HTTP 500).
    pub fn is_caller_correctable(&self) -> bool {
        match self {
            CustodyError::Validation(_)
            | CustodyError::InvalidPublicKey(_)
            | CustodyError::UnsupportedNetwork { .. }
            | CustodyError::InsufficientFunds { .. }
            | CustodyError::Unconfirmed(_) => true,
            CustodyError::Upstream { status, .. } => (400..500).contains(status),
            CustodyError::TransferFailed { source, .. } => source.is_caller_correctable(),
            _ => false,
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        CustodyError::Validation(msg.into())
    }
}

/// `a + b`, or a validation error instead of the overflow panic.
pub fn add_amounts(a: Amount, b: Amount) -> Result<Amount> {
    a.checked_add(b).ok_or_else(|| {
        CustodyError::validation(format!(
            "{} sat + {} sat overflows",
            a.to_sat(),
            b.to_sat()
        ))
    })
}
