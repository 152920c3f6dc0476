//! Chain indexer and fee oracle access.

use std::str::FromStr;

use async_trait::async_trait;
use bitcoin::{Address, Amount, Txid};
use serde::Deserialize;
use tracing::debug;

use crate::error::{CustodyError, Result};
use crate::fee::FeeRates;
use crate::utxo::Utxo;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct TxStatus {
    pub confirmed: bool,
    #[serde(default)]
    pub block_height: Option<u32>,
}

/// A transaction as listed by the indexer's address history.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct IndexedTx {
    pub txid: Txid,
    pub vin: Vec<IndexedInput>,
    pub vout: Vec<IndexedOutput>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct IndexedInput {
    pub txid: Txid,
    pub vout: u32,
    /// `None` for coinbase inputs
    #[serde(default)]
    pub prevout: Option<IndexedOutput>,
    /// Hex encoded witness items
    #[serde(default)]
    pub witness: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct IndexedOutput {
    #[serde(default)]
    pub scriptpubkey_address: Option<String>,
    pub value: u64,
}

impl IndexedOutput {
    pub fn pays(&self, address: &str) -> bool {
        self.scriptpubkey_address.as_deref() == Some(address)
    }
}

impl IndexedInput {
    pub fn spends_from(&self, address: &str) -> bool {
        self.prevout.as_ref().is_some_and(|p| p.pays(address))
    }
}

/// What the lending flows need from the outside world.
#[async_trait]
pub trait ChainSource: Send + Sync {
    async fn address_utxos(&self, address: &Address) -> Result<Vec<Utxo>>;

    /// Unconfirmed transactions touching `address`.
    async fn mempool_txs(&self, address: &Address) -> Result<Vec<IndexedTx>>;

    /// One page of confirmed transactions touching `address`, newest first,
    /// continuing after `last_seen`. An empty page ends the history.
    async fn chain_txs(&self, address: &Address, last_seen: Option<Txid>) -> Result<Vec<IndexedTx>>;

    async fn tx_status(&self, txid: &Txid) -> Result<TxStatus>;

    async fn recommended_fees(&self) -> Result<FeeRates>;

    /// Submit a raw transaction, returning the txid the node acknowledged.
    async fn broadcast(&self, raw_tx_hex: &str) -> Result<String>;
}

#[derive(Deserialize)]
struct IndexerUtxo {
    txid: String,
    vout: u32,
    value: u64,
    #[serde(default)]
    status: TxStatus,
}

/// Client for a mempool.space compatible REST API.
#[derive(Debug, Clone)]
pub struct MempoolClient {
    base_url: String,
    client: reqwest::Client,
}

impl MempoolClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        debug!(%url, "indexer request");
        let resp = self.client.get(&url).send().await?;
        let resp = check_status(resp).await?;
        Ok(resp.json().await?)
    }
}

async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp
        .text()
        .await
        .unwrap_or_else(|_| "Unknown error".to_string());
    Err(CustodyError::Upstream {
        status: status.as_u16(),
        body,
    })
}

#[async_trait]
impl ChainSource for MempoolClient {
    async fn address_utxos(&self, address: &Address) -> Result<Vec<Utxo>> {
        let listed: Vec<IndexerUtxo> = self
            .get_json(&format!("/address/{}/utxo", address))
            .await?;
        let script_pubkey = address.script_pubkey();

        listed
            .into_iter()
            .map(|u| {
                let txid = Txid::from_str(&u.txid).map_err(|e| CustodyError::Upstream {
                    status: 200,
                    body: format!("indexer returned bad txid '{}': {}", u.txid, e),
                })?;
                Ok(Utxo {
                    txid,
                    vout: u.vout,
                    value: Amount::from_sat(u.value),
                    script_pubkey: script_pubkey.clone(),
                    confirmed: u.status.confirmed,
                })
            })
            .collect()
    }

    async fn mempool_txs(&self, address: &Address) -> Result<Vec<IndexedTx>> {
        self.get_json(&format!("/address/{}/txs/mempool", address))
            .await
    }

    async fn chain_txs(&self, address: &Address, last_seen: Option<Txid>) -> Result<Vec<IndexedTx>> {
        let path = match last_seen {
            Some(txid) => format!("/address/{}/txs/chain/{}", address, txid),
            None => format!("/address/{}/txs/chain", address),
        };
        self.get_json(&path).await
    }

    async fn tx_status(&self, txid: &Txid) -> Result<TxStatus> {
        self.get_json(&format!("/tx/{}/status", txid)).await
    }

    async fn recommended_fees(&self) -> Result<FeeRates> {
        self.get_json("/v1/fees/recommended").await
    }

    async fn broadcast(&self, raw_tx_hex: &str) -> Result<String> {
        let resp = self
            .client
            .post(format!("{}/tx", self.base_url))
            .body(raw_tx_hex.to_string())
            .send()
            .await?;
        let resp = check_status(resp).await?;
        Ok(resp.text().await?.trim().to_string())
    }
}
