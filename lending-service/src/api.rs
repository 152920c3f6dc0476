use poem_openapi::param::Query;
use poem_openapi::payload::Json;
use poem_openapi::{ApiResponse, Object, OpenApi, Union};
use std::sync::Arc;

use bitcoin::Amount;
use quas_custody::{ActionTag, Custodian, CustodyError, InscriptionRequest, LendingProtocol};

pub struct Api {
    pub lending: Arc<LendingProtocol>,
}

#[derive(Debug, Object)]
pub struct AddressResponse {
    /// Taproot custody address (bech32m)
    pub address: String,
}

#[derive(Debug, Object)]
pub struct TxResponse {
    /// Id of the broadcast transaction
    pub tx: String,
    /// Sats delivered to the recipient
    pub sent: u64,
    /// Network fee paid, in sats
    pub fee: u64,
}

/// First call of a two-step inscription flow: fund `address` with
/// `fundAmount` sats, then call again with the funding txid.
#[derive(Debug, Object)]
#[oai(rename_all = "camelCase")]
pub struct InscriptionQuoteResponse {
    /// Address to fund
    pub address: String,
    /// Inscribed JSON payload
    pub data: String,
    pub reveal_fee: u64,
    #[oai(skip_serializing_if_is_none)]
    pub transfer_fee: Option<u64>,
    pub fund_amount: u64,
}

#[derive(Debug, Object)]
#[oai(rename_all = "camelCase")]
pub struct RevealPsbtResponse {
    /// Unsigned reveal PSBT (hex) for the wallet to sign
    pub psbt: String,
    pub psbt_base64: String,
    pub input_value: u64,
    pub output_value: u64,
    pub reveal_fee: u64,
}

#[derive(Debug, Object)]
pub struct WithdrawTickTxsResponse {
    /// `[revealTxId, transferTxId]`
    pub txs: Vec<String>,
}

#[derive(Debug, Union)]
pub enum WithdrawTickBody {
    Quote(InscriptionQuoteResponse),
    Broadcast(WithdrawTickTxsResponse),
}

#[derive(Debug, Union)]
pub enum InscriptionBody {
    Quote(InscriptionQuoteResponse),
    Reveal(RevealPsbtResponse),
}

/// Net sats a wallet holds in the protocol pool; negative while a
/// withdrawal is still unconfirmed.
#[derive(Debug, Object)]
pub struct BalanceResponse {
    pub confirmed: i64,
    pub unconfirmed: i64,
    pub total: i64,
}

#[derive(Debug, Object)]
#[oai(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub network: String,
    /// Pooled collateral address borrowers are paid from
    pub protocol_address: String,
    /// x-only keys of custodians k0, k1, k2
    pub custodians: Vec<String>,
}

#[derive(Debug, Object)]
pub struct ErrorResponse {
    /// Error message
    pub error: String,
}

#[derive(ApiResponse)]
pub enum AddressResult {
    #[oai(status = 200)]
    Ok(Json<AddressResponse>),
    #[oai(status = 400)]
    BadRequest(Json<ErrorResponse>),
    #[oai(status = 500)]
    InternalError(Json<ErrorResponse>),
}

#[derive(ApiResponse)]
pub enum TxResult {
    #[oai(status = 200)]
    Ok(Json<TxResponse>),
    #[oai(status = 400)]
    BadRequest(Json<ErrorResponse>),
    #[oai(status = 500)]
    InternalError(Json<ErrorResponse>),
}

#[derive(ApiResponse)]
pub enum WithdrawTickResult {
    #[oai(status = 200)]
    Ok(Json<WithdrawTickBody>),
    #[oai(status = 400)]
    BadRequest(Json<ErrorResponse>),
    #[oai(status = 500)]
    InternalError(Json<ErrorResponse>),
}

#[derive(ApiResponse)]
pub enum InscriptionResult {
    #[oai(status = 200)]
    Ok(Json<InscriptionBody>),
    #[oai(status = 400)]
    BadRequest(Json<ErrorResponse>),
    #[oai(status = 500)]
    InternalError(Json<ErrorResponse>),
}

#[derive(ApiResponse)]
pub enum BalanceResult {
    #[oai(status = 200)]
    Ok(Json<BalanceResponse>),
    #[oai(status = 400)]
    BadRequest(Json<ErrorResponse>),
    #[oai(status = 500)]
    InternalError(Json<ErrorResponse>),
}

#[derive(ApiResponse)]
pub enum HealthResult {
    #[oai(status = 200)]
    Ok(Json<HealthResponse>),
    #[oai(status = 500)]
    InternalError(Json<ErrorResponse>),
}

/// Caller-correctable errors become 400 with their message; everything else
/// is logged and answered with a generic 500.
macro_rules! impl_from_custody_error {
    ($($result:ident),+) => {
        $(
            impl From<CustodyError> for $result {
                fn from(e: CustodyError) -> Self {
                    if e.is_caller_correctable() {
                        tracing::warn!("Rejected request: {}", e);
                        $result::BadRequest(Json(ErrorResponse {
                            error: e.to_string(),
                        }))
                    } else {
                        tracing::error!("Request failed: {}", e);
                        $result::InternalError(Json(ErrorResponse {
                            error: "unknown error".to_string(),
                        }))
                    }
                }
            }
        )+
    };
}

impl_from_custody_error!(
    AddressResult,
    TxResult,
    WithdrawTickResult,
    InscriptionResult,
    BalanceResult
);

fn required(name: &str, value: Option<String>) -> Result<String, CustodyError> {
    value
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| CustodyError::validation(format!("missing {}", name)))
}

fn parse_sats(name: &str, value: Option<String>) -> Result<u64, CustodyError> {
    let raw = required(name, value)?;
    let sats = raw
        .trim()
        .parse::<u64>()
        .map_err(|_| CustodyError::validation(format!("{} must be an integer number of sats", name)))?;
    if sats > Amount::MAX_MONEY.to_sat() {
        return Err(CustodyError::validation(format!(
            "{} exceeds {} sats",
            name,
            Amount::MAX_MONEY.to_sat()
        )));
    }
    Ok(sats)
}

fn optional_sats(name: &str, value: Option<String>) -> Result<Option<u64>, CustodyError> {
    match value.filter(|v| !v.trim().is_empty()) {
        Some(v) => parse_sats(name, Some(v)).map(Some),
        None => Ok(None),
    }
}

fn quote_response(quote: quas_custody::InscriptionQuote) -> InscriptionQuoteResponse {
    InscriptionQuoteResponse {
        address: quote.address.to_string(),
        data: quote.data,
        reveal_fee: quote.reveal_fee.to_sat(),
        transfer_fee: quote.transfer_fee.map(|f| f.to_sat()),
        fund_amount: quote.fund_amount.to_sat(),
    }
}

struct WithdrawTickArgs {
    pubkey: Option<String>,
    address: Option<String>,
    tick: Option<String>,
    amt: Option<String>,
    txid: Option<String>,
    transfer_fee: Option<String>,
}

impl Api {
    async fn inscription(
        &self,
        tag: Result<ActionTag, CustodyError>,
        pubkey: Option<String>,
        address: Option<String>,
        txid: Option<String>,
    ) -> Result<InscriptionBody, CustodyError> {
        let tag = tag?;
        let pubkey = required("pub", pubkey)?;
        let address = required("address", address)?;
        let req = InscriptionRequest {
            tag,
            user_pubkey: &pubkey,
            address: &address,
        };

        match txid.filter(|t| !t.trim().is_empty()) {
            None => Ok(InscriptionBody::Quote(quote_response(
                self.lending.prepare_inscription(&req).await?,
            ))),
            Some(txid) => {
                let reveal = self.lending.reveal_inscription(&req, &txid).await?;
                Ok(InscriptionBody::Reveal(RevealPsbtResponse {
                    psbt: reveal.psbt_hex(),
                    psbt_base64: reveal.psbt_base64(),
                    input_value: reveal.input_value.to_sat(),
                    output_value: reveal.output_value.to_sat(),
                    reveal_fee: reveal.reveal_fee.to_sat(),
                }))
            }
        }
    }

    async fn withdraw_tick_inner(
        &self,
        args: WithdrawTickArgs,
    ) -> Result<WithdrawTickBody, CustodyError> {
        let pubkey = required("pub", args.pubkey)?;
        let address = required("address", args.address)?;
        let tag = ActionTag::brc20(
            "transfer",
            &required("tick", args.tick)?,
            &required("amt", args.amt)?,
        )?;
        let transfer_fee = optional_sats("transferFee", args.transfer_fee)?;

        match args.txid.filter(|t| !t.trim().is_empty()) {
            None => {
                let quote = self
                    .lending
                    .prepare_withdraw_tick(&pubkey, &address, tag, transfer_fee)
                    .await?;
                Ok(WithdrawTickBody::Quote(quote_response(quote)))
            }
            Some(txid) => {
                let receipt = self
                    .lending
                    .execute_withdraw_tick(&pubkey, &address, tag, &txid, transfer_fee)
                    .await?;
                tracing::info!(
                    "Withdrew {} {} to {}",
                    receipt.reveal_txid,
                    receipt.transfer_txid,
                    address
                );
                Ok(WithdrawTickBody::Broadcast(WithdrawTickTxsResponse {
                    txs: vec![receipt.reveal_txid, receipt.transfer_txid],
                }))
            }
        }
    }
}

#[OpenApi]
impl Api {
    /// Custody address for a user's BTC collateral
    #[oai(path = "/deposit-address", method = "get")]
    async fn deposit_address(&self, #[oai(name = "pub")] pubkey: Query<Option<String>>) -> AddressResult {
        let result = required("pub", pubkey.0)
            .and_then(|pubkey| self.lending.deposit_address(&pubkey));

        match result {
            Ok(custody) => AddressResult::Ok(Json(AddressResponse {
                address: custody.address().to_string(),
            })),
            Err(e) => e.into(),
        }
    }

    /// Custody address for a user's BRC-20 collateral
    #[oai(path = "/deposit-brc20-address", method = "get")]
    async fn deposit_brc20_address(
        &self,
        #[oai(name = "pub")] pubkey: Query<Option<String>>,
    ) -> AddressResult {
        let result = required("pub", pubkey.0)
            .and_then(|pubkey| self.lending.deposit_brc20_address(&pubkey));

        match result {
            Ok(custody) => AddressResult::Ok(Json(AddressResponse {
                address: custody.address().to_string(),
            })),
            Err(e) => e.into(),
        }
    }

    /// Pay out a loan of `amt` sats from the protocol address
    #[oai(path = "/borrow", method = "get")]
    async fn borrow(&self, address: Query<Option<String>>, amt: Query<Option<String>>) -> TxResult {
        let address = match required("address", address.0) {
            Ok(a) => a,
            Err(e) => return e.into(),
        };
        let amt = match parse_sats("amt", amt.0) {
            Ok(a) => a,
            Err(e) => return e.into(),
        };

        match self.lending.borrow(&address, amt).await {
            Ok(receipt) => {
                tracing::info!("Borrow of {} sat to {} sent in {}", amt, address, receipt.txid);
                TxResult::Ok(Json(TxResponse {
                    tx: receipt.txid,
                    sent: receipt.sent.to_sat(),
                    fee: receipt.fee.to_sat(),
                }))
            }
            Err(e) => e.into(),
        }
    }

    /// Return `amt` sats from the user's custody address to the protocol
    #[oai(path = "/repay", method = "get")]
    async fn repay(
        &self,
        #[oai(name = "pub")] pubkey: Query<Option<String>>,
        amt: Query<Option<String>>,
    ) -> TxResult {
        let pubkey = match required("pub", pubkey.0) {
            Ok(p) => p,
            Err(e) => return e.into(),
        };
        let amt = match parse_sats("amt", amt.0) {
            Ok(a) => a,
            Err(e) => return e.into(),
        };

        match self.lending.repay(&pubkey, amt).await {
            Ok(receipt) => TxResult::Ok(Json(TxResponse {
                tx: receipt.txid,
                sent: receipt.sent.to_sat(),
                fee: receipt.fee.to_sat(),
            })),
            Err(e) => e.into(),
        }
    }

    /// Sweep the user's BTC collateral to `address`
    #[oai(path = "/withdraw", method = "get")]
    async fn withdraw(
        &self,
        #[oai(name = "pub")] pubkey: Query<Option<String>>,
        address: Query<Option<String>>,
    ) -> TxResult {
        let (pubkey, address) = match (required("pub", pubkey.0), required("address", address.0)) {
            (Ok(p), Ok(a)) => (p, a),
            (Err(e), _) | (_, Err(e)) => return e.into(),
        };

        match self.lending.withdraw(&pubkey, &address).await {
            Ok(receipt) => TxResult::Ok(Json(TxResponse {
                tx: receipt.txid,
                sent: receipt.sent.to_sat(),
                fee: receipt.fee.to_sat(),
            })),
            Err(e) => e.into(),
        }
    }

    /// Withdraw BRC-20 collateral: quote without `txid`, broadcast with it
    #[oai(path = "/withdraw-tick", method = "get")]
    async fn withdraw_tick(
        &self,
        #[oai(name = "pub")] pubkey: Query<Option<String>>,
        address: Query<Option<String>>,
        tick: Query<Option<String>>,
        amt: Query<Option<String>>,
        txid: Query<Option<String>>,
        #[oai(name = "transferFee")] transfer_fee: Query<Option<String>>,
    ) -> WithdrawTickResult {
        let args = WithdrawTickArgs {
            pubkey: pubkey.0,
            address: address.0,
            tick: tick.0,
            amt: amt.0,
            txid: txid.0,
            transfer_fee: transfer_fee.0,
        };

        match self.withdraw_tick_inner(args).await {
            Ok(body) => WithdrawTickResult::Ok(Json(body)),
            Err(e) => e.into(),
        }
    }

    /// Inscribe a BRC-20 `mint` or `transfer` from the user's wallet
    #[oai(path = "/brc20-op", method = "get")]
    async fn brc20_op(
        &self,
        op: Query<Option<String>>,
        tick: Query<Option<String>>,
        amt: Query<Option<String>>,
        #[oai(name = "pub")] pubkey: Query<Option<String>>,
        address: Query<Option<String>>,
        txid: Query<Option<String>>,
    ) -> InscriptionResult {
        let tag = required("op", op.0).and_then(|op| {
            ActionTag::brc20(&op, &required("tick", tick.0)?, &required("amt", amt.0)?)
        });

        match self.inscription(tag, pubkey.0, address.0, txid.0).await {
            Ok(body) => InscriptionResult::Ok(Json(body)),
            Err(e) => e.into(),
        }
    }

    /// Inscribe a BRC-20 `deploy`
    #[oai(path = "/brc20-deploy", method = "get")]
    async fn brc20_deploy(
        &self,
        #[oai(name = "pub")] pubkey: Query<Option<String>>,
        address: Query<Option<String>>,
        tick: Query<Option<String>>,
        max: Query<Option<String>>,
        lim: Query<Option<String>>,
        txid: Query<Option<String>>,
    ) -> InscriptionResult {
        let tag = required("tick", tick.0)
            .and_then(|tick| ActionTag::deploy(&tick, max.0.as_deref(), lim.0.as_deref()));

        match self.inscription(tag, pubkey.0, address.0, txid.0).await {
            Ok(body) => InscriptionResult::Ok(Json(body)),
            Err(e) => e.into(),
        }
    }

    /// Collateral the wallet `address` holds in the protocol pool
    #[oai(path = "/balance", method = "get")]
    async fn balance(&self, address: Query<Option<String>>) -> BalanceResult {
        let address = match required("address", address.0) {
            Ok(a) => a,
            Err(e) => return e.into(),
        };

        match self.lending.collateral_balance(&address).await {
            Ok(balance) => BalanceResult::Ok(Json(BalanceResponse {
                confirmed: balance.confirmed.to_sat(),
                unconfirmed: balance.unconfirmed.to_sat(),
                total: balance.total().to_sat(),
            })),
            Err(e) => e.into(),
        }
    }

    /// Health check
    #[oai(path = "/health", method = "get")]
    async fn health(&self) -> HealthResult {
        match self.lending.protocol_address() {
            Ok(protocol) => HealthResult::Ok(Json(HealthResponse {
                status: "ok".to_string(),
                network: self.lending.network().to_string(),
                protocol_address: protocol.address().to_string(),
                custodians: Custodian::ALL
                    .iter()
                    .map(|c| self.lending.keys().x_only(*c).to_string())
                    .collect(),
            })),
            Err(e) => {
                tracing::error!("Failed to derive protocol address: {}", e);
                HealthResult::InternalError(Json(ErrorResponse {
                    error: "unknown error".to_string(),
                }))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
    use bitcoin::{Address, Network, Txid};
    use poem::http::StatusCode;
    use poem::test::TestClient;
    use poem_openapi::OpenApiService;
    use quas_custody::{
        ChainSource, CustodianKeySet, FeeRates, IndexedTx, LendingPolicy, Result, TxStatus, Utxo,
    };

    const RECIPIENT: &str = "tb1qw508d6qejxtdg4y5r3zarvary0c5xw7kxpjzsx";

    /// Empty chain; optionally fails every call with an upstream status.
    struct StubChain {
        fail_with: Option<u16>,
    }

    impl StubChain {
        fn check(&self) -> Result<()> {
            match self.fail_with {
                Some(status) => Err(CustodyError::Upstream {
                    status,
                    body: "stub".to_string(),
                }),
                None => Ok(()),
            }
        }
    }

    #[async_trait]
    impl ChainSource for StubChain {
        async fn address_utxos(&self, _address: &Address) -> Result<Vec<Utxo>> {
            self.check()?;
            Ok(vec![])
        }

        async fn mempool_txs(&self, _address: &Address) -> Result<Vec<IndexedTx>> {
            self.check()?;
            Ok(vec![])
        }

        async fn chain_txs(
            &self,
            _address: &Address,
            _last_seen: Option<Txid>,
        ) -> Result<Vec<IndexedTx>> {
            self.check()?;
            Ok(vec![])
        }

        async fn tx_status(&self, _txid: &Txid) -> Result<TxStatus> {
            self.check()?;
            Ok(TxStatus::default())
        }

        async fn recommended_fees(&self) -> Result<FeeRates> {
            self.check()?;
            Ok(FeeRates {
                fastest_fee: 2,
                minimum_fee: 1,
                ..Default::default()
            })
        }

        async fn broadcast(&self, _raw_tx_hex: &str) -> Result<String> {
            self.check()?;
            Ok(String::new())
        }
    }

    fn client(fail_with: Option<u16>) -> TestClient<poem::endpoint::BoxEndpoint<'static>> {
        let keys = CustodianKeySet::from_seed_hex("000102030405060708090a0b0c0d0e0f").unwrap();
        let lending = LendingProtocol::new(
            Arc::new(keys),
            Network::Testnet,
            Arc::new(StubChain { fail_with }),
            LendingPolicy::default(),
        )
        .unwrap();
        let api = Api {
            lending: Arc::new(lending),
        };
        TestClient::new(OpenApiService::new(api, "Quas Lending", "1.0"))
    }

    fn user_pubkey() -> String {
        let secp = Secp256k1::new();
        let sk = SecretKey::from_slice(&[3u8; 32]).unwrap();
        PublicKey::from_secret_key(&secp, &sk).to_string()
    }

    #[tokio::test]
    async fn test_deposit_address() {
        let cli = client(None);
        let pubkey = user_pubkey();

        let resp = cli
            .get("/deposit-address")
            .query("pub", &pubkey)
            .send()
            .await;
        resp.assert_status_is_ok();
        let json = resp.json().await;
        let address = json.value().object().get("address").string().to_string();
        assert!(address.starts_with("tb1p"));

        let resp = cli
            .get("/deposit-brc20-address")
            .query("pub", &pubkey)
            .send()
            .await;
        resp.assert_status_is_ok();
        let json = resp.json().await;
        let brc20 = json.value().object().get("address").string().to_string();
        assert!(brc20.starts_with("tb1p"));
        assert_ne!(brc20, address, "BTC and BRC-20 collateral are kept apart");
    }

    #[tokio::test]
    async fn test_missing_or_bad_pub_is_bad_request() {
        let cli = client(None);

        let resp = cli.get("/deposit-address").send().await;
        resp.assert_status(StatusCode::BAD_REQUEST);
        resp.assert_json(serde_json::json!({ "error": "missing pub" }))
            .await;

        let resp = cli
            .get("/deposit-address")
            .query("pub", &"02deadbeef")
            .send()
            .await;
        resp.assert_status(StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_borrow_without_funds_is_bad_request() {
        let cli = client(None);
        let resp = cli
            .get("/borrow")
            .query("address", &RECIPIENT)
            .query("amt", &"2500")
            .send()
            .await;
        resp.assert_status(StatusCode::BAD_REQUEST);
        let json = resp.json().await;
        assert!(json
            .value()
            .object()
            .get("error")
            .string()
            .starts_with("Insufficient funds"));

        let resp = cli
            .get("/borrow")
            .query("address", &RECIPIENT)
            .query("amt", &"lots")
            .send()
            .await;
        resp.assert_status(StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_upstream_outage_is_internal_error() {
        let cli = client(Some(503));
        let resp = cli
            .get("/balance")
            .query("address", &RECIPIENT)
            .send()
            .await;
        resp.assert_status(StatusCode::INTERNAL_SERVER_ERROR);
        resp.assert_json(serde_json::json!({ "error": "unknown error" }))
            .await;
    }

    #[tokio::test]
    async fn test_empty_pool_balance() {
        let cli = client(None);
        let resp = cli
            .get("/balance")
            .query("address", &RECIPIENT)
            .send()
            .await;
        resp.assert_status_is_ok();
        resp.assert_json(serde_json::json!({
            "confirmed": 0,
            "unconfirmed": 0,
            "total": 0
        }))
        .await;
    }

    #[tokio::test]
    async fn test_oversized_amounts_are_bad_request() {
        let cli = client(None);
        let too_much = u64::MAX.to_string();

        let resp = cli
            .get("/repay")
            .query("pub", &user_pubkey())
            .query("amt", &too_much)
            .send()
            .await;
        resp.assert_status(StatusCode::BAD_REQUEST);

        let resp = cli
            .get("/withdraw-tick")
            .query("pub", &user_pubkey())
            .query("address", &RECIPIENT)
            .query("tick", &"ORDIQ")
            .query("amt", &"250")
            .query("transferFee", &too_much)
            .send()
            .await;
        resp.assert_status(StatusCode::BAD_REQUEST);

        let resp = cli
            .get("/borrow")
            .query("address", &RECIPIENT)
            .query("amt", &(Amount::MAX_MONEY.to_sat() + 1).to_string())
            .send()
            .await;
        resp.assert_status(StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_parse_sats_bounds() {
        assert_eq!(parse_sats("amt", Some(" 2500 ".to_string())).unwrap(), 2500);
        assert_eq!(
            parse_sats("amt", Some(Amount::MAX_MONEY.to_sat().to_string())).unwrap(),
            Amount::MAX_MONEY.to_sat()
        );
        assert!(parse_sats("amt", Some(u64::MAX.to_string())).is_err());
        assert!(parse_sats("amt", Some("-1".to_string())).is_err());
        assert!(parse_sats("amt", None).is_err());
    }

    #[tokio::test]
    async fn test_upstream_rejection_is_bad_request() {
        let cli = client(Some(400));
        let resp = cli
            .get("/brc20-op")
            .query("op", &"mint")
            .query("tick", &"ORDIQ")
            .query("amt", &"1000")
            .query("pub", &user_pubkey())
            .query("address", &RECIPIENT)
            .send()
            .await;
        resp.assert_status(StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_brc20_op_quote() {
        let cli = client(None);
        let resp = cli
            .get("/brc20-op")
            .query("op", &"mint")
            .query("tick", &"ORDIQ")
            .query("amt", &"1000")
            .query("pub", &user_pubkey())
            .query("address", &RECIPIENT)
            .send()
            .await;
        resp.assert_status_is_ok();
        let json = resp.json().await;
        let body = json.value().object();
        body.get("data")
            .assert_string(r#"{"p":"brc-20","op":"mint","tick":"ORDIQ","amt":"1000"}"#);
        let reveal_fee = body.get("revealFee").i64();
        assert_eq!(body.get("fundAmount").i64(), 600 + reveal_fee);

        let resp = cli
            .get("/brc20-op")
            .query("op", &"burn")
            .query("tick", &"ORDIQ")
            .query("amt", &"1000")
            .query("pub", &user_pubkey())
            .query("address", &RECIPIENT)
            .send()
            .await;
        resp.assert_status(StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_health() {
        let cli = client(None);
        let resp = cli.get("/health").send().await;
        resp.assert_status_is_ok();
        let json = resp.json().await;
        let body = json.value().object();
        body.get("status").assert_string("ok");
        body.get("network").assert_string("testnet");
        assert_eq!(body.get("custodians").array().len(), 3);
    }
}
