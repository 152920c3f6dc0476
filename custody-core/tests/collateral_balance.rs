use std::sync::Arc;

use bitcoin::{Network, SignedAmount};
use quas_custody::leaf::build_action_leaf;
use quas_custody::{
    ActionTag, Custodian, CustodianKeySet, CustodyError, LendingPolicy, LendingProtocol,
    MempoolClient,
};
use serde_json::{json, Value};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const SEED: &str = "000102030405060708090a0b0c0d0e0f";
const WALLET: &str = "tb1qw508d6qejxtdg4y5r3zarvary0c5xw7kxpjzsx";
const STRANGER: &str = "tb1qrp33g0q5c5txsp9arysrx4k6zdkfs4nce4xj0gdcccefvpysxf3q0sl5k7";

fn keys() -> CustodianKeySet {
    CustodianKeySet::from_seed_hex(SEED).unwrap()
}

fn leaf_witness(tag: &ActionTag) -> Value {
    let keys = keys();
    let leaf = build_action_leaf(&keys.x_only(Custodian::K0), &keys.x_only(Custodian::K1), tag).unwrap();
    json!(["00".repeat(64), "00".repeat(64), hex::encode(leaf.as_bytes()), "c0"])
}

fn input(from: &str, value: u64, witness: Value) -> Value {
    json!({
        "txid": "11".repeat(32),
        "vout": 0,
        "prevout": {"scriptpubkey_address": from, "value": value},
        "witness": witness
    })
}

fn output(to: &str, value: u64) -> Value {
    json!({"scriptpubkey_address": to, "value": value})
}

fn tx(txid_byte: &str, vin: Vec<Value>, vout: Vec<Value>) -> Value {
    json!({"txid": txid_byte.repeat(32), "vin": vin, "vout": vout})
}

async fn mount(server: &MockServer, route: String, body: Value) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(server)
        .await;
}

async fn lending(server: &MockServer) -> LendingProtocol {
    LendingProtocol::new(
        Arc::new(keys()),
        Network::Testnet,
        Arc::new(MempoolClient::new(server.uri())),
        LendingPolicy::default(),
    )
    .unwrap()
}

#[tokio::test]
async fn collateral_counts_deposits_less_tagged_withdrawals() {
    let server = MockServer::start().await;
    let lending = lending(&server).await;
    let pool = lending.protocol_address().unwrap().address().to_string();

    mount(
        &server,
        format!("/address/{}/txs/mempool", pool),
        json!([tx(
            "a1",
            vec![input(WALLET, 8000, json!([]))],
            vec![output(&pool, 7000), output(WALLET, 500)]
        )]),
    )
    .await;
    mount(
        &server,
        format!("/address/{}/txs/chain", pool),
        json!([
            tx(
                "b1",
                vec![input(&pool, 30_000, leaf_witness(&ActionTag::Withdraw))],
                vec![output(WALLET, 20_000), output(&pool, 9_500)]
            ),
            tx(
                "b2",
                vec![input(&pool, 30_000, leaf_witness(&ActionTag::Borrow))],
                vec![output(WALLET, 25_000), output(&pool, 4_000)]
            )
        ]),
    )
    .await;
    mount(
        &server,
        format!("/address/{}/txs/chain/{}", pool, "b2".repeat(32)),
        json!([
            tx(
                "c1",
                vec![input(WALLET, 60_000, json!([]))],
                vec![output(&pool, 50_000), output(WALLET, 9_000)]
            ),
            tx(
                "c2",
                vec![input(STRANGER, 10_000, json!([]))],
                vec![output(&pool, 10_000)]
            )
        ]),
    )
    .await;
    mount(
        &server,
        format!("/address/{}/txs/chain/{}", pool, "c2".repeat(32)),
        json!([]),
    )
    .await;

    let balance = lending.collateral_balance(WALLET).await.unwrap();
    assert_eq!(balance.unconfirmed, SignedAmount::from_sat(7000));
    // 50 000 in, 30 000 - 9 500 back out; the borrow is not a withdrawal
    assert_eq!(balance.confirmed, SignedAmount::from_sat(29_500));
    assert_eq!(balance.total(), SignedAmount::from_sat(36_500));
}

#[tokio::test]
async fn collateral_rejects_foreign_network_address() {
    let server = MockServer::start().await;
    let lending = lending(&server).await;

    let err = lending
        .collateral_balance("bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4")
        .await
        .unwrap_err();
    assert!(matches!(err, CustodyError::Validation(_)));
}

#[tokio::test]
async fn collateral_indexer_outage_is_server_side() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(502))
        .mount(&server)
        .await;
    let lending = lending(&server).await;

    let err = lending.collateral_balance(WALLET).await.unwrap_err();
    assert!(matches!(err, CustodyError::Upstream { status: 502, .. }));
    assert!(!err.is_caller_correctable());
}
