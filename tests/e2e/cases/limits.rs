use crate::e2e::*;
use alloy::{
    consensus::{SignableTransaction, TxEip1559, TxEnvelope},
    eips::Encodable2718,
    network::TxSignerSync,
    primitives::{Address, B256, TxKind, U256, hex},
    signers::local::PrivateKeySigner,
};
use axum::http::StatusCode;
use proxyd::config::{MethodOverride, RateLimitConfig, SenderRateLimitConfig};
use reqwest::header::USER_AGENT;
use serde_json::{Value, json};
use std::time::Duration;

fn send_raw(key: u8, id: u64) -> Value {
    let signer = PrivateKeySigner::from_bytes(&B256::with_last_byte(key)).unwrap();
    let mut tx = TxEip1559 {
        chain_id: 10,
        gas_limit: 21_000,
        max_fee_per_gas: 1_000_000_000,
        max_priority_fee_per_gas: 1,
        to: TxKind::Call(Address::ZERO),
        value: U256::from(1),
        ..Default::default()
    };
    let signature = signer.sign_transaction_sync(&mut tx).unwrap();
    let raw = hex::encode_prefixed(TxEnvelope::from(tx.into_signed(signature)).encoded_2718());
    call("eth_sendRawTransaction", json!([raw]), json!(id))
}

#[tokio::test]
async fn sender_rate_limit() {
    let backend = MockBackend::spawn("node").await;
    let config = config(&[&backend], &["eth_sendRawTransaction"]).with_sender_rate_limit(
        SenderRateLimitConfig {
            enabled: true,
            limit: 1,
            interval: Duration::from_secs(60),
            allowed_chain_ids: vec![10],
        },
    );
    let proxy = spawn(config).await;

    let reply = post(&proxy, &send_raw(1, 1)).await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.body["result"], "node");

    let reply = post(&proxy, &send_raw(1, 2)).await;
    assert_eq!(reply.status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(reply.body["error"]["code"], -32017);
    assert_eq!(reply.body["id"], 2);

    let reply = post(&proxy, &send_raw(2, 3)).await;
    assert_eq!(reply.body["result"], "node");

    let reply = post(&proxy, &call("eth_sendRawTransaction", json!(["0xzz"]), json!(4))).await;
    assert_eq!(reply.status, StatusCode::BAD_REQUEST);
    assert_eq!(reply.body["error"]["code"], -32019);

    assert_eq!(backend.calls_for("eth_sendRawTransaction").len(), 2);
    proxy.shutdown().await;
}

#[tokio::test]
async fn base_rate_limit() {
    let backend = MockBackend::spawn("node").await;
    let config = config(&[&backend], &["eth_chainId"]).with_rate_limit(RateLimitConfig {
        base_rate: 2,
        base_interval: Duration::from_secs(60),
        exempt_user_agents: vec!["^trusted".to_string()],
        error_message: "slow down".to_string(),
        ..Default::default()
    });
    let proxy = spawn(config).await;

    let payload = call("eth_chainId", json!([]), json!(1));
    for _ in 0..2 {
        assert_eq!(post(&proxy, &payload).await.status, StatusCode::OK);
    }
    let reply = post(&proxy, &payload).await;
    assert_eq!(reply.status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(reply.body["error"]["code"], -32016);
    assert_eq!(reply.body["error"]["message"], "slow down");

    let mut trusted = headers();
    trusted.insert(USER_AGENT, "trusted-bot/1.0".parse().unwrap());
    let body = serde_json::to_vec(&payload).unwrap();
    let reply = post_raw(&proxy, "/", trusted, body).await;
    assert_eq!(reply.status, StatusCode::OK);

    // clients behind the forwarding header have their own bucket
    let mut forwarded = headers();
    forwarded.insert("x-forwarded-for", "203.0.113.7, 10.0.0.1".parse().unwrap());
    let body = serde_json::to_vec(&payload).unwrap();
    assert_eq!(post_raw(&proxy, "/", forwarded, body).await.status, StatusCode::OK);
    proxy.shutdown().await;
}

#[tokio::test]
async fn method_override_inside_batch() {
    let backend = MockBackend::spawn("node").await;
    let mut rate_limit = RateLimitConfig::default();
    rate_limit.method_overrides.insert(
        "eth_gasPrice".to_string(),
        MethodOverride { limit: 1, interval: Duration::from_secs(60), global: false },
    );
    let config =
        config(&[&backend], &["eth_chainId", "eth_gasPrice"]).with_rate_limit(rate_limit);
    let proxy = spawn(config).await;

    let reply = post(
        &proxy,
        &json!([
            call("eth_gasPrice", json!([]), json!(1)),
            call("eth_gasPrice", json!([]), json!(2)),
            call("eth_chainId", json!([]), json!(3)),
        ]),
    )
    .await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.body[0]["result"], "node");
    assert_eq!(reply.body[1]["error"]["code"], -32016);
    assert_eq!(reply.body[1]["id"], 2);
    assert_eq!(reply.body[2]["result"], "node");
    assert_eq!(backend.calls_for("eth_gasPrice").len(), 1);
    proxy.shutdown().await;
}
