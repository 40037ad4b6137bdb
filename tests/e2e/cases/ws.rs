use crate::e2e::*;
use futures_util::{SinkExt, StreamExt};
use proxyd::config::RateLimitConfig;
use serde_json::{Value, json};
use std::time::Duration;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};

type Client = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

async fn roundtrip(client: &mut Client, payload: Value) -> Value {
    client.send(Message::text(payload.to_string())).await.unwrap();
    loop {
        match client.next().await.unwrap().unwrap() {
            Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame {other:?}"),
        }
    }
}

#[tokio::test]
async fn relays_whitelisted_calls() {
    let backend = MockBackend::spawn("node").await;
    backend.set_result("eth_chainId", json!("0xa"));
    let config = config(&[&backend], &["eth_chainId"])
        .with_ws_port(Some(0))
        .with_ws_backend_group("main", ["eth_chainId", "eth_subscribe"]);
    let proxy = spawn(config).await;

    let (mut client, _) = connect_async(proxy.ws_url().unwrap()).await.unwrap();

    let reply = roundtrip(&mut client, call("eth_chainId", json!([]), json!(1))).await;
    assert_eq!(reply, json!({"jsonrpc": "2.0", "result": "0xa", "id": 1}));

    // rejected frames are answered locally and keep the session open
    let reply = roundtrip(&mut client, call("eth_sign", json!([]), json!(2))).await;
    assert_eq!(reply["error"]["code"], -32001);
    assert_eq!(reply["id"], 2);

    let reply = roundtrip(&mut client, call("eth_accounts", json!([]), json!(3))).await;
    assert_eq!(reply["result"], json!([]));

    let reply = roundtrip(&mut client, json!("not a call")).await;
    assert_eq!(reply["error"]["code"], -32700);
    assert_eq!(reply["id"], Value::Null);

    let reply = roundtrip(&mut client, call("eth_chainId", json!([]), json!(4))).await;
    assert_eq!(reply["result"], "0xa");

    assert!(backend.calls_for("eth_sign").is_empty());
    assert!(backend.calls_for("eth_accounts").is_empty());
    assert_eq!(backend.calls_for("eth_chainId").len(), 2);

    client.close(None).await.unwrap();
    proxy.shutdown().await;
}

#[tokio::test]
async fn websocket_requires_authentication() {
    let backend = MockBackend::spawn("node").await;
    let config = config(&[&backend], &["eth_chainId"])
        .with_ws_port(Some(0))
        .with_ws_backend_group("main", ["eth_chainId"])
        .with_authentication("s3cret", "alice");
    let proxy = spawn(config).await;
    let url = proxy.ws_url().unwrap();

    assert!(connect_async(url.clone()).await.is_err());

    let (mut client, _) = connect_async(format!("{url}/s3cret")).await.unwrap();
    let reply = roundtrip(&mut client, call("eth_chainId", json!([]), json!(1))).await;
    assert_eq!(reply["result"], "node");
    proxy.shutdown().await;
}

#[tokio::test]
async fn frames_count_against_base_rate_limit() {
    let backend = MockBackend::spawn("node").await;
    let config = config(&[&backend], &["eth_chainId"])
        .with_ws_port(Some(0))
        .with_ws_backend_group("main", ["eth_chainId"])
        .with_rate_limit(RateLimitConfig {
            base_rate: 2,
            base_interval: Duration::from_secs(60),
            ..Default::default()
        });
    let proxy = spawn(config).await;

    let (mut client, _) = connect_async(proxy.ws_url().unwrap()).await.unwrap();
    for id in 1..=2 {
        let reply = roundtrip(&mut client, call("eth_chainId", json!([]), json!(id))).await;
        assert_eq!(reply["result"], "node");
    }
    let reply = roundtrip(&mut client, call("eth_chainId", json!([]), json!(3))).await;
    assert_eq!(reply["error"]["code"], -32016);
    assert_eq!(reply["id"], 3);
    assert_eq!(backend.calls_for("eth_chainId").len(), 2);
    proxy.shutdown().await;
}
