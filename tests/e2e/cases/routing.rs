use crate::e2e::*;
use axum::http::StatusCode;
use serde_json::json;

#[tokio::test]
async fn single_call_keeps_id() {
    let backend = MockBackend::spawn("node").await;
    backend.set_result("eth_chainId", json!("0xa"));
    let proxy = spawn(config(&[&backend], &["eth_chainId"])).await;

    for id in [json!(999), json!("999"), json!("abc"), json!(null)] {
        let reply = post(&proxy, &call("eth_chainId", json!([]), id.clone())).await;
        assert_eq!(reply.status, StatusCode::OK);
        assert_eq!(reply.body, json!({"jsonrpc": "2.0", "result": "0xa", "id": id}));
    }
    proxy.shutdown().await;
}

#[tokio::test]
async fn method_not_whitelisted() {
    let backend = MockBackend::spawn("node").await;
    let proxy = spawn(config(&[&backend], &["eth_chainId"])).await;

    let reply = post(&proxy, &call("eth_sign", json!([]), json!(7))).await;
    assert_eq!(reply.status, StatusCode::FORBIDDEN);
    assert_eq!(reply.body["error"]["code"], -32001);
    assert_eq!(reply.body["error"]["message"], "rpc method is not whitelisted");
    assert_eq!(reply.body["id"], 7);
    assert!(backend.calls_for("eth_sign").is_empty());
    proxy.shutdown().await;
}

#[tokio::test]
async fn empty_batch() {
    let backend = MockBackend::spawn("node").await;
    let proxy = spawn(config(&[&backend], &["eth_chainId"])).await;

    let reply = post(&proxy, &json!([])).await;
    assert_eq!(reply.status, StatusCode::BAD_REQUEST);
    assert_eq!(
        reply.body,
        json!({
            "jsonrpc": "2.0",
            "error": {"code": -32601, "message": "must specify at least one batch call"},
            "id": null,
        })
    );
    proxy.shutdown().await;
}

#[tokio::test]
async fn invalid_payloads() {
    let backend = MockBackend::spawn("node").await;
    let proxy = spawn(config(&[&backend], &["eth_chainId"])).await;

    let reply = post_raw(&proxy, "/", headers(), b"{not json".to_vec()).await;
    assert_eq!(reply.status, StatusCode::BAD_REQUEST);
    assert_eq!(reply.body["error"]["code"], -32700);
    assert_eq!(reply.body["id"], json!(null));

    let reply =
        post(&proxy, &json!({"jsonrpc": "1.0", "method": "eth_chainId", "id": 1})).await;
    assert_eq!(reply.status, StatusCode::BAD_REQUEST);
    assert_eq!(reply.body["error"]["code"], -32600);
    proxy.shutdown().await;
}

#[tokio::test]
async fn batch_answers_in_order() {
    let backend = MockBackend::spawn("node").await;
    backend.set_result("eth_chainId", json!("0xa"));
    let proxy = spawn(config(&[&backend], &["eth_chainId", "net_version"])).await;

    let reply = post(
        &proxy,
        &json!([
            call("eth_chainId", json!([]), json!(1)),
            call("eth_accounts", json!([]), json!(2)),
            call("eth_sign", json!([]), json!(3)),
            {"jsonrpc": "2.0", "id": 4},
            call("net_version", json!([]), json!("5")),
        ]),
    )
    .await;

    assert_eq!(reply.status, StatusCode::OK);
    let answers = reply.body.as_array().unwrap();
    assert_eq!(answers.len(), 5);
    assert_eq!(answers[0]["result"], "0xa");
    assert_eq!(answers[0]["id"], 1);
    assert_eq!(answers[1]["result"], json!([]));
    assert_eq!(answers[1]["id"], 2);
    assert_eq!(answers[2]["error"]["code"], -32001);
    assert_eq!(answers[2]["id"], 3);
    assert_eq!(answers[3]["error"]["code"], -32601);
    assert_eq!(answers[3]["id"], json!(null));
    assert_eq!(answers[4]["result"], "node");
    assert_eq!(answers[4]["id"], "5");

    assert!(backend.calls_for("eth_accounts").is_empty());
    proxy.shutdown().await;
}

#[tokio::test]
async fn duplicate_ids_go_upstream_separately() {
    let backend = MockBackend::spawn("node").await;
    backend.set_result("eth_chainId", json!("0xa"));
    backend.set_result("net_version", json!("10"));
    let proxy = spawn(config(&[&backend], &["eth_chainId", "net_version"])).await;

    let reply = post(
        &proxy,
        &json!([
            call("eth_chainId", json!([]), json!(1)),
            call("net_version", json!([]), json!(1)),
        ]),
    )
    .await;

    assert_eq!(
        reply.body,
        json!([
            {"jsonrpc": "2.0", "result": "0xa", "id": 1},
            {"jsonrpc": "2.0", "result": "10", "id": 1},
        ])
    );
    assert_eq!(backend.with_state(|state| state.requests), 2);
    proxy.shutdown().await;
}

#[tokio::test]
async fn batch_too_large() {
    let backend = MockBackend::spawn("node").await;
    let mut config = config(&[&backend], &["eth_chainId"]);
    config.server.batch.max_size = 2;
    config.server.batch.error_message = "batch too big".to_string();
    let proxy = spawn(config).await;

    let batch: Vec<_> = (0..3).map(|id| call("eth_chainId", json!([]), json!(id))).collect();
    let reply = post(&proxy, &json!(batch)).await;
    assert_eq!(reply.status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(reply.body["error"]["code"], -32014);
    assert_eq!(reply.body["error"]["message"], "batch too big");
    assert_eq!(backend.with_state(|state| state.requests), 0);
    proxy.shutdown().await;
}

#[tokio::test]
async fn body_too_large() {
    let backend = MockBackend::spawn("node").await;
    let mut config = config(&[&backend], &["eth_chainId"]);
    config.server.max_body_size_bytes = 64;
    let proxy = spawn(config).await;

    let reply = post(&proxy, &call("eth_chainId", json!(["x".repeat(100)]), json!(1))).await;
    assert_eq!(reply.status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(reply.body["error"]["code"], -32021);
    proxy.shutdown().await;
}

#[tokio::test]
async fn authentication_by_path() {
    let backend = MockBackend::spawn("node").await;
    let config = config(&[&backend], &["eth_chainId"]).with_authentication("s3cret", "alice");
    let proxy = spawn(config).await;

    let payload = call("eth_chainId", json!([]), json!(1));
    assert_eq!(post(&proxy, &payload).await.status, StatusCode::UNAUTHORIZED);
    assert_eq!(post_to(&proxy, "/wrong", &payload).await.status, StatusCode::UNAUTHORIZED);

    let reply = post_to(&proxy, "/s3cret", &payload).await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.body["result"], "node");
    proxy.shutdown().await;
}

#[tokio::test]
async fn served_by_header() {
    let backend = MockBackend::spawn("node").await;
    let mut config = config(&[&backend], &["eth_chainId"]);
    config.server.enable_served_by_header = true;
    let proxy = spawn(config).await;

    let reply = post(&proxy, &call("eth_chainId", json!([]), json!(1))).await;
    assert_eq!(reply.headers["x-served-by"], "main/node");
    assert_eq!(reply.headers["x-proxyd-cache-status"], "MISS");
    proxy.shutdown().await;
}

#[tokio::test]
async fn healthz() {
    let backend = MockBackend::spawn("node").await;
    let proxy = spawn(config(&[&backend], &["eth_chainId"])).await;

    let response =
        reqwest::get(format!("{}/healthz", proxy.http_url())).await.unwrap();
    assert!(response.status().is_success());
    assert_eq!(response.text().await.unwrap(), "OK");
    proxy.shutdown().await;
}
