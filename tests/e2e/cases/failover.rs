use crate::e2e::*;
use axum::http::StatusCode;
use proxyd::{
    config::BackendGroupConfig,
    types::{RequestContext, RpcRequest},
};
use serde_json::{json, value::RawValue};

#[tokio::test]
async fn fails_over_on_server_error() {
    let broken = MockBackend::spawn("broken").await;
    broken.with_state(|state| state.status = Some(StatusCode::SERVICE_UNAVAILABLE));
    let healthy = MockBackend::spawn("healthy").await;

    let mut config = config(&[&broken, &healthy], &["eth_chainId"]);
    config.server.enable_served_by_header = true;
    let proxy = spawn(config).await;

    for id in 0..4 {
        let reply = post(&proxy, &call("eth_chainId", json!([]), json!(id))).await;
        assert_eq!(reply.status, StatusCode::OK);
        assert_eq!(reply.body["result"], "healthy");
        assert_eq!(reply.body["id"], id);
        assert_eq!(reply.headers["x-served-by"], "main/healthy");
    }
    proxy.shutdown().await;
}

#[tokio::test]
async fn fallbacks_only_when_primaries_fail() {
    let primary = MockBackend::spawn("primary").await;
    let fallback = MockBackend::spawn("fallback").await;

    let config = config(&[&primary], &["eth_chainId"])
        .with_backend("fallback", fallback.config())
        .with_backend_group(
            "main",
            BackendGroupConfig::new(["primary"]).with_fallbacks(["fallback"]),
        );
    let proxy = spawn(config).await;

    let reply = post(&proxy, &call("eth_chainId", json!([]), json!(1))).await;
    assert_eq!(reply.body["result"], "primary");
    assert_eq!(fallback.with_state(|state| state.requests), 0);

    primary.with_state(|state| state.status = Some(StatusCode::BAD_GATEWAY));
    let reply = post(&proxy, &call("eth_chainId", json!([]), json!(2))).await;
    assert_eq!(reply.body["result"], "fallback");
    proxy.shutdown().await;
}

#[tokio::test]
async fn no_backend_available() {
    let backend = MockBackend::spawn("node").await;
    backend.with_state(|state| state.status = Some(StatusCode::INTERNAL_SERVER_ERROR));
    let proxy = spawn(config(&[&backend], &["eth_chainId"])).await;

    let reply = post(&proxy, &call("eth_chainId", json!([]), json!(1))).await;
    assert_eq!(reply.status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(reply.body["error"]["code"], -32011);
    assert_eq!(reply.body["id"], 1);

    // inside a batch the failure is per call and the batch itself succeeds
    let reply = post(&proxy, &json!([call("eth_chainId", json!([]), json!(2))])).await;
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.body[0]["error"]["code"], -32011);
    assert_eq!(reply.body[0]["id"], 2);
    proxy.shutdown().await;
}

#[tokio::test]
async fn upstream_minibatches() {
    let backend = MockBackend::spawn("node").await;
    let mut config = config(&[&backend], &["eth_chainId"]);
    config.server.max_upstream_batch_size = 2;
    let proxy = spawn(config).await;

    let batch: Vec<_> = (0..5).map(|id| call("eth_chainId", json!([]), json!(id))).collect();
    let reply = post(&proxy, &json!(batch)).await;

    let ids: Vec<_> = reply.body.as_array().unwrap().iter().map(|a| a["id"].clone()).collect();
    assert_eq!(ids, (0..5).map(|id| json!(id)).collect::<Vec<_>>());
    assert_eq!(backend.with_state(|state| state.requests), 3);
    proxy.shutdown().await;
}

#[tokio::test]
async fn oversized_responses_fail_over() {
    let big = MockBackend::spawn("big").await;
    big.set_result("eth_getCode", json!("0x".to_string() + &"00".repeat(256)));
    let small = MockBackend::spawn("small").await;

    let mut config = config(&[&big, &small], &["eth_getCode"]);
    config.backends.get_mut("big").unwrap().max_response_size_bytes = 128;
    let proxy = spawn(config).await;

    let payload = call("eth_getCode", json!(["0x01", "0x1"]), json!(1));
    let reply = post(&proxy, &payload).await;
    assert_eq!(reply.body["result"], "small");

    small.with_state(|state| state.status = Some(StatusCode::SERVICE_UNAVAILABLE));
    let reply = post(&proxy, &payload).await;
    assert_eq!(reply.body["error"]["code"], -32020);
    proxy.shutdown().await;
}

#[tokio::test]
async fn served_by_lists_each_backend_once() {
    let big = MockBackend::spawn("big").await;
    big.set_result("eth_getCode", json!("0x".to_string() + &"00".repeat(256)));
    let small = MockBackend::spawn("small").await;

    let mut config = config(&[&big, &small], &["eth_chainId", "eth_getCode"]);
    config.server.max_upstream_batch_size = 1;
    config.backends.get_mut("big").unwrap().max_response_size_bytes = 128;
    let proxy = spawn(config).await;

    // the middle call fails over, so the minibatches are served by big, small, big
    let params = || RawValue::from_string("[]".to_string()).unwrap();
    let requests = [
        RpcRequest::new("eth_chainId", params(), 1),
        RpcRequest::new("eth_getCode", params(), 2),
        RpcRequest::new("eth_chainId", params(), 3),
    ];
    let group = proxy.proxy.group("main").unwrap();
    let response = group.forward(&RequestContext::new(), &requests).await;
    assert_eq!(response.responses[1].result.as_ref().unwrap().get(), "\"small\"");
    assert_eq!(response.served_by, ["main/big", "main/small"]);
    proxy.shutdown().await;
}
