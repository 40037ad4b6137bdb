use crate::e2e::*;
use proxyd::config::CacheConfig;
use serde_json::json;

fn cache() -> CacheConfig {
    CacheConfig { enabled: true, ..Default::default() }
}

#[tokio::test]
async fn constants_are_cached() {
    let backend = MockBackend::spawn("node").await;
    backend.set_result("eth_chainId", json!("0xa"));
    let proxy = spawn(config(&[&backend], &["eth_chainId"]).with_cache(cache())).await;

    let reply = post(&proxy, &call("eth_chainId", json!([]), json!(1))).await;
    assert_eq!(reply.headers["x-proxyd-cache-status"], "MISS");
    assert_eq!(reply.body["result"], "0xa");

    let reply = post(&proxy, &call("eth_chainId", json!([]), json!("second"))).await;
    assert_eq!(reply.headers["x-proxyd-cache-status"], "HIT");
    assert_eq!(reply.body, json!({"jsonrpc": "2.0", "result": "0xa", "id": "second"}));
    assert_eq!(backend.calls_for("eth_chainId").len(), 1);
    proxy.shutdown().await;
}

#[tokio::test]
async fn symbolic_tags_are_not_cached() {
    let backend = MockBackend::spawn("node").await;
    let proxy = spawn(config(&[&backend], &["eth_getBalance"]).with_cache(cache())).await;

    let payload = call("eth_getBalance", json!(["0x01", "latest"]), json!(1));
    post(&proxy, &payload).await;
    let reply = post(&proxy, &payload).await;
    assert_eq!(reply.headers["x-proxyd-cache-status"], "MISS");
    assert_eq!(backend.calls_for("eth_getBalance").len(), 2);
    proxy.shutdown().await;
}

#[tokio::test]
async fn finalized_blocks_are_cached() {
    let a = MockBackend::spawn("a").await;
    let b = MockBackend::spawn("b").await;
    let config = with_consensus(config(&[&a, &b], &["eth_getBalance"])).with_cache(cache());
    let proxy = spawn(config).await;
    wait_for_consensus(&proxy).await;
    let forwarded =
        || a.calls_for("eth_getBalance").len() + b.calls_for("eth_getBalance").len();

    // finalized is 0xe0: block 0x10 is final, block 0x100 is not
    let finalized = call("eth_getBalance", json!(["0x01", "0x10"]), json!(1));
    post(&proxy, &finalized).await;
    let reply = post(&proxy, &finalized).await;
    assert_eq!(reply.headers["x-proxyd-cache-status"], "HIT");
    assert_eq!(forwarded(), 1);

    let recent = call("eth_getBalance", json!(["0x01", "0x100"]), json!(2));
    post(&proxy, &recent).await;
    let reply = post(&proxy, &recent).await;
    assert_eq!(reply.headers["x-proxyd-cache-status"], "MISS");
    assert_eq!(forwarded(), 3);
    proxy.shutdown().await;
}

#[tokio::test]
async fn batch_mixes_hits_and_misses() {
    let backend = MockBackend::spawn("node").await;
    backend.set_result("eth_chainId", json!("0xa"));
    let config = config(&[&backend], &["eth_chainId", "eth_gasPrice"]).with_cache(cache());
    let proxy = spawn(config).await;

    post(&proxy, &call("eth_chainId", json!([]), json!(0))).await;
    let batch = json!([
        call("eth_gasPrice", json!([]), json!(1)),
        call("eth_chainId", json!([]), json!(2)),
    ]);
    let reply = post(&proxy, &batch).await;
    assert_eq!(reply.headers["x-proxyd-cache-status"], "HIT");
    assert_eq!(reply.body[0]["result"], "node");
    assert_eq!(reply.body[1]["result"], "0xa");
    assert_eq!(reply.body[1]["id"], 2);
    assert_eq!(backend.calls_for("eth_chainId").len(), 1);
    proxy.shutdown().await;
}
