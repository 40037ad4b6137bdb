use crate::e2e::*;
use serde_json::json;
use std::time::Duration;

const ADDRESS: &str = "0x00000000000000000000000000000000000000aa";

#[tokio::test]
async fn block_tags_are_pinned_to_consensus() {
    let a = MockBackend::spawn("a").await;
    let b = MockBackend::spawn("b").await;
    let methods = ["eth_getBalance", "eth_blockNumber", "eth_getBlockByNumber"];
    let proxy = spawn(with_consensus(config(&[&a, &b], &methods))).await;
    wait_for_consensus(&proxy).await;

    let snapshot = proxy.proxy.group("main").unwrap().consensus().unwrap().snapshot();
    assert_eq!((snapshot.latest, snapshot.safe, snapshot.finalized), (0x101, 0xf0, 0xe0));

    let reply = post(&proxy, &call("eth_blockNumber", json!([]), json!(1))).await;
    assert_eq!(reply.body["result"], "0x101");
    assert!(a.calls_for("eth_blockNumber").is_empty());
    assert!(b.calls_for("eth_blockNumber").is_empty());

    post(&proxy, &call("eth_getBalance", json!([ADDRESS, "latest"]), json!(2))).await;
    post(&proxy, &call("eth_getBalance", json!([ADDRESS]), json!(3))).await;
    post(&proxy, &call("eth_getBalance", json!([ADDRESS, "finalized"]), json!(4))).await;
    post(&proxy, &call("eth_getBalance", json!([ADDRESS, "0x5"]), json!(5))).await;

    let mut seen: Vec<_> = a
        .calls_for("eth_getBalance")
        .into_iter()
        .chain(b.calls_for("eth_getBalance"))
        .map(|call| (call["id"].as_u64().unwrap(), call["params"][1].clone()))
        .collect();
    seen.sort_by_key(|(id, _)| *id);
    assert_eq!(
        seen,
        vec![(2, json!("0x101")), (3, json!("0x101")), (4, json!("0xe0")), (5, json!("0x5"))]
    );
    proxy.shutdown().await;
}

#[tokio::test]
async fn blocks_beyond_head_are_rejected() {
    let a = MockBackend::spawn("a").await;
    let mut config = with_consensus(config(&[&a], &["eth_getBlockByNumber", "eth_getLogs"]));
    config.backend_groups.get_mut("main").unwrap().consensus_max_block_range = Some(100);
    let proxy = spawn(config).await;
    wait_for_consensus(&proxy).await;

    let reply =
        post(&proxy, &call("eth_getBlockByNumber", json!(["0x200", false]), json!(1))).await;
    assert_eq!(reply.body["error"]["code"], -32602);
    assert_eq!(reply.body["error"]["message"], "block is out of range");
    assert_eq!(reply.body["id"], 1);

    let reply = post(
        &proxy,
        &call("eth_getLogs", json!([{"fromBlock": "0x1", "toBlock": "latest"}]), json!(2)),
    )
    .await;
    assert_eq!(reply.body["error"]["message"], "block range is too large");

    let reply = post(
        &proxy,
        &call("eth_getLogs", json!([{"fromBlock": "0x100", "toBlock": "latest"}]), json!(3)),
    )
    .await;
    assert_eq!(reply.body["result"], "a");
    let logs = a.calls_for("eth_getLogs");
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0]["params"][0]["toBlock"], "0x101");
    proxy.shutdown().await;
}

#[tokio::test]
async fn zero_height_ban_and_recovery() {
    let a = MockBackend::spawn("a").await;
    let b = MockBackend::spawn("b").await;
    b.with_state(|state| state.latest = 0);

    let mut config = with_consensus(config(&[&a, &b], &["eth_getBalance"]));
    config.backend_groups.get_mut("main").unwrap().consensus_ban_period =
        Duration::from_millis(500);
    let proxy = spawn(config).await;
    let consensus = proxy.proxy.group("main").unwrap().consensus().unwrap().clone();

    wait_until(|| consensus.is_banned(1) && consensus.snapshot().contains(0)).await;
    assert!(!consensus.snapshot().contains(1));

    b.with_state(|state| state.latest = 0x101);
    wait_until(|| !consensus.is_banned(1) && consensus.snapshot().contains(1)).await;
    proxy.shutdown().await;
}

#[tokio::test]
async fn dissenting_fork_is_excluded() {
    let a = MockBackend::spawn("a").await;
    let b = MockBackend::spawn("b").await;
    let c = MockBackend::spawn("c").await;
    c.with_state(|state| state.fork = 1);

    let proxy = spawn(with_consensus(config(&[&a, &b, &c], &["eth_getBalance"]))).await;
    let consensus = proxy.proxy.group("main").unwrap().consensus().unwrap().clone();
    wait_until(|| consensus.snapshot().group == [0, 1]).await;
    assert_eq!(consensus.snapshot().latest, 0x101);

    for id in 0..6 {
        let reply =
            post(&proxy, &call("eth_getBalance", json!([ADDRESS, "latest"]), json!(id))).await;
        assert_ne!(reply.body["result"], "c");
    }
    assert!(c.calls_for("eth_getBalance").is_empty());
    assert!(!consensus.is_banned(2));
    proxy.shutdown().await;
}

#[tokio::test]
async fn head_never_moves_backwards() {
    let a = MockBackend::spawn("a").await;
    let b = MockBackend::spawn("b").await;
    let proxy = spawn(with_consensus(config(&[&a, &b], &["eth_getBalance"]))).await;
    let consensus = proxy.proxy.group("main").unwrap().consensus().unwrap().clone();
    wait_until(|| consensus.snapshot().latest == 0x101).await;

    // both nodes lag behind the published head without disagreeing on its hash
    for backend in [&a, &b] {
        backend.with_state(|state| state.latest = 0x100);
    }
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(consensus.snapshot().latest, 0x101);

    for backend in [&a, &b] {
        backend.with_state(|state| state.latest = 0x105);
    }
    wait_until(|| consensus.snapshot().latest == 0x105).await;
    proxy.shutdown().await;
}

#[tokio::test]
async fn divergence_below_head_falls_back_to_common_block() {
    let a = MockBackend::spawn("a").await;
    let b = MockBackend::spawn("b").await;
    let proxy = spawn(with_consensus(config(&[&a, &b], &["eth_getBalance"]))).await;
    let consensus = proxy.proxy.group("main").unwrap().consensus().unwrap().clone();

    // build a shared history one block at a time
    for latest in 0x102..=0x105 {
        for backend in [&a, &b] {
            backend.with_state(|state| state.latest = latest);
        }
        wait_until(|| consensus.snapshot().latest == latest).await;
    }

    // b reorgs the two most recent blocks away
    b.with_state(|state| {
        state.fork = 1;
        state.fork_from = 0x104;
    });
    wait_until(|| consensus.snapshot().latest == 0x103).await;
    let snapshot = consensus.snapshot();
    assert_eq!(snapshot.group, vec![0, 1]);
    assert_eq!(snapshot.latest_hash, Some(block_hash(0, 0x103).parse().unwrap()));
    assert!(b.calls_for("eth_getBlockByNumber").iter().any(|call| call["params"][0] == "0x104"));

    post(&proxy, &call("eth_getBalance", json!([ADDRESS, "latest"]), json!(1))).await;
    let tags: Vec<_> = a
        .calls_for("eth_getBalance")
        .into_iter()
        .chain(b.calls_for("eth_getBalance"))
        .map(|call| call["params"][1].clone())
        .collect();
    assert_eq!(tags, [json!("0x103")]);
    proxy.shutdown().await;
}
