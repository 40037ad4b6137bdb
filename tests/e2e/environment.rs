//! Mock backends and helpers to talk to a spawned proxy.

use axum::{
    Json, Router,
    body::Bytes,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post as route_post},
};
use parking_lot::Mutex;
use proxyd::{
    config::{BackendConfig, BackendGroupConfig, ProxydConfig},
    spawn::{ProxyHandle, try_spawn},
};
use reqwest::header::{CONTENT_TYPE, HeaderMap};
use serde_json::{Value, json};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use url::Url;

/// What a mock backend reports and how it behaves.
#[derive(Debug)]
pub struct MockState {
    pub latest: u64,
    pub safe: u64,
    pub finalized: u64,
    /// Salt mixed into block hashes, so that backends on different forks disagree.
    pub fork: u8,
    /// First block the fork salt applies to. Blocks below it are shared by every fork.
    pub fork_from: u64,
    /// Status returned instead of an answer.
    pub status: Option<StatusCode>,
    /// Results by method. Unknown methods are answered with the backend name.
    pub results: HashMap<String, Value>,
    /// Every call received, polling included.
    pub calls: Vec<Value>,
    /// Number of HTTP requests received.
    pub requests: usize,
}

/// An HTTP and websocket JSON-RPC server standing in for a node.
#[derive(Debug, Clone)]
pub struct MockBackend {
    pub name: String,
    pub url: Url,
    pub ws_url: Url,
    state: Arc<Mutex<MockState>>,
}

impl MockBackend {
    /// Spawns a backend at block `0x101`, safe `0xf0` and finalized `0xe0`.
    pub async fn spawn(name: &str) -> Self {
        let state = Arc::new(Mutex::new(MockState {
            latest: 0x101,
            safe: 0xf0,
            finalized: 0xe0,
            fork: 0,
            fork_from: 0,
            status: None,
            results: HashMap::new(),
            calls: Vec::new(),
            requests: 0,
        }));
        let backend = (name.to_string(), state.clone());
        let router = Router::new()
            .route("/", route_post(handle_http))
            .route("/ws", get(handle_ws))
            .with_state(backend);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, router).await });

        Self {
            name: name.to_string(),
            url: format!("http://{addr}").parse().unwrap(),
            ws_url: format!("ws://{addr}/ws").parse().unwrap(),
            state,
        }
    }

    /// Backend configuration pointing at this mock.
    pub fn config(&self) -> BackendConfig {
        BackendConfig::new(self.url.clone())
            .with_ws_url(self.ws_url.clone())
            .with_skip_peer_count(true)
    }

    /// Gives access to the mock state.
    pub fn with_state<T>(&self, f: impl FnOnce(&mut MockState) -> T) -> T {
        f(&mut self.state.lock())
    }

    /// Answers `method` with `result` from now on.
    pub fn set_result(&self, method: &str, result: Value) {
        self.with_state(|state| state.results.insert(method.to_string(), result));
    }

    /// Calls received for `method`.
    pub fn calls_for(&self, method: &str) -> Vec<Value> {
        self.with_state(|state| {
            state.calls.iter().filter(|call| call["method"] == method).cloned().collect()
        })
    }
}

type BackendState = (String, Arc<Mutex<MockState>>);

async fn handle_http(State((name, state)): State<BackendState>, body: Bytes) -> Response {
    let mut state = state.lock();
    state.requests += 1;
    if let Some(status) = state.status {
        return (status, "unavailable").into_response();
    }
    let payload: Value = serde_json::from_slice(&body).unwrap();
    let reply = match payload {
        Value::Array(calls) => {
            Value::Array(calls.iter().map(|call| answer(&name, &mut state, call)).collect())
        }
        call => answer(&name, &mut state, &call),
    };
    Json(reply).into_response()
}

async fn handle_ws(State(backend): State<BackendState>, upgrade: WebSocketUpgrade) -> Response {
    upgrade.on_upgrade(move |socket| serve_ws(backend, socket))
}

async fn serve_ws((name, state): BackendState, mut socket: WebSocket) {
    while let Some(Ok(Message::Text(text))) = socket.recv().await {
        let call: Value = serde_json::from_str(text.as_str()).unwrap();
        let reply = answer(&name, &mut state.lock(), &call);
        if socket.send(Message::Text(reply.to_string().into())).await.is_err() {
            break;
        }
    }
}

fn answer(name: &str, state: &mut MockState, call: &Value) -> Value {
    state.calls.push(call.clone());
    let method = call["method"].as_str().unwrap_or_default();
    let result = match method {
        "eth_getBlockByNumber" => {
            let number = match call["params"][0].as_str().unwrap_or_default() {
                "latest" => Some(state.latest),
                "safe" => Some(state.safe),
                "finalized" => Some(state.finalized),
                tag => u64::from_str_radix(tag.trim_start_matches("0x"), 16).ok(),
            };
            match number.filter(|number| *number <= state.latest) {
                Some(number) => {
                    let hash = |number: u64| {
                        let fork = if number >= state.fork_from { state.fork } else { 0 };
                        block_hash(fork, number)
                    };
                    json!({
                        "number": format!("{number:#x}"),
                        "hash": hash(number),
                        "parentHash": hash(number.saturating_sub(1)),
                    })
                }
                None => Value::Null,
            }
        }
        "eth_syncing" => json!(false),
        "net_peerCount" => json!("0x10"),
        method => state.results.get(method).cloned().unwrap_or_else(|| json!(name)),
    };
    json!({"jsonrpc": "2.0", "result": result, "id": call["id"]})
}

/// Hash of block `number` on fork `fork`.
pub fn block_hash(fork: u8, number: u64) -> String {
    format!("0x{fork:02x}{number:062x}")
}

/// A config with the proxy bound to an ephemeral port and one group named `main` over the given
/// backends, serving `methods`.
pub fn config(backends: &[&MockBackend], methods: &[&str]) -> ProxydConfig {
    let mut config = ProxydConfig::default().with_rpc_port(0);
    for backend in backends {
        config = config.with_backend(&backend.name, backend.config());
    }
    config
        .with_backend_group("main", BackendGroupConfig::new(backends.iter().map(|b| &b.name)))
        .with_method_mappings(methods.iter().copied(), "main")
}

/// Makes the `main` group consensus-aware with a fast poll.
pub fn with_consensus(mut config: ProxydConfig) -> ProxydConfig {
    let group = config.backend_groups.get_mut("main").unwrap();
    group.consensus_aware = true;
    group.consensus_poll_interval = Duration::from_millis(50);
    group.consensus_min_peer_count = 0;
    config
}

/// Spawns a proxy.
pub async fn spawn(config: ProxydConfig) -> ProxyHandle {
    try_spawn(config).await.unwrap()
}

/// Waits until `condition` holds, polling every 20ms for at most 5 seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..250 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not met in time");
}

/// Waits until the `main` group of the proxy has elected a consensus head.
pub async fn wait_for_consensus(handle: &ProxyHandle) {
    let consensus = handle.proxy.group("main").unwrap().consensus().unwrap().clone();
    wait_until(|| consensus.snapshot().has_head()).await;
}

/// A JSON-RPC call.
pub fn call(method: &str, params: Value, id: Value) -> Value {
    json!({"jsonrpc": "2.0", "method": method, "params": params, "id": id})
}

/// The answer of the proxy to an HTTP payload.
#[derive(Debug)]
pub struct Reply {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Value,
}

/// Posts a payload to `path` on the proxy.
pub async fn post_to(handle: &ProxyHandle, path: &str, payload: &Value) -> Reply {
    post_raw(handle, path, headers(), serde_json::to_vec(payload).unwrap()).await
}

/// Posts a payload to the proxy root.
pub async fn post(handle: &ProxyHandle, payload: &Value) -> Reply {
    post_to(handle, "/", payload).await
}

/// Posts raw bytes with the given headers.
pub async fn post_raw(
    handle: &ProxyHandle,
    path: &str,
    headers: HeaderMap,
    body: Vec<u8>,
) -> Reply {
    let response = reqwest::Client::new()
        .post(format!("{}{path}", handle.http_url()))
        .headers(headers)
        .body(body)
        .send()
        .await
        .unwrap();
    let status = StatusCode::from_u16(response.status().as_u16()).unwrap();
    let headers = response.headers().clone();
    let body = serde_json::from_slice(&response.bytes().await.unwrap()).unwrap();
    Reply { status, headers, body }
}

/// Default request headers.
pub fn headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, "application/json".parse().unwrap());
    headers
}
